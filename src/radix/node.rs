use crate::{Result, StoreError};

/// Current node encoding version.
const NODE_VERSION: u8 = 1;

/// One edge from a node to a child.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ChildRef {
    /// Edge label; never empty.
    pub key_part: String,
    /// Record id of the child node.
    pub node_id: u32,
}

/// One tree node, persisted as a single log record.
///
/// `key_segment` mirrors the label of the edge pointing at the node (empty
/// for the root). Only `is_leaf` nodes carry a meaningful `value`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Node {
    pub key_segment: String,
    pub value: Vec<u8>,
    pub children: Vec<ChildRef>,
    pub is_leaf: bool,
}

impl Node {
    pub fn leaf(key_segment: String, value: Vec<u8>) -> Node {
        Node {
            key_segment,
            value,
            children: Vec::new(),
            is_leaf: true,
        }
    }

    pub fn interior(key_segment: String) -> Node {
        Node {
            key_segment,
            value: Vec::new(),
            children: Vec::new(),
            is_leaf: false,
        }
    }

    /// Index of the child whose edge label shares a prefix with `key`,
    /// together with the length in bytes of that common prefix. At most
    /// one child can match: sibling edge labels never share a prefix.
    pub fn matching_child(&self, key: &str) -> Option<(usize, usize)> {
        for (i, child) in self.children.iter().enumerate() {
            let common = common_prefix_len(&child.key_part, key);
            if common > 0 {
                return Some((i, common));
            }
        }
        None
    }

    /// Versioned binary form:
    /// `version(1B) ‖ segLen(LE 2B) ‖ seg ‖ valLen(LE 2B) ‖ val ‖
    ///  childCount(LE 2B) ‖ {partLen(LE 2B) ‖ part ‖ nodeId(LE 4B)}* ‖
    ///  isLeaf(1B)`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(8 + self.key_segment.len() + self.value.len());
        raw.push(NODE_VERSION);
        push_str(&mut raw, &self.key_segment)?;
        push_bytes(&mut raw, &self.value)?;
        raw.extend_from_slice(&checked_u16(self.children.len(), "child count")?.to_le_bytes());
        for child in &self.children {
            push_str(&mut raw, &child.key_part)?;
            raw.extend_from_slice(&child.node_id.to_le_bytes());
        }
        raw.push(self.is_leaf as u8);
        Ok(raw)
    }

    pub fn decode(raw: &[u8]) -> Result<Node> {
        let mut cursor = Cursor::new(raw);
        let version = cursor.take_u8()?;
        if version != NODE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unknown node version {}",
                version
            )));
        }
        let key_segment = cursor.take_str()?;
        let value = cursor.take_bytes()?;
        let child_count = cursor.take_u16()? as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let key_part = cursor.take_str()?;
            let node_id = cursor.take_u32()?;
            children.push(ChildRef { key_part, node_id });
        }
        let is_leaf = match cursor.take_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "bad leaf flag {} in node",
                    other
                )));
            }
        };
        cursor.expect_end()?;
        Ok(Node {
            key_segment,
            value,
            children,
            is_leaf,
        })
    }
}

/// Length in bytes of the longest common prefix of `a` and `b`, rounded
/// down to a character boundary of both.
pub(crate) fn common_prefix_len(a: &str, b: &str) -> usize {
    let mut len = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .take_while(|(x, y)| x == y)
        .count();
    while len > 0 && !(a.is_char_boundary(len) && b.is_char_boundary(len)) {
        len -= 1;
    }
    len
}

fn checked_u16(len: usize, what: &str) -> Result<u16> {
    if len > u16::max_value() as usize {
        return Err(StoreError::SizeExceeded(format!(
            "{} of {} does not fit a node record",
            what, len
        )));
    }
    Ok(len as u16)
}

fn push_bytes(raw: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    raw.extend_from_slice(&checked_u16(bytes.len(), "field length")?.to_le_bytes());
    raw.extend_from_slice(bytes);
    Ok(())
}

fn push_str(raw: &mut Vec<u8>, s: &str) -> Result<()> {
    push_bytes(raw, s.as_bytes())
}

struct Cursor<'a> {
    raw: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a [u8]) -> Cursor<'a> {
        Cursor { raw, at: 0 }
    }

    fn slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.raw.len() {
            return Err(StoreError::Corrupt("truncated node record".to_owned()));
        }
        let out = &self.raw[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.slice(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let raw = self.slice(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let raw = self.slice(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u16()? as usize;
        Ok(self.slice(len)?.to_vec())
    }

    fn take_str(&mut self) -> Result<String> {
        let raw = self.take_bytes()?;
        String::from_utf8(raw)
            .map_err(|_| StoreError::Corrupt("node field is not valid utf-8".to_owned()))
    }

    fn expect_end(&self) -> Result<()> {
        if self.at != self.raw.len() {
            return Err(StoreError::Corrupt(format!(
                "{} trailing bytes after node record",
                self.raw.len() - self.at
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() {
        let node = Node {
            key_segment: "abc".to_owned(),
            value: b"payload".to_vec(),
            children: vec![
                ChildRef {
                    key_part: "de".to_owned(),
                    node_id: 7,
                },
                ChildRef {
                    key_part: "xyz".to_owned(),
                    node_id: 19,
                },
            ],
            is_leaf: true,
        };
        let raw = node.encode().unwrap();
        assert_eq!(raw[0], NODE_VERSION);
        assert_eq!(Node::decode(&raw).unwrap(), node);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut raw = Node::interior(String::new()).encode().unwrap();
        raw[0] = 9;
        match Node::decode(&raw) {
            Err(StoreError::Corrupt(_)) => {}
            other => panic!("expected Corrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn decode_rejects_truncation() {
        let raw = Node::leaf("k".to_owned(), b"v".to_vec()).encode().unwrap();
        assert!(Node::decode(&raw[..raw.len() - 1]).is_err());
    }

    #[test]
    fn common_prefix_respects_char_boundaries() {
        assert_eq!(common_prefix_len("test/key1", "test/key2"), 8);
        assert_eq!(common_prefix_len("abc", "xyz"), 0);
        // 'é' and 'è' share their first utf-8 byte; the prefix must not
        // end inside the character.
        assert_eq!(common_prefix_len("é", "è"), 0);
    }
}
