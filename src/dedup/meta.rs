use crate::{Result, StoreError};

/// One external claim on a stored blob: the owning subsystem and its own
/// id for the use site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reference {
    /// Owning subsystem.
    pub owner: u16,
    /// Owner-scoped id.
    pub id: u32,
}

impl Reference {
    /// Builds a reference from its parts.
    pub fn new(owner: u16, id: u32) -> Reference {
        Reference { owner, id }
    }

    /// 6-byte form: `owner` (LE 2B) followed by `id` (LE 4B).
    pub(crate) fn encode(self) -> [u8; 6] {
        let mut raw = [0u8; 6];
        raw[..2].copy_from_slice(&self.owner.to_le_bytes());
        raw[2..].copy_from_slice(&self.id.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8]) -> Reference {
        Reference {
            owner: u16::from_le_bytes([raw[0], raw[1]]),
            id: u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
        }
    }
}

/// Per-blob bookkeeping record: the blob's record id and the set of
/// references keeping it alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Metadata {
    pub id: u32,
    pub references: Vec<Reference>,
}

impl Metadata {
    /// `id` (LE 4B) followed by one 6-byte block per reference.
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(4 + 6 * self.references.len());
        raw.extend_from_slice(&self.id.to_le_bytes());
        for reference in &self.references {
            raw.extend_from_slice(&reference.encode());
        }
        raw
    }

    pub fn decode(raw: &[u8]) -> Result<Metadata> {
        if raw.len() < 4 || (raw.len() - 4) % 6 != 0 {
            return Err(StoreError::Corrupt(format!(
                "blob metadata record of {} bytes is malformed",
                raw.len()
            )));
        }
        let id = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let references = raw[4..].chunks(6).map(Reference::decode).collect();
        Ok(Metadata { id, references })
    }

    /// Adds `reference` if absent. Returns whether the set changed.
    pub fn add_reference(&mut self, reference: Reference) -> bool {
        if self.references.contains(&reference) {
            return false;
        }
        self.references.push(reference);
        true
    }

    /// Removes `reference` if present. Returns whether the set changed.
    pub fn remove_reference(&mut self, reference: Reference) -> bool {
        let before = self.references.len();
        self.references.retain(|r| *r != reference);
        self.references.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrip() {
        let meta = Metadata {
            id: 42,
            references: vec![Reference::new(1, 100), Reference::new(2, 7)],
        };
        let raw = meta.encode();
        assert_eq!(raw.len(), 4 + 2 * 6);
        assert_eq!(Metadata::decode(&raw).unwrap(), meta);
    }

    #[test]
    fn decode_rejects_ragged_length() {
        assert!(Metadata::decode(&[0u8; 7]).is_err());
        assert!(Metadata::decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn references_behave_as_a_set() {
        let mut meta = Metadata {
            id: 1,
            references: vec![],
        };
        assert!(meta.add_reference(Reference::new(1, 1)));
        assert!(!meta.add_reference(Reference::new(1, 1)));
        assert_eq!(meta.references.len(), 1);
        assert!(meta.remove_reference(Reference::new(1, 1)));
        assert!(!meta.remove_reference(Reference::new(1, 1)));
        assert!(meta.references.is_empty());
    }
}
