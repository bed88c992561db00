//! Persistent radix tree.
//!
//! String keys map to opaque byte values. Every node is one record in an
//! underlying append-only log, so mutations leave per-node history behind
//! and the tree survives reopen. The root always occupies record id 1.
//!
//! A key is the concatenation of edge labels from the root. Sibling edge
//! labels never share a prefix, so at most one child can continue any
//! walk; inserting a key that diverges in the middle of an edge splits
//! that edge.

use std::sync::{Arc, RwLock};

use crate::kvlog::{KvLog, LogConfig};
use crate::{Result, StoreError};

mod node;

use self::node::{common_prefix_len, ChildRef, Node};

/// Record id of the root node.
const ROOT_ID: u32 = 1;

/// A persistent radix tree over an append-only record log.
///
/// Clones share the same tree. Readers proceed in parallel; structural
/// mutations are exclusive.
#[derive(Clone)]
pub struct RadixTree {
    log: KvLog,
    lock: Arc<RwLock<()>>,
}

impl RadixTree {
    /// Opens the tree stored under `config.path`, creating the root node
    /// on first open. The log is forced into incremental mode: node ids
    /// are allocated by the log itself.
    pub fn open(mut config: LogConfig) -> Result<RadixTree> {
        config.incremental_mode = true;
        let log = KvLog::open(config)?;

        if !log.exists(ROOT_ID) {
            let root = Node::interior(String::new());
            let id = log.set(None, &root.encode()?)?;
            if id != ROOT_ID {
                return Err(StoreError::Corrupt(format!(
                    "radix store has no root but allocated id {}",
                    id
                )));
            }
        }

        Ok(RadixTree {
            log,
            lock: Arc::new(RwLock::new(())),
        })
    }

    /// Maps `key` to `value`, overwriting any previous value.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.lock.write().unwrap();

        let mut current_id = ROOT_ID;
        let mut current = self.read_node(current_id)?;
        let mut remaining = key;

        loop {
            if remaining.is_empty() {
                current.value = value.to_vec();
                current.is_leaf = true;
                return self.write_node(current_id, &current);
            }

            let (child_idx, common) = match current.matching_child(remaining) {
                Some(hit) => hit,
                None => {
                    // No edge shares a prefix: attach a fresh leaf. The
                    // leaf is written before the node that points at it.
                    let leaf = Node::leaf(remaining.to_owned(), value.to_vec());
                    let leaf_id = self.create_node(&leaf)?;
                    current.children.push(ChildRef {
                        key_part: remaining.to_owned(),
                        node_id: leaf_id,
                    });
                    return self.write_node(current_id, &current);
                }
            };

            let edge = current.children[child_idx].key_part.clone();
            let child_id = current.children[child_idx].node_id;

            if common == edge.len() {
                // The whole edge matches; descend.
                remaining = &remaining[common..];
                if remaining.is_empty() {
                    let mut target = self.read_node(child_id)?;
                    target.value = value.to_vec();
                    target.is_leaf = true;
                    return self.write_node(child_id, &target);
                }
                current_id = child_id;
                current = self.read_node(child_id)?;
            } else {
                // The key diverges inside the edge: split it. The child's
                // content moves to a new node reached by the edge suffix,
                // the child id itself becomes the interior junction, and
                // the edge on `current` shrinks to the common prefix.
                // Writes go bottom-up so no reachable pointer targets an
                // unwritten node.
                let suffix = edge[common..].to_owned();
                let moved = {
                    let old = self.read_node(child_id)?;
                    Node {
                        key_segment: suffix.clone(),
                        value: old.value,
                        children: old.children,
                        is_leaf: old.is_leaf,
                    }
                };
                let moved_id = self.create_node(&moved)?;

                let mut junction = Node::interior(edge[..common].to_owned());
                junction.children.push(ChildRef {
                    key_part: suffix,
                    node_id: moved_id,
                });
                self.write_node(child_id, &junction)?;

                current.children[child_idx].key_part = edge[..common].to_owned();
                self.write_node(current_id, &current)?;
                // Re-match from the same node; the shortened edge now
                // fully matches a prefix of `remaining`.
            }
        }
    }

    /// Value stored under exactly `key`.
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.read().unwrap();
        let (_, node) = self.lookup_node(key)?;
        if !node.is_leaf {
            return Err(StoreError::NotFound(format!("key {:?}", key)));
        }
        Ok(node.value)
    }

    /// Replaces the value of an existing key. Unlike [`RadixTree::set`]
    /// this never creates tree structure.
    pub fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let (id, mut node) = self.lookup_node(key)?;
        if !node.is_leaf {
            return Err(StoreError::NotFound(format!("key {:?}", key)));
        }
        node.value = value.to_vec();
        self.write_node(id, &node)
    }

    /// Removes `key`. A keyed node that still routes other keys only
    /// drops its leaf flag and value; a childless node is unlinked from
    /// its parent and its record deleted.
    pub fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap();

        let mut steps: Vec<(u32, usize)> = Vec::new();
        let mut current_id = ROOT_ID;
        let mut current = self.read_node(current_id)?;
        let mut remaining = key;
        while !remaining.is_empty() {
            let idx = current
                .children
                .iter()
                .position(|child| remaining.starts_with(child.key_part.as_str()))
                .ok_or_else(|| StoreError::NotFound(format!("key {:?}", key)))?;
            steps.push((current_id, idx));
            remaining = &remaining[current.children[idx].key_part.len()..];
            current_id = current.children[idx].node_id;
            current = self.read_node(current_id)?;
        }

        if !current.is_leaf {
            return Err(StoreError::NotFound(format!("key {:?}", key)));
        }

        if !current.children.is_empty() || current_id == ROOT_ID {
            current.is_leaf = false;
            current.value = Vec::new();
            return self.write_node(current_id, &current);
        }

        let (parent_id, child_idx) = steps.pop().expect("non-root node has a parent step");
        let mut parent = self.read_node(parent_id)?;
        parent.children.remove(child_idx);
        self.write_node(parent_id, &parent)?;
        self.log.delete(current_id)
    }

    /// All keys starting with `prefix`, in depth-first order. The empty
    /// prefix lists every key.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.lock.read().unwrap();
        let mut keys = Vec::new();
        self.collect(ROOT_ID, String::new(), prefix, &mut keys)?;
        Ok(keys)
    }

    /// Values of all keys starting with `prefix`, in [`RadixTree::list`]
    /// order.
    pub fn get_all(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        let keys = self.list(prefix)?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(&key)?);
        }
        Ok(values)
    }

    /// Flushes pending writes and snapshots the id lookup.
    pub fn save(&self) -> Result<()> {
        self.log.save()
    }

    /// Flushes and snapshots; the tree stays usable.
    pub fn close(&self) -> Result<()> {
        self.log.close()
    }

    /// Removes the backing store from disk.
    pub fn destroy(&self) -> Result<()> {
        self.log.destroy()
    }

    /// Walks the whole key, consuming full edges only.
    fn lookup_node(&self, key: &str) -> Result<(u32, Node)> {
        let mut current_id = ROOT_ID;
        let mut current = self.read_node(current_id)?;
        let mut remaining = key;
        while !remaining.is_empty() {
            let child = current
                .children
                .iter()
                .find(|child| remaining.starts_with(child.key_part.as_str()))
                .ok_or_else(|| StoreError::NotFound(format!("key {:?}", key)))?;
            remaining = &remaining[child.key_part.len()..];
            current_id = child.node_id;
            current = self.read_node(current_id)?;
        }
        Ok((current_id, current))
    }

    fn collect(&self, id: u32, built: String, prefix: &str, keys: &mut Vec<String>) -> Result<()> {
        let node = self.read_node(id)?;
        if node.is_leaf && built.starts_with(prefix) {
            keys.push(built.clone());
        }
        for child in &node.children {
            let next = format!("{}{}", built, child.key_part);
            // Descend only while the built key and the prefix can still
            // end up in a prefix relationship.
            let overlap = common_prefix_len(&next, prefix);
            if overlap == next.len() || overlap == prefix.len() {
                self.collect(child.node_id, next, prefix, keys)?;
            }
        }
        Ok(())
    }

    fn read_node(&self, id: u32) -> Result<Node> {
        Node::decode(&self.log.get(id)?)
    }

    fn write_node(&self, id: u32, node: &Node) -> Result<()> {
        self.log.set(Some(id), &node.encode()?)?;
        Ok(())
    }

    fn create_node(&self, node: &Node) -> Result<u32> {
        self.log.set(None, &node.encode()?)
    }
}
