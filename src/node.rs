//! B-tree nodes and the lazy-load / deferred-store reference layer.
//!
//! A [`Node`] holds its keys resident at all times; its children and its
//! value references are [`NodeRef`]/[`ValueRef`] handles that may be
//! address-only (not yet loaded), resident (not yet stored), or both
//! (loaded and unchanged since). `follow` resolves the address-only case
//! against the storage log; `store` resolves the resident case by
//! recursively persisting descendants before the node itself.

use crate::{
    error::{Error, Result},
    storage::Storage,
};

/// Branching factor: every non-root node carries between
/// `ceil(ORDER/2) - 1` and `ORDER - 1` keys.
pub(crate) const ORDER: usize = 256;

/// A value reference: either the value bytes themselves (not yet
/// written to the log), an address of an already-written value, or
/// both (read back from the log and cached).
#[derive(Debug)]
pub(crate) enum ValueRef {
    Resident(Vec<u8>),
    Address(u64),
    Cached(u64, Vec<u8>),
}

/// Cloning a reference snapshots its address, not its cache: a cloned
/// `Cached` becomes `Address`-only. Engine code clones a visited node
/// to get an owned copy it can freely mutate; the clone never needs
/// the cached bytes of an untouched child, only its address.
impl Clone for ValueRef {
    fn clone(&self) -> ValueRef {
        match self {
            ValueRef::Resident(bytes) => ValueRef::Resident(bytes.clone()),
            ValueRef::Address(addr) | ValueRef::Cached(addr, _) => ValueRef::Address(*addr),
        }
    }
}

impl ValueRef {
    pub(crate) fn new(value: Vec<u8>) -> ValueRef {
        ValueRef::Resident(value)
    }

    pub(crate) fn address(&self) -> Option<u64> {
        match self {
            ValueRef::Resident(_) => None,
            ValueRef::Address(addr) | ValueRef::Cached(addr, _) => Some(*addr),
        }
    }

    /// Resolve to the value bytes, reading from the log and caching on
    /// first access.
    pub(crate) fn follow(&mut self, storage: &mut Storage) -> Result<Vec<u8>> {
        if let ValueRef::Address(addr) = *self {
            let bytes = storage.read(addr)?;
            *self = ValueRef::Cached(addr, bytes);
        }
        match self {
            ValueRef::Resident(bytes) | ValueRef::Cached(_, bytes) => Ok(bytes.clone()),
            ValueRef::Address(_) => unreachable!("resolved above"),
        }
    }

    /// Ensure the value has an address, appending it to the log if it
    /// does not. No-op if already addressed.
    pub(crate) fn store(&mut self, storage: &mut Storage) -> Result<u64> {
        if let ValueRef::Resident(bytes) = self {
            let addr = storage.append(bytes)?;
            *self = ValueRef::Cached(addr, std::mem::take(bytes));
        }
        Ok(self.address().expect("value ref addressed after store"))
    }
}

impl PartialEq for ValueRef {
    fn eq(&self, other: &ValueRef) -> bool {
        match (self.address(), other.address()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (ValueRef::Resident(a), ValueRef::Resident(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// A B-tree node: parallel `keys`/`value_refs`, plus `children.len() ==
/// keys.len() + 1`. A node is a leaf iff every child slot is `None`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Node {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) value_refs: Vec<ValueRef>,
    pub(crate) children: Vec<Option<NodeRef>>,
}

impl Node {
    pub(crate) fn empty() -> Node {
        Node {
            keys: Vec::new(),
            value_refs: Vec::new(),
            children: vec![None],
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }

    /// Binary search for `key` among `self.keys`. `Ok(pos)` on an exact
    /// match, `Err(pos)` with `pos` the lower-bound insertion point
    /// otherwise.
    pub(crate) fn search_key(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.as_slice().cmp(key))
    }

    /// Serialize as a tagged binary record: key count, keys
    /// (length-prefixed), value addresses, child count, child markers
    /// (a presence byte followed by an address when present).
    ///
    /// Every value reference and child reference must already be
    /// addressed — callers store descendants before encoding the
    /// parent.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.keys.len() as u64).to_le_bytes());
        for key in &self.keys {
            buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
            buf.extend_from_slice(key);
        }
        for value_ref in &self.value_refs {
            let addr = value_ref
                .address()
                .expect("value ref must be stored before node is encoded");
            buf.extend_from_slice(&addr.to_le_bytes());
        }
        buf.extend_from_slice(&(self.children.len() as u64).to_le_bytes());
        for child in &self.children {
            match child {
                None => buf.push(0),
                Some(child_ref) => {
                    buf.push(1);
                    let addr = child_ref
                        .address()
                        .expect("child ref must be stored before node is encoded");
                    buf.extend_from_slice(&addr.to_le_bytes());
                }
            }
        }
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Node> {
        let mut pos = 0usize;
        let n_keys = read_u64(buf, &mut pos)? as usize;
        let mut keys = Vec::with_capacity(n_keys);
        for _ in 0..n_keys {
            let len = read_u64(buf, &mut pos)? as usize;
            keys.push(read_bytes(buf, &mut pos, len)?);
        }
        let mut value_refs = Vec::with_capacity(n_keys);
        for _ in 0..n_keys {
            value_refs.push(ValueRef::Address(read_u64(buf, &mut pos)?));
        }
        let n_children = read_u64(buf, &mut pos)? as usize;
        let mut children = Vec::with_capacity(n_children);
        for _ in 0..n_children {
            if pos >= buf.len() {
                return Err(Error::CorruptLog("truncated node record (children)".into()));
            }
            let flag = buf[pos];
            pos += 1;
            match flag {
                0 => children.push(None),
                1 => children.push(Some(NodeRef::Address(read_u64(buf, &mut pos)?))),
                other => {
                    return Err(Error::CorruptLog(format!("bad child marker {}", other)));
                }
            }
        }
        if children.len() != keys.len() + 1 {
            return Err(Error::CorruptLog(format!(
                "node has {} keys but {} children",
                keys.len(),
                children.len()
            )));
        }
        Ok(Node {
            keys,
            value_refs,
            children,
        })
    }
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    if *pos + 8 > buf.len() {
        return Err(Error::CorruptLog("truncated node record".into()));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    Ok(u64::from_le_bytes(arr))
}

fn read_bytes(buf: &[u8], pos: &mut usize, len: usize) -> Result<Vec<u8>> {
    if *pos + len > buf.len() {
        return Err(Error::CorruptLog("truncated node record (key)".into()));
    }
    let bytes = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(bytes)
}

/// A node reference: either an address-only handle to an on-log node,
/// a resident (dirty, address-less) node, or both (read back and
/// cached).
#[derive(Debug)]
pub(crate) enum NodeRef {
    Address(u64),
    Resident(Box<Node>),
    Cached(u64, Box<Node>),
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &NodeRef) -> bool {
        match (self.address(), other.address()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (NodeRef::Resident(a), NodeRef::Resident(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// As with `ValueRef`: cloning drops a cached node's bytes and keeps
/// only its address, since a clone exists to become part of a fresh,
/// independently mutable working copy, not to duplicate cached reads.
impl Clone for NodeRef {
    fn clone(&self) -> NodeRef {
        match self {
            NodeRef::Address(addr) | NodeRef::Cached(addr, _) => NodeRef::Address(*addr),
            NodeRef::Resident(node) => NodeRef::Resident(node.clone()),
        }
    }
}

impl NodeRef {
    pub(crate) fn resident(node: Node) -> NodeRef {
        NodeRef::Resident(Box::new(node))
    }

    pub(crate) fn address(&self) -> Option<u64> {
        match self {
            NodeRef::Resident(_) => None,
            NodeRef::Address(addr) | NodeRef::Cached(addr, _) => Some(*addr),
        }
    }

    /// Resolve to the referenced node, reading and caching on first
    /// access. Fails with `CorruptLog` if the blob does not decode.
    ///
    /// Returns a mutable borrow because the B-tree engine needs to index
    /// into `children`/`value_refs` to keep descending; nothing about a
    /// read-only traversal mutates the node itself (a cached node that
    /// is genuinely mutated is never re-stored in place — the engine
    /// always builds a fresh resident copy instead, per `NodeRef`'s
    /// `Clone` impl).
    pub(crate) fn follow<'a>(&'a mut self, storage: &mut Storage) -> Result<&'a mut Node> {
        if let NodeRef::Address(addr) = *self {
            let bytes = storage.read(addr)?;
            let node = Node::decode(&bytes)?;
            *self = NodeRef::Cached(addr, Box::new(node));
        }
        match self {
            NodeRef::Resident(node) | NodeRef::Cached(_, node) => Ok(node),
            NodeRef::Address(_) => unreachable!("resolved above"),
        }
    }

    /// Ensure this reference (and its entire resident subtree) is
    /// stored, recursively storing children and value references
    /// bottom-up before appending the node's own serialized bytes.
    /// No-op if already addressed.
    pub(crate) fn store(&mut self, storage: &mut Storage) -> Result<u64> {
        if let NodeRef::Resident(node) = self {
            for child in node.children.iter_mut().flatten() {
                child.store(storage)?;
            }
            for value_ref in node.value_refs.iter_mut() {
                value_ref.store(storage)?;
            }
            let mut buf = Vec::new();
            node.encode(&mut buf);
            let addr = storage.append(&buf)?;
            let node = match std::mem::replace(self, NodeRef::Address(addr)) {
                NodeRef::Resident(node) => node,
                _ => unreachable!(),
            };
            *self = NodeRef::Cached(addr, node);
        }
        Ok(self.address().expect("node ref addressed after store"))
    }
}

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
