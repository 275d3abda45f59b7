//! A persistent, single-file, copy-on-write B-tree key/value store.
//!
//! [`Store`] maps opaque byte-string keys to opaque byte-string values
//! and durably commits every `set`/`delete` to a single append-only
//! file: a read never blocks a writer and a writer never rewrites a
//! previously committed byte, only the root-pointer slot (see
//! [`storage`]). The B-tree itself (search, insert-and-split,
//! delete-and-rebalance) lives in [`btree`]; [`node`] is the lazy-load
//! / deferred-store indirection that lets the engine traverse a
//! partially-resident tree transparently.
//!
//! Out of scope: opening a store by path rather than by file handle,
//! iteration and range scans, multi-key transactions, and any
//! command-line surface — all left to callers built on top of this
//! crate.

mod btree;
mod error;
mod node;
mod storage;
mod util;

use std::fs;

pub use crate::error::{Error, Result};
pub use crate::storage::Config;

use crate::{node::NodeRef, storage::Storage};

/// A single open B-tree store.
///
/// `get` never changes which keys are visible, but it still takes
/// `&mut self`: resolving a [`NodeRef`]/`ValueRef` along the way caches
/// the decoded bytes in place so a repeated lookup skips the re-read.
/// `set`, `delete` and `commit` additionally rebuild the dirty spine
/// and publish a new root. All four match the single-writer,
/// many-reader concurrency model: only one `&mut Store` may exist for
/// a given file at a time, enforced outside this crate by however
/// callers share file handles.
pub struct Store {
    storage: Storage,
    root: Option<NodeRef>,
}

impl Store {
    /// Open a store over `file`, which must be positioned at byte 0.
    /// An empty file is initialized with a fresh, empty-tree
    /// superblock; a non-empty file without a valid superblock fails
    /// with `Error::CorruptLog`.
    pub fn open(file: fs::File, config: Config) -> Result<Store> {
        let mut storage = Storage::open(file, config)?;
        let root = match storage.root()? {
            Some(address) => Some(NodeRef::Address(address)),
            None => None,
        };
        Ok(Store { storage, root })
    }

    /// Look up `key`. Fails with `Error::KeyNotFound` if absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        btree::get(&mut self.root, &mut self.storage, key)
    }

    /// Insert `key` with `value`, or overwrite it if already present,
    /// and commit the resulting tree as the new root before returning.
    /// On failure `self.root` is left exactly as it was: the candidate
    /// tree `insert` builds is only adopted once `publish` confirms it
    /// is durably committed.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let candidate = btree::insert(&mut self.root, &mut self.storage, key.to_vec(), value.to_vec())?;
        self.publish(Some(candidate))
    }

    /// Remove `key` and commit the resulting tree as the new root
    /// before returning. Fails with `Error::KeyNotFound` if absent,
    /// leaving the store at its last committed state. As with `set`,
    /// a failure during `publish` leaves `self.root` untouched.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let candidate = btree::delete(&mut self.root, &mut self.storage, key)?;
        self.publish(candidate)
    }

    /// Re-store and re-commit the current root. `set` and `delete`
    /// already commit internally; exposed separately per the external
    /// interface, for a caller that wants to force a fresh commit
    /// without a preceding mutation.
    pub fn commit(&mut self) -> Result<()> {
        let candidate = self.root.clone();
        self.publish(candidate)
    }

    /// Store `candidate` (recursively persisting any dirty descendants)
    /// and publish its address as the new committed root. `self.root`
    /// is only reassigned after `storage.commit_root` returns `Ok` — if
    /// storing or committing fails partway, `self.root` still points at
    /// the last root this store actually published, matching the
    /// "abort without committing a new root" failure policy.
    fn publish(&mut self, mut candidate: Option<NodeRef>) -> Result<()> {
        let address = match &mut candidate {
            Some(node_ref) => node_ref.store(&mut self.storage)?,
            None => 0,
        };
        self.storage.commit_root(address)?;
        self.root = candidate;
        Ok(())
    }
}
