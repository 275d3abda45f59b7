//! The append-only storage log: a single file whose first
//! [`SUPERBLOCK_SIZE`] bytes hold a double-write superblock (two root
//! slots, each sequenced and checksummed) and whose remaining bytes are
//! length-prefixed, immutable blobs.
//!
//! `commit_root` is the only operation that ever rewrites previously
//! written bytes, and it only ever rewrites whichever of the two slots
//! currently holds the older sequence number — the other slot keeps the
//! previously committed root intact until the next commit overwrites
//! it in turn. A crash mid-write leaves at least one slot with a valid
//! checksum, so recovery always finds a non-torn root.

use fs2::FileExt;
use log::{debug, trace};
use std::{
    fs,
    io::{Seek, SeekFrom, Write},
};

use crate::{
    error::{Error, Result},
    util,
};

/// Size of the header region. 4096 matches common filesystem block
/// sizes, keeping each superblock write a single aligned page.
pub(crate) const SUPERBLOCK_SIZE: u64 = 4096;
const SLOT_SIZE: u64 = SUPERBLOCK_SIZE / 2;
const SLOT_A_OFFSET: u64 = 0;
const SLOT_B_OFFSET: u64 = SLOT_SIZE;
const SLOT_RECORD_LEN: usize = 24; // sequence, root_address, checksum: 3 * u64

/// Tunable parameters for opening a store.
///
/// Not persisted: a file can be reopened with a different `Config` each
/// time, since these only govern how this handle behaves, not the
/// on-disk format.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the superblock header region, in bytes.
    ///
    /// Default: [`SUPERBLOCK_SIZE`]. Only the default is currently
    /// implemented; `open` rejects any other value, since the slot
    /// offsets are derived from this constant at compile time.
    pub superblock_size: u64,
    /// Whether `commit_root` calls `fsync` before and after writing the
    /// root slot.
    ///
    /// Default: `true`. Disabling this trades crash-safety for commit
    /// throughput and should only be used in tests.
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            superblock_size: SUPERBLOCK_SIZE,
            sync_on_commit: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    sequence: u64,
    root_address: u64,
}

impl Slot {
    fn checksum(&self) -> u64 {
        util::checksum64(&[self.sequence, self.root_address])
    }

    fn encode(&self) -> [u8; SLOT_RECORD_LEN] {
        let mut buf = [0u8; SLOT_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..16].copy_from_slice(&self.root_address.to_le_bytes());
        buf[16..24].copy_from_slice(&self.checksum().to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Slot> {
        if buf.len() < SLOT_RECORD_LEN {
            return None;
        }
        let sequence = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let root_address = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let checksum = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let slot = Slot {
            sequence,
            root_address,
        };
        if slot.checksum() == checksum {
            Some(slot)
        } else {
            None
        }
    }
}

/// The append-only byte log plus superblock. See module docs.
pub(crate) struct Storage {
    file: fs::File,
    sync_on_commit: bool,
}

impl Storage {
    /// Open a store over `file`, which must be positioned at byte 0.
    /// An empty file is initialized with a fresh, empty-tree
    /// superblock. A non-empty file must carry a valid superblock in
    /// at least one of its two slots, else this fails with
    /// `CorruptLog`.
    pub(crate) fn open(mut file: fs::File, config: Config) -> Result<Storage> {
        if config.superblock_size != SUPERBLOCK_SIZE {
            return Err(Error::InvariantViolation(format!(
                "unsupported superblock_size {}, only {} is implemented",
                config.superblock_size, SUPERBLOCK_SIZE
            )));
        }
        file.try_lock_exclusive().map_err(Error::Io)?;
        let len = file.metadata()?.len();
        if len == 0 {
            debug!("initializing fresh superblock");
            let slot = Slot {
                sequence: 0,
                root_address: 0,
            };
            let mut buf = vec![0u8; SUPERBLOCK_SIZE as usize];
            buf[..SLOT_RECORD_LEN].copy_from_slice(&slot.encode());
            buf[SLOT_SIZE as usize..SLOT_SIZE as usize + SLOT_RECORD_LEN]
                .copy_from_slice(&slot.encode());
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.sync_all()?;
        } else if len < SUPERBLOCK_SIZE {
            return Err(Error::CorruptLog(format!(
                "file too short for superblock: {} bytes",
                len
            )));
        } else {
            Self::read_valid_slot(&mut file)?;
        }
        Ok(Storage {
            file,
            sync_on_commit: config.sync_on_commit,
        })
    }

    fn read_slot(file: &mut fs::File, offset: u64) -> Result<Option<Slot>> {
        let buf = util::read_buffer(file, offset, SLOT_RECORD_LEN as u64, "superblock slot")?;
        Ok(Slot::decode(&buf))
    }

    fn read_valid_slot(file: &mut fs::File) -> Result<Slot> {
        let a = Self::read_slot(file, SLOT_A_OFFSET)?;
        let b = Self::read_slot(file, SLOT_B_OFFSET)?;
        match (a, b) {
            (Some(a), Some(b)) if a.sequence >= b.sequence => Ok(a),
            (Some(_), Some(b)) => Ok(b),
            (Some(a), None) => Ok(a),
            (None, Some(b)) => Ok(b),
            (None, None) => Err(Error::CorruptLog("no valid superblock slot".into())),
        }
    }

    /// The current root address, or `None` if the log has never been
    /// committed to (an empty tree).
    pub(crate) fn root(&mut self) -> Result<Option<u64>> {
        let slot = Self::read_valid_slot(&mut self.file)?;
        Ok(if slot.root_address == 0 {
            None
        } else {
            Some(slot.root_address)
        })
    }

    /// Append a length-prefixed blob at end-of-file, returning its
    /// address.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        util::append_blob(&mut self.file, bytes)
    }

    /// Read the blob at `address`.
    pub(crate) fn read(&mut self, address: u64) -> Result<Vec<u8>> {
        let len = self.file.metadata()?.len();
        util::read_blob(&mut self.file, address, len)
    }

    /// Atomically publish `address` as the new root. `address == 0`
    /// (never a valid blob address, since the blob region starts at
    /// [`SUPERBLOCK_SIZE`]) represents an empty tree.
    ///
    /// Data is flushed before the superblock write so a crash can
    /// never publish a root pointing at un-synced bytes, and the
    /// write targets whichever slot currently holds the older
    /// sequence number, leaving the other slot as a fallback.
    pub(crate) fn commit_root(&mut self, address: u64) -> Result<()> {
        if self.sync_on_commit {
            self.file.sync_all()?;
        }

        let a = Self::read_slot(&mut self.file, SLOT_A_OFFSET)?;
        let b = Self::read_slot(&mut self.file, SLOT_B_OFFSET)?;
        let (target_offset, current_seq) = match (a, b) {
            (Some(a), Some(b)) if a.sequence <= b.sequence => (SLOT_A_OFFSET, b.sequence),
            (Some(a), Some(b)) => (SLOT_B_OFFSET, a.sequence),
            (Some(a), None) => (SLOT_B_OFFSET, a.sequence),
            (None, Some(b)) => (SLOT_A_OFFSET, b.sequence),
            (None, None) => return Err(Error::CorruptLog("no valid superblock slot".into())),
        };
        let slot = Slot {
            sequence: current_seq + 1,
            root_address: address,
        };
        self.file.seek(SeekFrom::Start(target_offset))?;
        self.file.write_all(&slot.encode())?;
        if self.sync_on_commit {
            self.file.sync_all()?;
        }
        trace!("committed root {} at slot offset {}", address, target_offset);
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
