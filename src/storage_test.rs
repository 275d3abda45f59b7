use std::fs;

use super::*;

fn temp_file(name: &str) -> fs::File {
    let mut path = std::env::temp_dir();
    path.push(name);
    fs::remove_file(&path).ok();
    fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .expect("open temp file")
}

#[test]
fn test_open_empty_file_has_no_root() {
    let fd = temp_file("cobtree.storage.open_empty");
    let mut storage = Storage::open(fd, Config::default()).expect("open");
    assert_eq!(storage.root().unwrap(), None);
}

#[test]
fn test_append_read_roundtrip() {
    let fd = temp_file("cobtree.storage.append_read");
    let mut storage = Storage::open(fd, Config::default()).expect("open");
    let addr = storage.append(b"payload").unwrap();
    assert!(addr >= SUPERBLOCK_SIZE);
    assert_eq!(storage.read(addr).unwrap(), b"payload".to_vec());
}

#[test]
fn test_commit_root_alternates_slots_and_survives_reopen() {
    let path = {
        let mut p = std::env::temp_dir();
        p.push("cobtree.storage.commit_reopen");
        p
    };
    fs::remove_file(&path).ok();
    let fd = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();

    let addr1;
    let addr2;
    {
        let mut storage = Storage::open(fd, Config::default()).expect("open");
        addr1 = storage.append(b"v1").unwrap();
        storage.commit_root(addr1).unwrap();
        assert_eq!(storage.root().unwrap(), Some(addr1));

        addr2 = storage.append(b"v2").unwrap();
        storage.commit_root(addr2).unwrap();
        assert_eq!(storage.root().unwrap(), Some(addr2));
    }

    // reopen: the most recent commit must survive.
    let fd = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let mut storage = Storage::open(fd, Config::default()).expect("reopen");
    assert_eq!(storage.root().unwrap(), Some(addr2));
    assert_eq!(storage.read(addr1).unwrap(), b"v1".to_vec());
    assert_eq!(storage.read(addr2).unwrap(), b"v2".to_vec());
}

#[test]
fn test_tampered_single_slot_falls_back_to_other() {
    let path = {
        let mut p = std::env::temp_dir();
        p.push("cobtree.storage.tampered_slot");
        p
    };
    fs::remove_file(&path).ok();
    let fd = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();

    let addr;
    {
        let mut storage = Storage::open(fd, Config::default()).expect("open");
        addr = storage.append(b"v1").unwrap();
        storage.commit_root(addr).unwrap();
    }

    // Corrupt slot A's checksum byte directly; slot B (written at
    // init time with sequence 0) is still present and should be
    // picked over slot A only if A decodes as invalid *and* B's
    // sequence is not lower — but since commit always rewrites the
    // older slot, slot B here still holds the stale sequence-0
    // all-empty root. This exercises read_valid_slot tolerating one
    // bad slot without asserting which root comes back, only that
    // opening does not error.
    let mut fd = fs::OpenOptions::new().write(true).open(&path).unwrap();
    use std::io::{Seek, SeekFrom, Write};
    fd.seek(SeekFrom::Start(16)).unwrap();
    fd.write_all(&[0xffu8; 8]).unwrap();
    drop(fd);

    let fd = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    let mut storage = Storage::open(fd, Config::default()).expect("open after single-slot tamper");
    // the log itself is untouched so the data blob is still readable
    assert_eq!(storage.read(addr).unwrap(), b"v1".to_vec());
}

#[test]
fn test_both_slots_corrupt_is_corrupt_log() {
    let path = {
        let mut p = std::env::temp_dir();
        p.push("cobtree.storage.both_corrupt");
        p
    };
    fs::remove_file(&path).ok();
    {
        let fd = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        Storage::open(fd, Config::default()).expect("open").commit_root(0).ok();
    }
    let mut fd = fs::OpenOptions::new().write(true).open(&path).unwrap();
    use std::io::{Seek, SeekFrom, Write};
    fd.seek(SeekFrom::Start(0)).unwrap();
    fd.write_all(&[0xffu8; SUPERBLOCK_SIZE as usize]).unwrap();
    drop(fd);

    let fd = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    match Storage::open(fd, Config::default()) {
        Err(Error::CorruptLog(_)) => (),
        Err(other) => panic!("expected CorruptLog, got {:?}", other),
        Ok(_) => panic!("expected CorruptLog, got Ok"),
    }
}
