use std::fs;

use super::*;
use crate::storage::{Config, Storage};

fn temp_storage(name: &str) -> Storage {
    let mut path = std::env::temp_dir();
    path.push(name);
    fs::remove_file(&path).ok();
    let fd = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .expect("open temp file");
    Storage::open(fd, Config::default()).expect("open storage")
}

#[test]
fn test_empty_node_is_leaf() {
    let node = Node::empty();
    assert!(node.is_leaf());
    assert_eq!(node.children.len(), 1);
    assert_eq!(node.search_key(b"x"), Err(0));
}

#[test]
fn test_search_key_binary_search() {
    let node = Node {
        keys: vec![b"b".to_vec(), b"d".to_vec(), b"f".to_vec()],
        value_refs: vec![
            ValueRef::new(b"2".to_vec()),
            ValueRef::new(b"4".to_vec()),
            ValueRef::new(b"6".to_vec()),
        ],
        children: vec![None, None, None, None],
    };
    assert_eq!(node.search_key(b"d"), Ok(1));
    assert_eq!(node.search_key(b"a"), Err(0));
    assert_eq!(node.search_key(b"c"), Err(1));
    assert_eq!(node.search_key(b"z"), Err(3));
}

#[test]
fn test_value_ref_store_then_follow() {
    let mut storage = temp_storage("cobtree.node.value_store_follow");
    let mut vref = ValueRef::new(b"hello".to_vec());
    let addr = vref.store(&mut storage).unwrap();
    assert_eq!(vref.address(), Some(addr));
    assert_eq!(vref.follow(&mut storage).unwrap(), b"hello".to_vec());

    // a second store is a no-op: same address.
    assert_eq!(vref.store(&mut storage).unwrap(), addr);
}

#[test]
fn test_node_store_then_reload_leaf() {
    let mut storage = temp_storage("cobtree.node.store_reload_leaf");
    let leaf = Node {
        keys: vec![b"a".to_vec(), b"b".to_vec()],
        value_refs: vec![ValueRef::new(b"1".to_vec()), ValueRef::new(b"2".to_vec())],
        children: vec![None, None, None],
    };
    let mut node_ref = NodeRef::resident(leaf);
    let addr = node_ref.store(&mut storage).unwrap();

    let mut reloaded = NodeRef::Address(addr);
    let node = reloaded.follow(&mut storage).unwrap();
    assert_eq!(node.keys, vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(node.is_leaf());
    let v0 = node.value_refs[0].clone().follow(&mut storage).unwrap();
    assert_eq!(v0, b"1".to_vec());
}

#[test]
fn test_node_store_recurses_into_children() {
    let mut storage = temp_storage("cobtree.node.store_recurses");
    let left = Node {
        keys: vec![b"a".to_vec()],
        value_refs: vec![ValueRef::new(b"1".to_vec())],
        children: vec![None, None],
    };
    let right = Node {
        keys: vec![b"c".to_vec()],
        value_refs: vec![ValueRef::new(b"3".to_vec())],
        children: vec![None, None],
    };
    let root = Node {
        keys: vec![b"b".to_vec()],
        value_refs: vec![ValueRef::new(b"2".to_vec())],
        children: vec![Some(NodeRef::resident(left)), Some(NodeRef::resident(right))],
    };
    let mut root_ref = NodeRef::resident(root);
    let root_addr = root_ref.store(&mut storage).unwrap();

    let mut reloaded_root = NodeRef::Address(root_addr);
    let root_node = reloaded_root.follow(&mut storage).unwrap();
    assert!(!root_node.is_leaf());
    assert_eq!(root_node.children.len(), 2);

    let left_addr = root_node.children[0].as_ref().unwrap().address().unwrap();
    let mut left_ref = NodeRef::Address(left_addr);
    let left_node = left_ref.follow(&mut storage).unwrap();
    assert_eq!(left_node.keys, vec![b"a".to_vec()]);
}

#[test]
fn test_encode_decode_roundtrip_matches_addressed_node() {
    let mut storage = temp_storage("cobtree.node.roundtrip");
    let leaf = Node {
        keys: vec![b"k1".to_vec(), b"k2".to_vec()],
        value_refs: vec![ValueRef::new(b"v1".to_vec()), ValueRef::new(b"v2".to_vec())],
        children: vec![None, None, None],
    };
    let mut node_ref = NodeRef::resident(leaf);
    node_ref.store(&mut storage).unwrap();

    // node_ref is now Cached(addr, node); re-decode independently and
    // compare. Equality for NodeRef/ValueRef compares addresses once
    // both sides are addressed, which is exactly the round-trip
    // property this exercises.
    let addr = node_ref.address().unwrap();
    let bytes = storage.read(addr).unwrap();
    let decoded = Node::decode(&bytes).unwrap();

    let original = match &node_ref {
        NodeRef::Cached(_, node) => (**node).clone(),
        _ => unreachable!(),
    };
    assert_eq!(original, decoded);
}

#[test]
fn test_decode_rejects_children_key_mismatch() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1u64.to_le_bytes()); // 1 key
    buf.extend_from_slice(&1u64.to_le_bytes()); // key len 1
    buf.push(b'a');
    buf.extend_from_slice(&0u64.to_le_bytes()); // value address
    buf.extend_from_slice(&3u64.to_le_bytes()); // 3 children (should be 2)
    buf.push(0);
    buf.push(0);
    buf.push(0);
    match Node::decode(&buf) {
        Err(Error::CorruptLog(_)) => (),
        other => panic!("expected CorruptLog, got {:?}", other),
    }
}
