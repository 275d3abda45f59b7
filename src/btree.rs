//! The B-tree algorithms: search, insert, delete, split, rotate and
//! merge, plus the ancestor-stack bookkeeping that makes rebalancing
//! work without relying on node identity.
//!
//! Every mutating entry point here follows the same shape: descend from
//! `root`, cloning each visited node into an owned, mutable working
//! copy (cheap — [`NodeRef::clone`] and [`ValueRef::clone`] drop cached
//! bytes and keep only addresses for anything untouched), mutate the
//! target, then splice the rebuilt target back up through the cloned
//! ancestors into a candidate new root. The original tree is never
//! touched in place; `insert`/`delete` hand the candidate back to the
//! caller rather than writing it into `*root` themselves, so a caller
//! can defer replacing the committed tree until the candidate is
//! actually durable.

use log::trace;

use crate::{
    error::{Error, Result},
    node::{Node, NodeRef, ValueRef, ORDER},
    storage::Storage,
};

/// One entry of the ancestor stack: an owned, mutable copy of a node
/// visited during descent, and the index of the child slot that was
/// followed to reach the next node down. Rebalancing identifies a
/// node's position in its parent by this index rather than by identity,
/// per the recommendation against relying on object identity.
struct Ancestor {
    node: Node,
    child_index: usize,
}

/// Result of descending the tree toward `key`.
struct Descent {
    found: bool,
    target: Node,
    position: usize,
    stack: Vec<Ancestor>,
}

fn min_keys() -> usize {
    (ORDER + 1) / 2 - 1
}

/// Descend from `root` toward `key`, building an ancestor stack of
/// owned node copies. An empty tree (`root == None`) synthesizes an
/// empty leaf as the not-found target with an empty stack, so callers
/// never special-case a missing root.
fn descend(root: &mut Option<NodeRef>, storage: &mut Storage, key: &[u8]) -> Result<Descent> {
    match root {
        None => Ok(Descent {
            found: false,
            target: Node::empty(),
            position: 0,
            stack: Vec::new(),
        }),
        Some(node_ref) => {
            let mut stack = Vec::new();
            let (found, target, position) = descend_rec(node_ref, storage, key, &mut stack)?;
            Ok(Descent {
                found,
                target,
                position,
                stack,
            })
        }
    }
}

fn descend_rec(
    node_ref: &mut NodeRef,
    storage: &mut Storage,
    key: &[u8],
    stack: &mut Vec<Ancestor>,
) -> Result<(bool, Node, usize)> {
    let node = node_ref.follow(storage)?;
    match node.search_key(key) {
        Ok(pos) => Ok((true, node.clone(), pos)),
        Err(pos) => {
            if node.children[pos].is_some() {
                let ancestor = node.clone();
                let child_ref = node.children[pos].as_mut().unwrap();
                stack.push(Ancestor {
                    node: ancestor,
                    child_index: pos,
                });
                descend_rec(child_ref, storage, key, stack)
            } else {
                Ok((false, node.clone(), pos))
            }
        }
    }
}

/// Walk always-left from `node_ref`'s subtree and return its leftmost
/// key — the successor of whatever key sits just before this subtree
/// in an internal node.
fn leftmost_key(node_ref: &mut NodeRef, storage: &mut Storage) -> Result<Vec<u8>> {
    let node = node_ref.follow(storage)?;
    if node.children[0].is_some() {
        leftmost_key(node.children[0].as_mut().unwrap(), storage)
    } else {
        node.keys
            .first()
            .cloned()
            .ok_or_else(|| Error::InvariantViolation("leaf has no keys".into()))
    }
}

/// Splice a mutated node back up through its ancestor stack, replacing
/// each ancestor's child slot with the rebuilt subtree below it.
fn rebuild(node: Node, mut stack: Vec<Ancestor>) -> NodeRef {
    let mut current = NodeRef::resident(node);
    while let Some(mut ancestor) = stack.pop() {
        ancestor.node.children[ancestor.child_index] = Some(current);
        current = NodeRef::resident(ancestor.node);
    }
    current
}

/// Look up `key`, following the value reference found at the leaf (or
/// internal separator) position. Fails with `KeyNotFound` if absent.
pub(crate) fn get(root: &mut Option<NodeRef>, storage: &mut Storage, key: &[u8]) -> Result<Vec<u8>> {
    let descent = descend(root, storage, key)?;
    if !descent.found {
        return Err(Error::KeyNotFound);
    }
    let mut value_ref = descent.target.value_refs[descent.position].clone();
    value_ref.follow(storage)
}

/// Insert or overwrite `key` with `value`, returning the resulting new,
/// entirely resident (unaddressed) candidate root. Does not touch
/// `*root` itself — `root` is only threaded through for lazy-load
/// traversal and caching during descent; the caller decides whether and
/// when the candidate actually replaces the committed tree.
pub(crate) fn insert(
    root: &mut Option<NodeRef>,
    storage: &mut Storage,
    key: Vec<u8>,
    value: Vec<u8>,
) -> Result<NodeRef> {
    let mut descent = descend(root, storage, &key)?;
    let new_root = if descent.found {
        descent.target.value_refs[descent.position] = ValueRef::new(value);
        rebuild(descent.target, descent.stack)
    } else {
        let pos = descent.position;
        descent.target.keys.insert(pos, key);
        descent.target.value_refs.insert(pos, ValueRef::new(value));
        descent.target.children.push(None);
        insert_and_split(descent.target, descent.stack)
    };
    Ok(new_root)
}

/// Split an overflowing node and promote its median into the parent,
/// recursing up the ancestor stack. Synthesizes a new root (growing the
/// tree by one level) when the stack is exhausted.
fn insert_and_split(mut node: Node, mut stack: Vec<Ancestor>) -> NodeRef {
    if node.children.len() <= ORDER {
        return rebuild(node, stack);
    }

    let mid = node.keys.len() / 2;
    let mut right_keys = node.keys.split_off(mid);
    let promoted_key = right_keys.remove(0);
    let mut right_value_refs = node.value_refs.split_off(mid);
    let promoted_value = right_value_refs.remove(0);
    let right_children = node.children.split_off(mid + 1);

    let left = node; // truncated in place above
    let right = Node {
        keys: right_keys,
        value_refs: right_value_refs,
        children: right_children,
    };
    trace!(
        "split node: {} keys left, {} keys right, promoting 1 key",
        left.keys.len(),
        right.keys.len()
    );

    match stack.pop() {
        Some(mut parent) => {
            let pos = parent.child_index;
            parent.node.keys.insert(pos, promoted_key);
            parent.node.value_refs.insert(pos, promoted_value);
            parent.node.children[pos] = Some(NodeRef::resident(right));
            parent.node.children.insert(pos, Some(NodeRef::resident(left)));
            insert_and_split(parent.node, stack)
        }
        None => {
            let mut root = Node::empty();
            root.keys.push(promoted_key);
            root.value_refs.push(promoted_value);
            root.children = vec![Some(NodeRef::resident(left)), Some(NodeRef::resident(right))];
            NodeRef::resident(root)
        }
    }
}

/// Remove `key`, returning the resulting new resident candidate root
/// (or `None` if the tree became empty). As with `insert`, `*root`
/// itself is left untouched; the caller applies the candidate only
/// once it considers the mutation durably committed.
pub(crate) fn delete(root: &mut Option<NodeRef>, storage: &mut Storage, key: &[u8]) -> Result<Option<NodeRef>> {
    let mut descent = descend(root, storage, key)?;
    if !descent.found {
        return Err(Error::KeyNotFound);
    }

    let mut new_root = if descent.target.is_leaf() {
        descent.target.keys.remove(descent.position);
        descent.target.value_refs.remove(descent.position);
        descent.target.children.pop();
        solve_underflow(descent.target, descent.stack, storage)?
    } else {
        let pos = descent.position;
        let successor_key = {
            let right_child = descent.target.children[pos + 1].as_mut().ok_or_else(|| {
                Error::InvariantViolation("internal node missing right child".into())
            })?;
            leftmost_key(right_child, storage)?
        };

        // Re-search from the true root for the successor key. Its path
        // shares the exact prefix of ancestors as the original descent
        // (the two keys diverge only at the node we just found), so
        // that node reappears at `descent.stack.len()` in this second
        // stack — this time as an ancestor of the successor's leaf.
        let mut descent2 = descend(root, storage, &successor_key)?;
        if !descent2.found || !descent2.target.is_leaf() {
            return Err(Error::InvariantViolation("successor key not found at a leaf".into()));
        }
        let idx = descent.stack.len();
        let ancestor = descent2.stack.get_mut(idx).ok_or_else(|| {
            Error::InvariantViolation("successor search shorter than original descent".into())
        })?;

        let successor_key = descent2.target.keys.remove(0);
        let successor_value = descent2.target.value_refs.remove(0);
        descent2.target.children.pop();

        ancestor.node.keys[pos] = successor_key;
        ancestor.node.value_refs[pos] = successor_value;

        solve_underflow(descent2.target, descent2.stack, storage)?
    };

    let collapse = new_root.follow(storage)?.keys.is_empty();
    let candidate = if collapse {
        new_root.follow(storage)?.children[0].take()
    } else {
        Some(new_root)
    };
    Ok(candidate)
}

/// Rebalance an underflowing node: rotate from a sibling with keys to
/// spare, or merge with a sibling and propagate the underflow upward.
/// A root is allowed to underflow freely; the caller collapses an
/// empty root to its sole child (or to an empty tree).
fn solve_underflow(mut node: Node, mut stack: Vec<Ancestor>, storage: &mut Storage) -> Result<NodeRef> {
    if stack.is_empty() {
        return Ok(NodeRef::resident(node));
    }
    if node.keys.len() >= min_keys() {
        return Ok(rebuild(node, stack));
    }

    let mut parent = stack.pop().unwrap();
    let pos = parent.child_index;
    let has_left = pos > 0;
    let has_right = pos + 1 < parent.node.children.len();

    if has_left {
        let left_len = parent.node.children[pos - 1]
            .as_mut()
            .unwrap()
            .follow(storage)?
            .keys
            .len();
        if left_len > min_keys() {
            let left_node = parent.node.children[pos - 1].as_mut().unwrap().follow(storage)?;
            let borrowed_key = left_node.keys.pop().unwrap();
            let borrowed_value = left_node.value_refs.pop().unwrap();
            let borrowed_child = left_node.children.pop().unwrap();

            let sep_key = std::mem::replace(&mut parent.node.keys[pos - 1], borrowed_key);
            let sep_value = std::mem::replace(&mut parent.node.value_refs[pos - 1], borrowed_value);
            node.keys.insert(0, sep_key);
            node.value_refs.insert(0, sep_value);
            node.children.insert(0, borrowed_child);

            trace!("rotated left into underflowing node at child index {}", pos);
            parent.node.children[pos] = Some(NodeRef::resident(node));
            return Ok(rebuild(parent.node, stack));
        }
    }

    if has_right {
        let right_len = parent.node.children[pos + 1]
            .as_mut()
            .unwrap()
            .follow(storage)?
            .keys
            .len();
        if right_len > min_keys() {
            let right_node = parent.node.children[pos + 1].as_mut().unwrap().follow(storage)?;
            let borrowed_key = right_node.keys.remove(0);
            let borrowed_value = right_node.value_refs.remove(0);
            let borrowed_child = right_node.children.remove(0);

            let sep_key = std::mem::replace(&mut parent.node.keys[pos], borrowed_key);
            let sep_value = std::mem::replace(&mut parent.node.value_refs[pos], borrowed_value);
            node.keys.push(sep_key);
            node.value_refs.push(sep_value);
            node.children.push(borrowed_child);

            trace!("rotated right into underflowing node at child index {}", pos);
            parent.node.children[pos] = Some(NodeRef::resident(node));
            return Ok(rebuild(parent.node, stack));
        }
    }

    if has_left {
        let mut sibling_ref = parent.node.children[pos - 1].take().unwrap();
        let sibling = take_resident(&mut sibling_ref, storage)?;
        let sep_key = parent.node.keys.remove(pos - 1);
        let sep_value = parent.node.value_refs.remove(pos - 1);
        parent.node.children.remove(pos);

        let mut merged = sibling;
        merged.keys.push(sep_key);
        merged.value_refs.push(sep_value);
        merged.keys.extend(node.keys);
        merged.value_refs.extend(node.value_refs);
        merged.children.extend(node.children);

        trace!("merged underflowing node into left sibling");
        parent.node.children[pos - 1] = Some(NodeRef::resident(merged));
        solve_underflow(parent.node, stack, storage)
    } else if has_right {
        let mut sibling_ref = parent.node.children[pos + 1].take().unwrap();
        let sibling = take_resident(&mut sibling_ref, storage)?;
        let sep_key = parent.node.keys.remove(pos);
        let sep_value = parent.node.value_refs.remove(pos);
        parent.node.children.remove(pos + 1);

        node.keys.push(sep_key);
        node.value_refs.push(sep_value);
        node.keys.extend(sibling.keys);
        node.value_refs.extend(sibling.value_refs);
        node.children.extend(sibling.children);

        trace!("merged right sibling into underflowing node");
        parent.node.children[pos] = Some(NodeRef::resident(node));
        solve_underflow(parent.node, stack, storage)
    } else {
        Err(Error::InvariantViolation(
            "underflowing node has neither left nor right sibling".into(),
        ))
    }
}

/// Resolve `node_ref` and take ownership of its node, consuming the
/// reference. Used when merging a sibling whose content is being
/// folded into another node and the reference itself is being dropped.
fn take_resident(node_ref: &mut NodeRef, storage: &mut Storage) -> Result<Node> {
    node_ref.follow(storage)?;
    match std::mem::replace(node_ref, NodeRef::Address(0)) {
        NodeRef::Resident(node) | NodeRef::Cached(_, node) => Ok(*node),
        NodeRef::Address(_) => unreachable!("resolved by follow"),
    }
}

#[cfg(test)]
#[path = "btree_test.rs"]
mod btree_test;
