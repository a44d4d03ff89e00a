//! Dotted-path lookup over value trees.
//!
//! `"Name..Inner.Leaf"` addresses a node by name: a literal segment matches a
//! child by name at the current depth, an empty segment (`..`) matches any
//! number of intermediate levels. Matching is greedy, first-child-first,
//! depth-first.

use crate::schema::SchemaType;
use crate::tag::Tag;
use crate::tree::{NodeId, ValueTree};

/// Finds the node addressed by `path`, whose first segment names `from`
/// itself.
pub fn find(tree: &ValueTree, from: NodeId, path: &str) -> Option<NodeId> {
    let segs: Vec<&str> = path.split('.').collect();
    let (first, rest) = segs.split_first()?;
    if tree.name(from) != Some(*first) {
        return None;
    }
    find_below(tree, from, rest)
}

fn find_below(tree: &ValueTree, parent: NodeId, segs: &[&str]) -> Option<NodeId> {
    let Some((first, rest)) = segs.split_first() else {
        return Some(parent);
    };

    if first.is_empty() {
        find_any_depth(tree, parent, rest)
    } else {
        let child = tree.children(parent).find(|&c| tree.name(c) == Some(*first))?;
        find_below(tree, child, rest)
    }
}

fn find_any_depth(tree: &ValueTree, parent: NodeId, segs: &[&str]) -> Option<NodeId> {
    let (first, rest) = segs.split_first()?;
    for child in tree.children(parent) {
        if tree.name(child) == Some(*first) {
            if let Some(found) = find_below(tree, child, rest) {
                return Some(found);
            }
        }
        if let Some(found) = find_any_depth(tree, child, segs) {
            return Some(found);
        }
    }
    None
}

/// Finds the `nth` (0-indexed) present `SEQUENCE` below `from` whose first
/// child is an OID with content `oid`.
pub fn find_type_value(tree: &ValueTree, from: NodeId, nth: usize, oid: &[u8]) -> Option<NodeId> {
    let mut seen = 0usize;
    find_type_value_below(tree, from, nth, oid, &mut seen)
}

fn find_type_value_below(
    tree: &ValueTree,
    parent: NodeId,
    nth: usize,
    oid: &[u8],
    seen: &mut usize,
) -> Option<NodeId> {
    for child in tree.children(parent) {
        if tree.ty(child) == SchemaType::Sequence && tree.is_present(child) {
            if let Some(first) = tree.first_child(child) {
                let is_oid = tree.value_type(first) == Some(Tag::OID)
                    && tree.content(first).is_some_and(|c| c == oid);
                if is_oid {
                    if *seen == nth {
                        return Some(child);
                    }
                    *seen += 1;
                }
            }
        }
        if let Some(found) = find_type_value_below(tree, child, nth, oid, seen) {
            return Some(found);
        }
    }
    None
}
