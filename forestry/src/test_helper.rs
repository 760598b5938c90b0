// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use crate::hash::digest;
use crate::nibble_path::NibblePath;
use crate::node_type::Node;
use crate::{InMemoryStore, MerkleHash, Store, Trie};
use proptest::{collection::btree_map, collection::vec, prelude::*};

/// Random distinct key/value pairs; distinct keys imply distinct paths.
pub(crate) fn arb_kv_pairs(max: usize) -> impl Strategy<Value = Vec<(Vec<u8>, Vec<u8>)>> {
    btree_map(vec(any::<u8>(), 1..24), vec(any::<u8>(), 0..24), 1..max)
        .prop_map(|pairs| pairs.into_iter().collect())
}

/// Searches a deterministic key space for a key whose path satisfies `pred`.
pub(crate) fn find_key(pred: impl Fn(&NibblePath) -> bool) -> Vec<u8> {
    (0u32..100_000)
        .map(|i| format!("key-{}", i).into_bytes())
        .find(|key| pred(&NibblePath::new(digest(key).to_vec())))
        .expect("key space exhausted without a match")
}

pub(crate) fn path_of(key: &[u8]) -> NibblePath {
    NibblePath::new(digest(key).to_vec())
}

/// Walks the whole trie, checking structural invariants and returning the
/// number of nodes seen.
pub(crate) fn check_invariants(trie: &Trie<'_, InMemoryStore>) -> usize {
    match trie.root_node() {
        None => 0,
        Some(root) => check_node(root, 0),
    }
}

fn check_node(node: &Node, depth: usize) -> usize {
    match node {
        Node::Leaf(leaf) => {
            assert_eq!(
                depth + leaf.prefix().num_nibbles(),
                crate::PATH_NIBBLES,
                "leaf terminates at the wrong depth"
            );
            assert!(leaf.path().ends_with(leaf.prefix()));
            1
        }
        Node::Branch(branch) => {
            assert!(branch.children().num_children() >= 2);
            let below_depth = depth + branch.prefix().num_nibbles() + 1;
            let mut nodes = 1;
            let mut size = 0;
            for (_, child) in branch.children().occupied() {
                match child {
                    crate::ChildRef::Inline(child) => {
                        nodes += check_node(child, below_depth);
                        size += child.size();
                    }
                    crate::ChildRef::Ref(_) => panic!("expected a fully materialized trie"),
                }
            }
            assert_eq!(branch.size(), size, "branch size does not add up");
            nodes
        }
    }
}

/// The store of a single trie must hold exactly the nodes reachable from its
/// root, each under its own hash.
pub(crate) fn check_store_consistency(store: &InMemoryStore, trie: &Trie<'_, InMemoryStore>) {
    let nodes = check_invariants(trie);
    assert_eq!(store.num_nodes(), nodes, "store holds stale or missing nodes");
    if let Some(root) = trie.root_node() {
        check_stored_node(store, root);
    }
}

fn check_stored_node(store: &InMemoryStore, node: &Node) {
    let stored = store
        .get_node(&node.merkle_hash())
        .expect("node missing from store");
    assert_eq!(stored.merkle_hash(), node.merkle_hash());
    if let Node::Branch(branch) = node {
        for (_, child) in branch.children().occupied() {
            match child {
                crate::ChildRef::Inline(child) => check_stored_node(store, child),
                crate::ChildRef::Ref(_) => panic!("expected a fully materialized trie"),
            }
        }
    }
}
