// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Content-addressed node storage.
//!
//! The trie itself doesn't persist anything; every node lives in a [`Store`]
//! under its own hash. A mutation retires the entries of all replaced nodes
//! and indexes the replacements, so the store always describes exactly the
//! current tree.

use crate::hash::{MerkleHash, NodeHash};
use crate::node_type::Node;
use anyhow::{format_err, Result};
use backtrace::Backtrace;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// `Store` defines the interface between the trie and the underlying storage
/// holding nodes, keyed by their hashes.
///
/// Implementations are expected to provide their own interior mutability;
/// serializing concurrent writers is the caller's responsibility.
pub trait Store {
    /// Gets a node by hash. Returns an error if the node does not exist.
    fn get_node(&self, hash: &NodeHash) -> Result<Node> {
        self.get_node_option(hash)?.ok_or_else(|| {
            let backtrace = format!("{:#?}", Backtrace::new());
            debug!("backtrace: {}", backtrace);
            format_err!("Missing node at {:?}.", hash)
        })
    }

    /// Gets a node by hash. Returns `None` if the node does not exist.
    fn get_node_option(&self, hash: &NodeHash) -> Result<Option<Node>>;

    /// Indexes `node` under `hash`. Nodes are content-addressed, so setting
    /// the same hash twice writes identical content and must be accepted.
    fn set_node(&self, hash: NodeHash, node: Node) -> Result<()>;

    /// De-indexes the node at `hash`.
    fn delete_node(&self, hash: &NodeHash) -> Result<()>;
}

/// The pending writes of a single mutation. Nothing reaches the [`Store`]
/// until the whole replacement subtree has been computed, at which point the
/// batch is applied in one go.
#[derive(Clone, Debug, Default)]
pub(crate) struct UpdateBatch {
    fresh: Vec<(NodeHash, Node)>,
    stale: Vec<NodeHash>,
}

impl UpdateBatch {
    /// Records a freshly created node and returns its hash. Branch children
    /// are flattened to references, so recording is cheap.
    pub fn put(&mut self, node: &Node) -> NodeHash {
        let hash = node.merkle_hash();
        self.fresh.push((hash, node.to_stored()));
        hash
    }

    /// Records the hash of a replaced node.
    pub fn retire(&mut self, hash: NodeHash) {
        self.stale.push(hash);
    }

    /// Applies the batch: stale entries are deleted first, then fresh nodes
    /// are set. Fresh nodes were recorded children-first, so a node is never
    /// indexed before its children.
    pub fn apply<S: Store>(self, store: &S) -> Result<()> {
        for hash in &self.stale {
            store.delete_node(hash)?;
        }
        for (hash, node) in self.fresh {
            store.set_node(hash, node)?;
        }
        Ok(())
    }
}

/// A [`Store`] over a plain in-memory map.
#[derive(Default)]
pub struct InMemoryStore(RwLock<HashMap<NodeHash, Node>>);

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.0.read().len()
    }
}

impl Store for InMemoryStore {
    fn get_node_option(&self, hash: &NodeHash) -> Result<Option<Node>> {
        Ok(self.0.read().get(hash).cloned())
    }

    fn set_node(&self, hash: NodeHash, node: Node) -> Result<()> {
        self.0.write().insert(hash, node);
        Ok(())
    }

    fn delete_node(&self, hash: &NodeHash) -> Result<()> {
        self.0.write().remove(hash);
        Ok(())
    }
}
