// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The trie: a radix-16 Patricia trie over hashed keys, with Merkle
//! aggregation at every branch.
//!
//! A [`Trie`] borrows its backing [`Store`] and keeps the current root node
//! in memory; children loaded from the store stay as references until a
//! descent touches them. All mutations are computed fully in memory and then
//! committed to the store as one batch, children first, so the store never
//! sees a node whose children are not final.

use crate::hash::{digest, MerkleHash, NodeHash, DIGEST_LENGTH, NULL_HASH};
use crate::nibble::Nibble;
use crate::nibble_path::{skip_common_prefix, NibbleIterator, NibblePath};
use crate::node_type::{merkle_siblings, BranchNode, ChildRef, Children, Node};
use crate::proof::{ForkNeighbor, LeafNeighbor, Proof, Step};
use crate::store::{Store, UpdateBatch};
use crate::{Error, Result};
use std::fmt;
use tracing::debug;

/// Number of nibbles in a full path: the hex expansion of a key digest.
pub const PATH_NIBBLES: usize = DIGEST_LENGTH * 2;

/// An authenticated key/value map backed by a content-addressed [`Store`].
pub struct Trie<'a, S> {
    store: &'a S,
    root: Option<Node>,
}

impl<'a, S> Clone for Trie<'a, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            root: self.root.clone(),
        }
    }
}

impl<'a, S> fmt::Debug for Trie<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trie")
            .field("root", &self.root.as_ref().map(MerkleHash::merkle_hash))
            .field("size", &self.root.as_ref().map_or(0, Node::size))
            .finish()
    }
}

impl<'a, S: Store> Trie<'a, S> {
    /// Creates an empty trie on top of `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store, root: None }
    }

    /// Builds a trie from a batch of key/value pairs, factoring out common
    /// prefixes recursively, and persists every node. Fails with
    /// [`Error::AlreadyPresent`] if two keys share a path.
    pub fn from_list<K, V, I>(store: &'a S, pairs: I) -> Result<Self>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut items: Vec<(NibblePath, Vec<u8>, Vec<u8>)> = pairs
            .into_iter()
            .map(|(key, value)| {
                let key = key.as_ref().to_vec();
                let path = Self::path_of(&key);
                (path, key, value.as_ref().to_vec())
            })
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        if items.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(Error::AlreadyPresent);
        }

        let mut batch = UpdateBatch::default();
        let root = if items.is_empty() {
            None
        } else {
            Some(Self::build(&items, 0, &mut batch))
        };
        batch.apply(store)?;
        Ok(Self { store, root })
    }

    fn build(
        items: &[(NibblePath, Vec<u8>, Vec<u8>)],
        depth: usize,
        batch: &mut UpdateBatch,
    ) -> Node {
        debug_assert!(!items.is_empty());
        if let [(path, key, value)] = items {
            let leaf = Node::new_leaf(
                path.sub_path(depth, path.num_nibbles()),
                key.clone(),
                value.clone(),
            );
            batch.put(&leaf);
            return leaf;
        }

        // Length of the prefix shared by every path below `depth`.
        let first = &items[0].0;
        let mut num_common = 0;
        'scan: loop {
            let i = depth + num_common;
            if i >= first.num_nibbles() {
                break;
            }
            let nibble = first.get_nibble(i);
            for (path, _, _) in &items[1..] {
                if path.get_nibble(i) != nibble {
                    break 'scan;
                }
            }
            num_common += 1;
        }
        let prefix = first.sub_path(depth, depth + num_common);
        let branch_depth = depth + num_common;

        // Paths are sorted, so each child slot is a contiguous run.
        let mut children = Children::default();
        let mut size = 0u64;
        let mut start = 0;
        while start < items.len() {
            let nibble = items[start].0.get_nibble(branch_depth);
            let end = items[start..]
                .iter()
                .position(|(path, _, _)| path.get_nibble(branch_depth) != nibble)
                .map_or(items.len(), |offset| start + offset);
            let child = Self::build(&items[start..end], branch_depth + 1, batch);
            size += child.size();
            children.set(nibble, ChildRef::from(child));
            start = end;
        }

        let branch = Node::new_branch(prefix, children, size);
        batch.put(&branch);
        branch
    }

    /// Recovers a trie from its root hash. Children stay as references until
    /// a descent materializes them.
    pub fn from_root(store: &'a S, root: NodeHash) -> Result<Self> {
        if root == NULL_HASH {
            return Ok(Self::new(store));
        }
        let node = store.get_node(&root)?;
        if node.merkle_hash() != root {
            return Err(anyhow::format_err!(
                "store returned a node hashing to {:?} for {:?}",
                node.merkle_hash(),
                root
            )
            .into());
        }
        Ok(Self {
            store,
            root: Some(node),
        })
    }

    /// The root hash; [`NULL_HASH`] for the empty trie.
    pub fn hash(&self) -> NodeHash {
        self.root.as_ref().map_or(NULL_HASH, MerkleHash::merkle_hash)
    }

    /// Number of key/value pairs held.
    pub fn size(&self) -> u64 {
        self.root.as_ref().map_or(0, Node::size)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The root node, if any.
    pub fn root_node(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    /// Looks a key up, returning its value if present.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let path = Self::path_of(key.as_ref());
        let mut nibble_iter = path.nibbles();
        Self::get_at(self.store, root, &mut nibble_iter)
    }

    fn get_at(store: &S, node: &Node, nibble_iter: &mut NibbleIterator) -> Result<Option<Vec<u8>>> {
        match node {
            Node::Leaf(leaf) => {
                let mut prefix_iter = leaf.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                Ok((nibble_iter.is_finished() && prefix_iter.is_finished())
                    .then(|| leaf.value().to_vec()))
            }
            Node::Branch(branch) => {
                let mut prefix_iter = branch.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !prefix_iter.is_finished() {
                    return Ok(None);
                }
                let index = nibble_iter.next().expect("path is longer than any prefix");
                match branch.child(index) {
                    None => Ok(None),
                    Some(child) => {
                        let child = child.resolve(store)?;
                        Self::get_at(store, &child, nibble_iter)
                    }
                }
            }
        }
    }

    /// Inserts a key/value pair, rehashing and re-indexing every node on the
    /// descent path. Fails with [`Error::AlreadyPresent`] if the key is bound
    /// already, leaving the trie untouched.
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let key = key.as_ref().to_vec();
        let value = value.as_ref().to_vec();
        let path = Self::path_of(&key);
        let mut batch = UpdateBatch::default();
        if self.root.is_none() {
            let leaf = Node::new_leaf(path, key, value);
            batch.put(&leaf);
            batch.apply(self.store)?;
            self.root = Some(leaf);
        } else {
            let root = self.root.as_mut().expect("root checked above");
            let mut nibble_iter = path.nibbles();
            Self::insert_at(self.store, root, &mut nibble_iter, &key, &value, &mut batch)?;
            batch.apply(self.store)?;
        }
        debug!(size = self.size(), root = %self.hash(), "inserted key");
        Ok(())
    }

    fn insert_at(
        store: &S,
        node: &mut Node,
        nibble_iter: &mut NibbleIterator,
        key: &[u8],
        value: &[u8],
        batch: &mut UpdateBatch,
    ) -> Result<()> {
        let old_hash = node.merkle_hash();
        match node {
            Node::Leaf(leaf) => {
                let mut prefix_iter = leaf.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if prefix_iter.is_finished() {
                    // Same path, same key digest: the key is already bound.
                    debug_assert!(nibble_iter.is_finished());
                    return Err(Error::AlreadyPresent);
                }

                // The existing leaf and the new key fork below a fresh branch
                // holding their common prefix.
                let common: NibblePath = prefix_iter.visited_nibbles().collect();
                let existing_index = prefix_iter.next().expect("diverging nibble must exist");
                let existing_leaf = Node::new_leaf(
                    prefix_iter.remaining_nibbles().collect(),
                    leaf.key().to_vec(),
                    leaf.value().to_vec(),
                );
                let new_index = nibble_iter.next().expect("paths have equal length");
                let new_leaf = Node::new_leaf(
                    nibble_iter.remaining_nibbles().collect(),
                    key.to_vec(),
                    value.to_vec(),
                );
                debug_assert_ne!(existing_index, new_index);
                batch.put(&existing_leaf);
                batch.put(&new_leaf);
                let mut children = Children::default();
                children.set(existing_index, ChildRef::from(existing_leaf));
                children.set(new_index, ChildRef::from(new_leaf));
                *node = Node::new_branch(common, children, 2);
            }
            Node::Branch(branch) => {
                let mut prefix_iter = branch.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !prefix_iter.is_finished() {
                    // The new path diverges inside this branch's prefix: push
                    // the branch one level down under a fresh parent.
                    let common: NibblePath = prefix_iter.visited_nibbles().collect();
                    let existing_index = prefix_iter.next().expect("diverging nibble must exist");
                    let shortened_prefix: NibblePath = prefix_iter.remaining_nibbles().collect();
                    let size = branch.size();
                    let shortened =
                        Node::new_branch(shortened_prefix, branch.take_children(), size);
                    batch.put(&shortened);
                    let new_index = nibble_iter
                        .next()
                        .expect("path is longer than any branch prefix");
                    let new_leaf = Node::new_leaf(
                        nibble_iter.remaining_nibbles().collect(),
                        key.to_vec(),
                        value.to_vec(),
                    );
                    batch.put(&new_leaf);
                    let mut children = Children::default();
                    children.set(existing_index, ChildRef::from(shortened));
                    children.set(new_index, ChildRef::from(new_leaf));
                    *node = Node::new_branch(common, children, size + 1);
                } else {
                    let index = nibble_iter
                        .next()
                        .expect("path is longer than any branch prefix");
                    if branch.child(index).is_some() {
                        let child = branch
                            .child_mut(index)
                            .expect("slot checked above")
                            .materialize(store)?;
                        Self::insert_at(store, child, nibble_iter, key, value, batch)?;
                    } else {
                        let leaf = Node::new_leaf(
                            nibble_iter.remaining_nibbles().collect(),
                            key.to_vec(),
                            value.to_vec(),
                        );
                        batch.put(&leaf);
                        branch.set_child(index, ChildRef::from(leaf));
                    }
                    branch.set_size(branch.size() + 1);
                }
            }
        }
        batch.retire(old_hash);
        batch.put(node);
        Ok(())
    }

    /// Deletes a key, the mirror of [`insert`](Self::insert): the leaf is
    /// removed and a branch left with a single child collapses into it.
    /// Fails with [`Error::NotPresent`] if the key is not bound.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<()> {
        let path = Self::path_of(key.as_ref());
        let Some(root) = self.root.as_mut() else {
            return Err(Error::NotPresent);
        };
        let mut batch = UpdateBatch::default();
        let mut nibble_iter = path.nibbles();
        if let RemoveOutcome::Removed =
            Self::remove_at(self.store, root, &mut nibble_iter, &mut batch)?
        {
            self.root = None;
        }
        batch.apply(self.store)?;
        debug!(size = self.size(), root = %self.hash(), "deleted key");
        Ok(())
    }

    fn remove_at(
        store: &S,
        node: &mut Node,
        nibble_iter: &mut NibbleIterator,
        batch: &mut UpdateBatch,
    ) -> Result<RemoveOutcome> {
        let old_hash = node.merkle_hash();
        match node {
            Node::Leaf(leaf) => {
                let mut prefix_iter = leaf.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !(nibble_iter.is_finished() && prefix_iter.is_finished()) {
                    return Err(Error::NotPresent);
                }
                batch.retire(old_hash);
                Ok(RemoveOutcome::Removed)
            }
            Node::Branch(branch) => {
                let mut prefix_iter = branch.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !prefix_iter.is_finished() {
                    return Err(Error::NotPresent);
                }
                let index = nibble_iter
                    .next()
                    .expect("path is longer than any branch prefix");
                if branch.child(index).is_none() {
                    return Err(Error::NotPresent);
                }
                let child = branch
                    .child_mut(index)
                    .expect("slot checked above")
                    .materialize(store)?;
                match Self::remove_at(store, child, nibble_iter, batch)? {
                    RemoveOutcome::Replaced => {
                        branch.set_size(branch.size() - 1);
                    }
                    RemoveOutcome::Removed => {
                        branch.remove_child(index);
                        if branch.children().num_children() >= 2 {
                            branch.set_size(branch.size() - 1);
                        } else {
                            // A single child is left: it absorbs this
                            // branch's prefix and the nibble it hung from.
                            let nibble = branch
                                .children()
                                .occupied()
                                .next()
                                .map(|(nibble, _)| nibble)
                                .expect("a branch holds at least two children");
                            let mut only = branch.remove_child(nibble).expect("slot occupied");
                            let only_node = only.materialize(store)?;
                            batch.retire(only_node.merkle_hash());
                            let mut merged_prefix = branch.prefix().clone();
                            merged_prefix.push(nibble);
                            for n in only_node.prefix().nibbles() {
                                merged_prefix.push(n);
                            }
                            let merged = match only_node {
                                Node::Leaf(leaf) => Node::new_leaf(
                                    merged_prefix,
                                    leaf.key().to_vec(),
                                    leaf.value().to_vec(),
                                ),
                                Node::Branch(inner) => Node::new_branch(
                                    merged_prefix,
                                    inner.take_children(),
                                    inner.size(),
                                ),
                            };
                            *node = merged;
                        }
                    }
                }
                batch.retire(old_hash);
                batch.put(node);
                Ok(RemoveOutcome::Replaced)
            }
        }
    }

    /// Builds a membership proof for `key`. Fails with
    /// [`Error::NotPresent`] if the key is not bound.
    pub fn prove(&self, key: impl AsRef<[u8]>) -> Result<Proof> {
        let root = self.root.as_ref().ok_or(Error::NotPresent)?;
        let path = Self::path_of(key.as_ref());
        let mut nibble_iter = path.nibbles();
        let mut steps = Vec::new();
        let value = Self::prove_at(self.store, root, &mut nibble_iter, &mut steps)?;
        steps.reverse();
        debug!(steps = steps.len(), "generated proof");
        Ok(Proof::from_parts(path, Some(value), steps))
    }

    fn prove_at(
        store: &S,
        node: &Node,
        nibble_iter: &mut NibbleIterator,
        steps: &mut Vec<Step>,
    ) -> Result<Vec<u8>> {
        match node {
            Node::Leaf(leaf) => {
                let mut prefix_iter = leaf.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !(nibble_iter.is_finished() && prefix_iter.is_finished()) {
                    return Err(Error::NotPresent);
                }
                Ok(leaf.value().to_vec())
            }
            Node::Branch(branch) => {
                let mut prefix_iter = branch.prefix().nibbles();
                skip_common_prefix(nibble_iter, &mut prefix_iter);
                if !prefix_iter.is_finished() {
                    return Err(Error::NotPresent);
                }
                let skip = branch.prefix().num_nibbles();
                let index = nibble_iter
                    .next()
                    .expect("path is longer than any branch prefix");
                let Some(child) = branch.child(index) else {
                    return Err(Error::NotPresent);
                };
                let child = child.resolve(store)?;
                let value = Self::prove_at(store, &child, nibble_iter, steps)?;
                steps.push(Self::step_for(store, branch, index, skip)?);
                Ok(value)
            }
        }
    }

    /// Summarizes the siblings of slot `index` as one proof step.
    fn step_for(store: &S, branch: &BranchNode, index: Nibble, skip: usize) -> Result<Step> {
        let siblings: Vec<(Nibble, &ChildRef)> = branch
            .children()
            .occupied()
            .filter(|(nibble, _)| *nibble != index)
            .collect();
        Ok(match siblings.as_slice() {
            [(nibble, child)] => {
                // A lone sibling is described directly, which spares the
                // verifier three padding digests.
                let neighbor = child.resolve(store)?;
                match &*neighbor {
                    Node::Leaf(leaf) => Step::Leaf {
                        skip,
                        neighbor: LeafNeighbor {
                            key: leaf.key_hash(),
                            value: leaf.value_hash(),
                        },
                    },
                    Node::Branch(fork) => Step::Fork {
                        skip,
                        neighbor: ForkNeighbor {
                            nibble: *nibble,
                            prefix: fork.prefix().clone(),
                            root: fork.merkle_root(),
                        },
                    },
                }
            }
            _ => Step::Branch {
                skip,
                neighbors: merkle_siblings(&branch.children().hashes(), index),
            },
        })
    }

    /// Descends to the sub-trie at `path`, consuming node prefixes and one
    /// branch nibble per step. The empty path addresses the trie itself;
    /// a path stopping off the trie or inside a node's prefix addresses
    /// nothing.
    pub fn child_at(&self, path: &[Nibble]) -> Result<Option<Trie<'a, S>>> {
        let Some(root) = &self.root else {
            return Ok(path.is_empty().then(|| self.clone()));
        };
        let node = Self::child_at_node(self.store, root, path)?;
        Ok(node.map(|node| Trie {
            store: self.store,
            root: Some(node),
        }))
    }

    fn child_at_node(store: &S, node: &Node, path: &[Nibble]) -> Result<Option<Node>> {
        if path.is_empty() {
            return Ok(Some(node.clone()));
        }
        // A node sits where its parent's branching nibble put it, before its
        // own prefix; a path stopping inside the prefix addresses nothing.
        let prefix = node.prefix();
        if path.len() <= prefix.num_nibbles() {
            return Ok(None);
        }
        for (i, nibble) in prefix.nibbles().enumerate() {
            if path[i] != nibble {
                return Ok(None);
            }
        }
        let (index, rest) = path[prefix.num_nibbles()..]
            .split_first()
            .expect("path is longer than the prefix");
        match node {
            Node::Leaf(_) => Ok(None),
            Node::Branch(branch) => match branch.child(*index) {
                None => Ok(None),
                Some(child) => {
                    let child = child.resolve(store)?;
                    Self::child_at_node(store, &child, rest)
                }
            },
        }
    }

    fn path_of(key: &[u8]) -> NibblePath {
        NibblePath::new(digest(key).to_vec())
    }
}

enum RemoveOutcome {
    /// The node was deleted outright.
    Removed,
    /// The node was replaced in place and re-indexed.
    Replaced,
}
