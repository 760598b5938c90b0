// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Node types of the trie.
//!
//! A [`BranchNode`] compresses a shared nibble prefix and fans out over 16
//! child slots, aggregated into one digest by a 4-level binary Merkle tree
//! padded with [`NULL_HASH`]. A [`LeafNode`] terminates a path and carries
//! the original key/value pair together with its unconsumed path suffix.
//!
//! Children are held as [`ChildRef`]s: either materialized sub-tries or
//! content-addressed references recalled through the [`Store`] on descent.


use crate::hash::{digest, digest_parts, MerkleHash, NodeHash, NULL_HASH};
use crate::nibble::Nibble;
use crate::nibble_path::NibblePath;
use crate::store::Store;
use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;
use once_cell::sync::Lazy;
#[cfg(any(test, feature = "fuzzing"))]
use proptest::{collection::hash_map, collection::vec, prelude::*};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::Cell;
use std::io::Read;
use thiserror::Error;

/// Number of child slots of a branch node.
pub const BRANCH_WIDTH: usize = 16;

/// Roots of fully vacant Merkle subtrees, indexed by subtree height. Height 0
/// is a single empty slot, height 4 a branch with no children at all.
static EMPTY_SUBTREE_ROOTS: Lazy<[NodeHash; 5]> = Lazy::new(|| {
    let mut roots = [NULL_HASH; 5];
    for height in 1..=4 {
        roots[height] = NodeHash::combine(&roots[height - 1], &roots[height - 1]);
    }
    roots
});

/// Hash of a leaf node: the packed path suffix followed by the value digest.
pub(crate) fn leaf_hash(prefix: &NibblePath, value_hash: &NodeHash) -> NodeHash {
    let packed = prefix.pack();
    digest_parts([packed.as_slice(), value_hash.as_bytes()])
}

/// Hash of a branch node: the packed prefix followed by the Merkle root of
/// its children.
pub(crate) fn branch_hash(prefix: &NibblePath, merkle_root: &NodeHash) -> NodeHash {
    let packed = prefix.pack();
    digest_parts([packed.as_slice(), merkle_root.as_bytes()])
}

/// Root of the 4-level binary Merkle tree over `slots`, vacant slots
/// contributing [`NULL_HASH`].
pub(crate) fn merkle_root(slots: &[Option<NodeHash>; BRANCH_WIDTH]) -> NodeHash {
    subtree_root(slots, 0, BRANCH_WIDTH)
}

fn subtree_root(slots: &[Option<NodeHash>; BRANCH_WIDTH], start: usize, width: usize) -> NodeHash {
    debug_assert!(width.is_power_of_two() && start % width == 0);
    if slots[start..start + width].iter().all(Option::is_none) {
        return EMPTY_SUBTREE_ROOTS[width.trailing_zeros() as usize];
    }
    if width == 1 {
        return slots[start].unwrap_or(NULL_HASH);
    }
    let half = width / 2;
    NodeHash::combine(
        &subtree_root(slots, start, half),
        &subtree_root(slots, start + half, half),
    )
}

/// Sibling subtree roots along the Merkle path of slot `n`, ordered from the
/// top level (half the branch) down to the adjacent slot.
pub(crate) fn merkle_siblings(
    slots: &[Option<NodeHash>; BRANCH_WIDTH],
    n: Nibble,
) -> [NodeHash; 4] {
    let mut siblings = [NULL_HASH; 4];
    for (i, height) in (0..4u8).rev().enumerate() {
        let width = 1usize << height;
        let (_, sibling_half_start) = child_and_sibling_half_start(n, height);
        siblings[i] = subtree_root(slots, sibling_half_start as usize, width);
    }
    siblings
}

/// Given a nibble, computes the start position of its `child_half_start` and
/// `sibling_half_start` at `height` level.
pub(crate) fn child_and_sibling_half_start(n: Nibble, height: u8) -> (u8, u8) {
    // Index of the first slot of the subtree at `height` that the n-th slot
    // belongs to. At height 0 this is always `n` itself.
    let child_half_start = (0xff << height) & u8::from(n);

    // Index of the first slot of the sibling of that subtree.
    let sibling_half_start = child_half_start ^ (1 << height);

    (child_half_start, sibling_half_start)
}

/// A branch child: either a materialized sub-trie or a content-addressed
/// reference resolved through the [`Store`] on descent.
#[derive(Clone, Debug)]
pub enum ChildRef {
    Inline(Box<Node>),
    Ref(NodeHash),
}

impl ChildRef {
    pub fn hash(&self) -> NodeHash {
        match self {
            ChildRef::Inline(node) => node.merkle_hash(),
            ChildRef::Ref(hash) => *hash,
        }
    }

    /// Ensures the child is materialized, loading it from `store` if needed.
    pub(crate) fn materialize<S: Store>(&mut self, store: &S) -> Result<&mut Node> {
        if let ChildRef::Ref(hash) = self {
            let node = store.get_node(hash)?;
            *self = ChildRef::Inline(Box::new(node));
        }
        match self {
            ChildRef::Inline(node) => Ok(node),
            ChildRef::Ref(_) => unreachable!("materialized above"),
        }
    }

    /// Resolves the child for reading, borrowing it when already inline.
    pub(crate) fn resolve<S: Store>(&self, store: &S) -> Result<Cow<'_, Node>> {
        match self {
            ChildRef::Inline(node) => Ok(Cow::Borrowed(node)),
            ChildRef::Ref(hash) => Ok(Cow::Owned(store.get_node(hash)?)),
        }
    }
}

impl From<Node> for ChildRef {
    fn from(node: Node) -> Self {
        ChildRef::Inline(Box::new(node))
    }
}

/// Children compare by identity, not by how materialized they happen to be.
impl PartialEq for ChildRef {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for ChildRef {}

/// The 16 child slots of a branch, indexed by nibble. The position is
/// semantic: slot `i` holds the sub-trie whose next path nibble is `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Children([Option<ChildRef>; BRANCH_WIDTH]);

impl Default for Children {
    fn default() -> Self {
        Self(std::array::from_fn(|_| None))
    }
}

impl Children {
    pub fn get(&self, n: Nibble) -> Option<&ChildRef> {
        self.0[usize::from(n)].as_ref()
    }

    pub(crate) fn get_mut(&mut self, n: Nibble) -> Option<&mut ChildRef> {
        self.0[usize::from(n)].as_mut()
    }

    pub fn set(&mut self, n: Nibble, child: ChildRef) {
        self.0[usize::from(n)] = Some(child);
    }

    pub fn remove(&mut self, n: Nibble) -> Option<ChildRef> {
        self.0[usize::from(n)].take()
    }

    /// Number of occupied slots.
    pub fn num_children(&self) -> usize {
        self.0.iter().filter(|slot| slot.is_some()).count()
    }

    /// Occupied slots in ascending nibble order.
    pub fn occupied(&self) -> impl Iterator<Item = (Nibble, &ChildRef)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|child| (Nibble::from(i as u8), child)))
    }

    /// Per-slot hashes, the input of the Merkle aggregation.
    pub(crate) fn hashes(&self) -> [Option<NodeHash>; BRANCH_WIDTH] {
        std::array::from_fn(|i| self.0[i].as_ref().map(ChildRef::hash))
    }
}

/// Terminal node holding an original key/value pair and the path suffix left
/// unconsumed by the branches above it.
#[derive(Clone, Debug)]
pub struct LeafNode {
    prefix: NibblePath,
    key: Vec<u8>,
    value: Vec<u8>,
    key_hash: NodeHash,
    cached_hash: Cell<Option<NodeHash>>,
}

impl LeafNode {
    pub fn new(prefix: NibblePath, key: Vec<u8>, value: Vec<u8>) -> Self {
        let key_hash = digest(&key);
        let leaf = Self {
            prefix,
            key,
            value,
            key_hash,
            cached_hash: Cell::new(None),
        };
        debug_assert!(
            leaf.path().ends_with(&leaf.prefix),
            "leaf prefix is not a suffix of its path"
        );
        leaf
    }

    pub fn prefix(&self) -> &NibblePath {
        &self.prefix
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Digest of the original key; its hex expansion is the leaf's path.
    pub fn key_hash(&self) -> NodeHash {
        self.key_hash
    }

    pub fn value_hash(&self) -> NodeHash {
        digest(&self.value)
    }

    /// The full 64-nibble path of the leaf.
    pub fn path(&self) -> NibblePath {
        NibblePath::new(self.key_hash.to_vec())
    }

    pub fn serialize(&self, binary: &mut Vec<u8>) -> Result<()> {
        let raw = RawLeaf {
            prefix_nibbles: self.prefix.num_nibbles() as u16,
            prefix: self.prefix.bytes().to_vec(),
            key: self.key.clone(),
            value: self.value.clone(),
        };
        binary.extend(bcs::to_bytes(&raw)?);
        Ok(())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let raw: RawLeaf = bcs::from_bytes(data)?;
        let prefix = NibblePath::from_padded(raw.prefix_nibbles as usize, raw.prefix)?;
        let key_hash = digest(&raw.key);
        ensure!(
            NibblePath::new(key_hash.to_vec()).ends_with(&prefix),
            "leaf prefix is not a suffix of the key path"
        );
        Ok(Self {
            prefix,
            key: raw.key,
            value: raw.value,
            key_hash,
            cached_hash: Cell::new(None),
        })
    }
}

impl MerkleHash for LeafNode {
    fn merkle_hash(&self) -> NodeHash {
        match self.cached_hash.get() {
            Some(hash) => hash,
            None => {
                let hash = leaf_hash(&self.prefix, &self.value_hash());
                self.cached_hash.set(Some(hash));
                hash
            }
        }
    }
}

impl PartialEq for LeafNode {
    fn eq(&self, other: &Self) -> bool {
        self.prefix == other.prefix && self.key == other.key && self.value == other.value
    }
}

impl Eq for LeafNode {}

#[cfg(any(test, feature = "fuzzing"))]
impl Arbitrary for LeafNode {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (vec(any::<u8>(), 1..32), vec(any::<u8>(), 0..32))
            .prop_map(|(key, value)| {
                let prefix = NibblePath::new(digest(&key).to_vec());
                LeafNode::new(prefix, key, value)
            })
            .boxed()
    }
}

#[derive(Serialize, Deserialize)]
struct RawLeaf {
    prefix_nibbles: u16,
    prefix: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// A branch compresses the nibble prefix shared by everything beneath it and
/// fans out over 16 slots keyed by the next nibble of the path.
#[derive(Clone, Debug)]
pub struct BranchNode {
    prefix: NibblePath,
    children: Children,
    /// Number of leaves beneath this node.
    size: u64,
    cached_hash: Cell<Option<NodeHash>>,
}

impl BranchNode {
    /// Panics unless at least two slots are occupied: a single-child branch
    /// collapses into its child and must never be constructed.
    pub fn new(prefix: NibblePath, children: Children, size: u64) -> Self {
        assert!(
            children.num_children() >= 2,
            "branch node must have at least two children"
        );
        Self {
            prefix,
            children,
            size,
            cached_hash: Cell::new(None),
        }
    }

    pub fn prefix(&self) -> &NibblePath {
        &self.prefix
    }

    pub fn children(&self) -> &Children {
        &self.children
    }

    pub fn child(&self, n: Nibble) -> Option<&ChildRef> {
        self.children.get(n)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Merkle root of the 16 child slots.
    pub fn merkle_root(&self) -> NodeHash {
        merkle_root(&self.children.hashes())
    }

    pub(crate) fn child_mut(&mut self, n: Nibble) -> Option<&mut ChildRef> {
        self.cached_hash.set(None);
        self.children.get_mut(n)
    }

    pub(crate) fn set_child(&mut self, n: Nibble, child: ChildRef) {
        self.cached_hash.set(None);
        self.children.set(n, child);
    }

    pub(crate) fn remove_child(&mut self, n: Nibble) -> Option<ChildRef> {
        self.cached_hash.set(None);
        self.children.remove(n)
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.cached_hash.set(None);
        self.size = size;
    }

    pub(crate) fn take_children(&mut self) -> Children {
        self.cached_hash.set(None);
        std::mem::take(&mut self.children)
    }

    pub fn serialize(&self, binary: &mut Vec<u8>) -> Result<()> {
        let mut existence_bitmap = 0u16;
        for (nibble, _) in self.children.occupied() {
            existence_bitmap |= 1u16 << u8::from(nibble);
        }
        binary.write_u16::<LittleEndian>(existence_bitmap)?;
        binary.write_u64::<LittleEndian>(self.size)?;
        binary.write_u16::<LittleEndian>(self.prefix.num_nibbles() as u16)?;
        binary.extend(self.prefix.bytes());
        for (_, child) in self.children.occupied() {
            binary.extend(child.hash().to_vec());
        }
        Ok(())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(data);

        let existence_bitmap = reader.read_u16::<LittleEndian>()?;
        let count = existence_bitmap.count_ones() as usize;
        if count < 2 {
            return Err(NodeDecodeError::NotEnoughChildren { count }.into());
        }
        let size = reader.read_u64::<LittleEndian>()?;
        let prefix_nibbles = reader.read_u16::<LittleEndian>()? as usize;
        let mut prefix_bytes = vec![0u8; prefix_nibbles.div_ceil(2)];
        reader.read_exact(&mut prefix_bytes)?;
        let prefix = NibblePath::from_padded(prefix_nibbles, prefix_bytes)?;

        let mut children = Children::default();
        let mut remaining_bitmap = existence_bitmap;
        while remaining_bitmap != 0 {
            let next_child = remaining_bitmap.trailing_zeros() as u8;
            let mut hash_bytes = [0u8; NodeHash::LEN];
            reader.read_exact(&mut hash_bytes).map_err(|_| {
                anyhow::format_err!(
                    "not enough bytes left, children: {}, bytes: {}",
                    count,
                    data.len()
                )
            })?;
            children.set(
                Nibble::from(next_child),
                ChildRef::Ref(NodeHash::new(hash_bytes)),
            );
            remaining_bitmap &= !(1 << next_child);
        }
        ensure!(
            reader.position() as usize == data.len(),
            "{} trailing bytes after branch node",
            data.len() - reader.position() as usize
        );
        Ok(Self::new(prefix, children, size))
    }
}

impl MerkleHash for BranchNode {
    fn merkle_hash(&self) -> NodeHash {
        match self.cached_hash.get() {
            Some(hash) => hash,
            None => {
                let hash = branch_hash(&self.prefix, &self.merkle_root());
                self.cached_hash.set(Some(hash));
                hash
            }
        }
    }
}

impl PartialEq for BranchNode {
    fn eq(&self, other: &Self) -> bool {
        self.prefix == other.prefix && self.size == other.size && self.children == other.children
    }
}

impl Eq for BranchNode {}

#[cfg(any(test, feature = "fuzzing"))]
impl Arbitrary for BranchNode {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        (
            any::<NibblePath>(),
            hash_map(any::<Nibble>(), any::<NodeHash>(), 2..=16),
        )
            .prop_map(|(prefix, hashes)| {
                let mut children = Children::default();
                for (nibble, hash) in hashes {
                    children.set(nibble, ChildRef::Ref(hash));
                }
                let size = children.num_children() as u64;
                BranchNode::new(prefix, children, size)
            })
            .boxed()
    }
}

#[repr(u8)]
#[derive(FromPrimitive, ToPrimitive)]
enum NodeTag {
    Branch = 1,
    Leaf = 2,
}

/// The concrete node type of the trie.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// A wrapper of [`BranchNode`].
    Branch(BranchNode),
    /// A wrapper of [`LeafNode`].
    Leaf(LeafNode),
}

impl From<BranchNode> for Node {
    fn from(node: BranchNode) -> Self {
        Node::Branch(node)
    }
}

impl From<LeafNode> for Node {
    fn from(node: LeafNode) -> Self {
        Node::Leaf(node)
    }
}

impl Node {
    /// Creates the [`Branch`](Node::Branch) variant.
    pub fn new_branch(prefix: NibblePath, children: Children, size: u64) -> Self {
        Node::Branch(BranchNode::new(prefix, children, size))
    }

    /// Creates the [`Leaf`](Node::Leaf) variant.
    pub fn new_leaf(prefix: NibblePath, key: Vec<u8>, value: Vec<u8>) -> Self {
        Node::Leaf(LeafNode::new(prefix, key, value))
    }

    /// Returns `true` if the node is a leaf node.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// The nibble prefix compressed into this node.
    pub fn prefix(&self) -> &NibblePath {
        match self {
            Node::Branch(branch) => branch.prefix(),
            Node::Leaf(leaf) => leaf.prefix(),
        }
    }

    /// Number of leaves beneath this node.
    pub fn size(&self) -> u64 {
        match self {
            Node::Branch(branch) => branch.size(),
            Node::Leaf(_) => 1,
        }
    }

    /// Shallow copy for storage: branch children become references.
    pub(crate) fn to_stored(&self) -> Node {
        match self {
            Node::Leaf(leaf) => Node::Leaf(leaf.clone()),
            Node::Branch(branch) => {
                let mut children = Children::default();
                for (nibble, child) in branch.children().occupied() {
                    children.set(nibble, ChildRef::Ref(child.hash()));
                }
                Node::Branch(BranchNode::new(
                    branch.prefix().clone(),
                    children,
                    branch.size(),
                ))
            }
        }
    }

    /// Serializes to bytes for physical storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        match self {
            Node::Branch(branch) => {
                out.push(NodeTag::Branch as u8);
                branch.serialize(&mut out)?;
            }
            Node::Leaf(leaf) => {
                out.push(NodeTag::Leaf as u8);
                leaf.serialize(&mut out)?;
            }
        }
        Ok(out)
    }

    /// Recovers from serialized bytes in physical storage.
    pub fn decode(val: &[u8]) -> Result<Node> {
        if val.is_empty() {
            return Err(NodeDecodeError::EmptyInput.into());
        }
        let tag = val[0];
        match NodeTag::from_u8(tag) {
            Some(NodeTag::Branch) => Ok(Node::Branch(BranchNode::deserialize(&val[1..])?)),
            Some(NodeTag::Leaf) => Ok(Node::Leaf(LeafNode::deserialize(&val[1..])?)),
            None => Err(NodeDecodeError::UnknownTag { unknown_tag: tag }.into()),
        }
    }
}

impl MerkleHash for Node {
    fn merkle_hash(&self) -> NodeHash {
        match self {
            Node::Branch(branch) => branch.merkle_hash(),
            Node::Leaf(leaf) => leaf.merkle_hash(),
        }
    }
}

#[cfg(any(test, feature = "fuzzing"))]
impl Arbitrary for Node {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        prop_oneof![
            any::<LeafNode>().prop_map(Node::Leaf),
            any::<BranchNode>().prop_map(Node::Branch),
        ]
        .boxed()
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(self.encode().map_err(serde::ser::Error::custom)?.as_slice())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Node::decode(bytes.as_slice()).map_err(serde::de::Error::custom)
    }
}

/// Error thrown when a [`Node`] fails to be deserialized out of a byte
/// sequence stored in physical storage, via [`Node::decode`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum NodeDecodeError {
    /// Input is empty.
    #[error("missing tag due to empty input")]
    EmptyInput,

    /// The first byte of the input is not a known tag representing one of the
    /// variants.
    #[error("lead tag byte is unknown: {}", unknown_tag)]
    UnknownTag { unknown_tag: u8 },

    /// A branch node decoded with fewer than two children.
    #[error("branch node decoded with {} children, two or more required", count)]
    NotEnoughChildren { count: usize },
}
