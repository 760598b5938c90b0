// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! This crate implements a Merkle Patricia Forestry: an authenticated
//! key/value map built as a radix-16 Patricia trie whose branch nodes
//! aggregate their children through a small sparse Merkle tree.
//!
//! Keys are hashed with blake2b-256 and the digest, read as a sequence of 64
//! hexadecimal digits, becomes the path of the entry in the trie. Nodes come
//! in two flavours:
//!
//! * [`LeafNode`] holds the original key and value, plus the suffix of the
//!   path left unconsumed by the branches above it.
//! * [`BranchNode`] holds a (possibly empty) shared nibble prefix and 16
//!   child slots, one per nibble. The 16 child hashes are folded into a
//!   single digest through a 4-level binary Merkle tree padded with
//!   [`NULL_HASH`]:
//!
//! ```text
//!   4 ->              +------ root hash ------+
//!                     |                       |
//!   3 ->        +---- # ----+           +---- # ----+
//!               |           |           |           |
//!   2 ->        #           #           #           #
//!             /   \       /   \       /   \       /   \
//!   1 ->     #     #     #     #     #     #     #     #
//!           / \   / \   / \   / \   / \   / \   / \   / \
//!   0 ->   0   1 2   3 4   5 6   7 8   9 A   B C   D E   F
//! ```
//!
//! The Merkle aggregation is what keeps proofs small: a membership proof for
//! one child needs only 4 sibling digests per branch instead of the 15 raw
//! child hashes a classic hexary trie would ship. A [`Proof`] is a list of
//! per-branch steps and can be verified in two modes: *with* the element,
//! producing the root of a trie that contains it, and *without*, producing
//! the root of the same trie with the element absent. Verifying one proof
//! both ways therefore authenticates insertions and deletions against
//! nothing but two 32-byte roots.
//!
//! Nodes are content-addressed: mutating the trie re-indexes every node on
//! the descent path in the backing [`Store`], keyed by hash. The [`Trie`]
//! itself only realizes the read/write logic; persistence lives behind the
//! [`Store`] trait ([`InMemoryStore`] is provided).

mod hash;
mod nibble;
mod nibble_path;
mod node_type;
mod proof;
mod store;
mod trie;

#[cfg(test)]
mod test_helper;
#[cfg(test)]
mod trie_test;

pub use hash::{digest, MerkleHash, NodeHash, DIGEST_LENGTH, NULL_HASH};
pub use nibble::Nibble;
pub use nibble_path::{skip_common_prefix, NibbleIterator, NibblePath};
pub use node_type::{BranchNode, ChildRef, Children, LeafNode, Node, NodeDecodeError};
pub use proof::{ForkNeighbor, LeafNeighbor, Proof, Step};
pub use store::{InMemoryStore, Store};
pub use trie::{Trie, PATH_NIBBLES};

use thiserror::Error as ThisError;

/// Errors surfaced by trie operations and proof verification.
#[derive(Debug, ThisError)]
pub enum Error {
    /// `insert` was given a key whose path is already bound in the trie.
    #[error("key already present in the trie")]
    AlreadyPresent,

    /// `prove`, `delete` or a descent was given a key the trie does not hold.
    #[error("key not present in the trie")]
    NotPresent,

    /// A proof is structurally unusable: mismatched neighbor slot, a step
    /// overrunning the path, or a missing element payload.
    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// An input that must be a digest has the wrong length.
    #[error("invalid digest length: expected {expected} bytes, got {actual}")]
    InvalidDigest { expected: usize, actual: usize },

    /// The storage backend failed, or handed back undecodable bytes.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
