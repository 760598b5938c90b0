// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Hashing primitives.
//!
//! Everything in the trie is identified by a blake2b-256 digest: keys are
//! expanded into paths by hashing, values are folded into leaf hashes by
//! hashing, and nodes are indexed in the [`Store`](crate::Store) under the
//! digest of their content. [`NULL_HASH`] doubles as the root of the empty
//! trie and as the padding value for vacant Merkle slots.

use crate::{Error, Result};
use primitive_types::H256;
#[cfg(any(test, feature = "fuzzing"))]
use proptest::prelude::*;
use rand::RngCore;
use std::fmt;

/// Number of bytes produced by [`digest`].
pub const DIGEST_LENGTH: usize = 32;

/// Hash of the empty trie, and padding value for vacant Merkle slots.
pub const NULL_HASH: NodeHash = NodeHash([0u8; DIGEST_LENGTH]);

/// Output of the hashing primitive. Identifies a node in the
/// [`Store`](crate::Store).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHash([u8; DIGEST_LENGTH]);

impl NodeHash {
    /// The length of the hash in bytes.
    pub const LEN: usize = DIGEST_LENGTH;

    pub const fn new(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Fails with [`Error::InvalidDigest`] unless `bytes` is exactly
    /// [`DIGEST_LENGTH`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        <[u8; DIGEST_LENGTH]>::try_from(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidDigest {
                expected: DIGEST_LENGTH,
                actual: bytes.len(),
            })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_HASH
    }

    /// Hash of a Merkle inner node.
    pub fn combine(left: &NodeHash, right: &NodeHash) -> NodeHash {
        digest_parts([left.as_bytes(), right.as_bytes()])
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; DIGEST_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// blake2b-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> NodeHash {
    digest_parts([bytes])
}

/// blake2b-256 of the concatenation of `parts`.
pub(crate) fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> NodeHash {
    let mut state = blake2b_simd::Params::new()
        .hash_length(DIGEST_LENGTH)
        .to_state();
    for part in parts {
        state.update(part);
    }
    let mut out = [0u8; DIGEST_LENGTH];
    out.copy_from_slice(state.finalize().as_bytes());
    NodeHash(out)
}

/// Types with a canonical digest in the trie's hash structure.
pub trait MerkleHash {
    fn merkle_hash(&self) -> NodeHash;
}

impl From<NodeHash> for H256 {
    fn from(hash: NodeHash) -> H256 {
        H256(hash.0)
    }
}

impl From<H256> for NodeHash {
    fn from(hash: H256) -> NodeHash {
        NodeHash(hash.0)
    }
}

impl fmt::LowerHex for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({:x})", self)
    }
}

impl AsRef<[u8]> for NodeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(any(test, feature = "fuzzing"))]
impl Arbitrary for NodeHash {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: ()) -> Self::Strategy {
        any::<[u8; DIGEST_LENGTH]>().prop_map(Self::new).boxed()
    }
}
