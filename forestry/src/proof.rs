// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Proofs of membership, insertion and deletion.
//!
//! A [`Proof`] carries the element's path, optionally its value, and one
//! [`Step`] per branch on the descent, outermost first. Each step summarizes
//! the branch's siblings with just enough material to rebuild its Merkle
//! root, so a verifier can recompute the trie root from the proof alone:
//!
//! * [`Step::Branch`] ships the 4 sibling digests of the element's slot.
//! * [`Step::Fork`] describes a lone sibling sub-trie by its slot, nibble
//!   prefix and Merkle root.
//! * [`Step::Leaf`] describes a lone sibling leaf by its key and value
//!   digests.
//!
//! Verification runs in two modes. *With* the element it yields the root of
//! a trie holding it; *without*, the root of the same trie with the element
//! absent, collapsing the deepest step the way
//! [`delete`](crate::Trie::delete) would. One proof checked both ways
//! authenticates an insertion or a deletion between two roots.

use crate::hash::{digest, digest_parts, NodeHash, NULL_HASH};
use crate::nibble::Nibble;
use crate::nibble_path::NibblePath;
use crate::node_type::{branch_hash, leaf_hash, merkle_root, BRANCH_WIDTH};
use crate::trie::PATH_NIBBLES;
use crate::{Error, Result};
use anyhow::{ensure, format_err};
#[cfg(any(test, feature = "fuzzing"))]
use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};

/// Description of the lone branch sibling in a [`Step::Fork`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "fuzzing"), derive(Arbitrary))]
pub struct ForkNeighbor {
    /// The slot the sibling hangs from.
    pub nibble: Nibble,
    /// The sibling's own nibble prefix.
    pub prefix: NibblePath,
    /// The Merkle root of the sibling's children.
    pub root: NodeHash,
}

/// Description of the lone leaf sibling in a [`Step::Leaf`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "fuzzing"), derive(Arbitrary))]
pub struct LeafNeighbor {
    /// Digest of the sibling's key; its hex expansion is the sibling's path.
    pub key: NodeHash,
    /// Digest of the sibling's value.
    pub value: NodeHash,
}

/// Evidence collected at one branch of the descent. `skip` is the length of
/// the branch's prefix, not counting the nibble the descent forked on.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(any(test, feature = "fuzzing"), derive(Arbitrary))]
pub enum Step {
    /// Two or more siblings: the 4 sibling digests of the element's slot,
    /// top level first.
    Branch {
        skip: usize,
        neighbors: [NodeHash; 4],
    },
    /// A lone sibling sub-trie.
    Fork { skip: usize, neighbor: ForkNeighbor },
    /// A lone sibling leaf.
    Leaf { skip: usize, neighbor: LeafNeighbor },
}

impl Step {
    pub fn skip(&self) -> usize {
        match self {
            Step::Branch { skip, .. } | Step::Fork { skip, .. } | Step::Leaf { skip, .. } => *skip,
        }
    }
}

/// A verifiable trail from an element to a trie root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Proof {
    path: NibblePath,
    value: Option<Vec<u8>>,
    steps: Vec<Step>,
}

impl Proof {
    /// Assembles a proof for `key` from interchange data.
    pub fn new(key: impl AsRef<[u8]>, value: Option<Vec<u8>>, steps: Vec<Step>) -> Self {
        Self {
            path: NibblePath::new(digest(key.as_ref()).to_vec()),
            value,
            steps,
        }
    }

    pub(crate) fn from_parts(path: NibblePath, value: Option<Vec<u8>>, steps: Vec<Step>) -> Self {
        Self { path, value, steps }
    }

    /// The element's full path.
    pub fn path(&self) -> &NibblePath {
        &self.path
    }

    /// The element's value, when the proof carries one.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Recomputes the root this proof commits to.
    ///
    /// With the element, the result is the root of a trie that binds the
    /// path to the value. Without it, the result is the root of the same
    /// trie with the element absent; an empty step list then yields
    /// [`NULL_HASH`], the empty trie. The caller compares the returned root
    /// against a trusted one.
    pub fn verify(&self, with_element: bool) -> Result<NodeHash> {
        Ok(self
            .walk(0, &self.steps, with_element)?
            .unwrap_or(NULL_HASH))
    }

    /// Rebuilds the sub-root at `cursor` nibbles of depth. Returns `None`
    /// only past the last step of an element-less verification, which the
    /// deepest step resolves by collapsing.
    fn walk(&self, cursor: usize, steps: &[Step], with_element: bool) -> Result<Option<NodeHash>> {
        let Some((step, rest)) = steps.split_first() else {
            if !with_element {
                return Ok(None);
            }
            let value = self
                .value
                .as_ref()
                .ok_or_else(|| Error::InvalidProof("proof carries no element".to_string()))?;
            let suffix = self.path.sub_path(cursor, self.path.num_nibbles());
            return Ok(Some(leaf_hash(&suffix, &digest(value))));
        };

        let next_cursor = cursor + 1 + step.skip();
        if next_cursor > self.path.num_nibbles() {
            return Err(Error::InvalidProof(format!(
                "step at nibble {} overruns the path",
                cursor
            )));
        }
        let me = self.walk(next_cursor, rest, with_element)?;
        let this_nibble = self.path.get_nibble(next_cursor - 1);
        let prefix = self.path.sub_path(cursor, next_cursor - 1);

        match step {
            Step::Branch { neighbors, .. } => {
                let root =
                    merkle_root_from_neighbors(this_nibble, me.unwrap_or(NULL_HASH), neighbors);
                Ok(Some(branch_hash(&prefix, &root)))
            }
            Step::Fork { neighbor, .. } => match me {
                // Deepest step of an element-less pass: the lone sibling
                // absorbs this branch's prefix and the nibble it forked on,
                // the same merge a deletion performs.
                None => {
                    if prefix.num_nibbles() + 1 + neighbor.prefix.num_nibbles() > PATH_NIBBLES {
                        return Err(Error::InvalidProof(
                            "fork neighbor prefix overruns the path".to_string(),
                        ));
                    }
                    let mut merged = prefix;
                    merged.push(neighbor.nibble);
                    for nibble in neighbor.prefix.nibbles() {
                        merged.push(nibble);
                    }
                    Ok(Some(branch_hash(&merged, &neighbor.root)))
                }
                Some(me) => {
                    if neighbor.nibble == this_nibble {
                        return Err(Error::InvalidProof(
                            "fork neighbor shares the element's slot".to_string(),
                        ));
                    }
                    let packed = neighbor.prefix.pack();
                    let mut slots: [Option<NodeHash>; BRANCH_WIDTH] = [None; BRANCH_WIDTH];
                    slots[usize::from(this_nibble)] = Some(me);
                    slots[usize::from(neighbor.nibble)] =
                        Some(digest_parts([packed.as_slice(), neighbor.root.as_bytes()]));
                    Ok(Some(branch_hash(&prefix, &merkle_root(&slots))))
                }
            },
            Step::Leaf { neighbor, .. } => {
                let neighbor_path = NibblePath::new(neighbor.key.to_vec());
                if neighbor_path.sub_path(0, cursor) != self.path.sub_path(0, cursor) {
                    return Err(Error::InvalidProof(
                        "leaf neighbor diverges above its branch".to_string(),
                    ));
                }
                match me {
                    // Deepest step of an element-less pass: the lone sibling
                    // leaf stretches back over the whole remaining path.
                    None => {
                        let suffix = neighbor_path.sub_path(cursor, neighbor_path.num_nibbles());
                        Ok(Some(leaf_hash(&suffix, &neighbor.value)))
                    }
                    Some(me) => {
                        let neighbor_nibble = neighbor_path.get_nibble(next_cursor - 1);
                        if neighbor_nibble == this_nibble {
                            return Err(Error::InvalidProof(
                                "leaf neighbor shares the element's slot".to_string(),
                            ));
                        }
                        let suffix =
                            neighbor_path.sub_path(next_cursor, neighbor_path.num_nibbles());
                        let mut slots: [Option<NodeHash>; BRANCH_WIDTH] = [None; BRANCH_WIDTH];
                        slots[usize::from(this_nibble)] = Some(me);
                        slots[usize::from(neighbor_nibble)] =
                            Some(leaf_hash(&suffix, &neighbor.value));
                        Ok(Some(branch_hash(&prefix, &merkle_root(&slots))))
                    }
                }
            }
        }
    }

    /// The interchange form of the step list.
    pub fn to_json(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.steps)?)
    }
}

/// Rebuilds the Merkle root of a branch from the element's sub-root `me` at
/// slot `n` and the 4 sibling digests `l1..l4`, `l1` being the top level.
/// One reconstruction per slot, spelled out.
pub(crate) fn merkle_root_from_neighbors(
    n: Nibble,
    me: NodeHash,
    neighbors: &[NodeHash; 4],
) -> NodeHash {
    let [l1, l2, l3, l4] = neighbors;
    let m = &me;
    let h = |x: &NodeHash, y: &NodeHash| NodeHash::combine(x, y);
    match u8::from(n) {
        0x0 => h(&h(&h(&h(m, l4), l3), l2), l1),
        0x1 => h(&h(&h(&h(l4, m), l3), l2), l1),
        0x2 => h(&h(&h(l3, &h(m, l4)), l2), l1),
        0x3 => h(&h(&h(l3, &h(l4, m)), l2), l1),
        0x4 => h(&h(l2, &h(&h(m, l4), l3)), l1),
        0x5 => h(&h(l2, &h(&h(l4, m), l3)), l1),
        0x6 => h(&h(l2, &h(l3, &h(m, l4))), l1),
        0x7 => h(&h(l2, &h(l3, &h(l4, m))), l1),
        0x8 => h(l1, &h(&h(&h(m, l4), l3), l2)),
        0x9 => h(l1, &h(&h(&h(l4, m), l3), l2)),
        0xa => h(l1, &h(&h(l3, &h(m, l4)), l2)),
        0xb => h(l1, &h(&h(l3, &h(l4, m)), l2)),
        0xc => h(l1, &h(l2, &h(&h(m, l4), l3))),
        0xd => h(l1, &h(l2, &h(&h(l4, m), l3))),
        0xe => h(l1, &h(l2, &h(l3, &h(m, l4)))),
        0xf => h(l1, &h(l2, &h(l3, &h(l4, m)))),
        _ => unreachable!("a nibble is four bits"),
    }
}

/// Interchange form of a [`Step`]; digests travel as hex strings and the
/// fork neighbor's prefix as one hex digit per nibble, so odd lengths stay
/// representable.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawStep {
    Branch { skip: usize, neighbors: String },
    Fork { skip: usize, neighbor: RawForkNeighbor },
    Leaf { skip: usize, neighbor: RawLeafNeighbor },
}

#[derive(Serialize, Deserialize)]
struct RawForkNeighbor {
    nibble: u8,
    prefix: String,
    root: String,
}

#[derive(Serialize, Deserialize)]
struct RawLeafNeighbor {
    key: String,
    value: String,
}

impl From<&Step> for RawStep {
    fn from(step: &Step) -> Self {
        match step {
            Step::Branch { skip, neighbors } => RawStep::Branch {
                skip: *skip,
                neighbors: neighbors.iter().map(|h| hex::encode(h.as_bytes())).collect(),
            },
            Step::Fork { skip, neighbor } => RawStep::Fork {
                skip: *skip,
                neighbor: RawForkNeighbor {
                    nibble: u8::from(neighbor.nibble),
                    prefix: neighbor
                        .prefix
                        .nibbles()
                        .map(|nibble| format!("{:x}", nibble))
                        .collect(),
                    root: hex::encode(neighbor.root.as_bytes()),
                },
            },
            Step::Leaf { skip, neighbor } => RawStep::Leaf {
                skip: *skip,
                neighbor: RawLeafNeighbor {
                    key: hex::encode(neighbor.key.as_bytes()),
                    value: hex::encode(neighbor.value.as_bytes()),
                },
            },
        }
    }
}

impl TryFrom<RawStep> for Step {
    type Error = anyhow::Error;

    fn try_from(raw: RawStep) -> anyhow::Result<Self> {
        Ok(match raw {
            RawStep::Branch { skip, neighbors } => {
                let bytes = hex::decode(&neighbors)?;
                ensure!(
                    bytes.len() == 4 * NodeHash::LEN,
                    "branch step must carry exactly 4 neighbor digests, got {} bytes",
                    bytes.len()
                );
                let mut digests = [NULL_HASH; 4];
                for (slot, chunk) in digests.iter_mut().zip(bytes.chunks_exact(NodeHash::LEN)) {
                    *slot = NodeHash::from_slice(chunk)?;
                }
                Step::Branch {
                    skip,
                    neighbors: digests,
                }
            }
            RawStep::Fork { skip, neighbor } => {
                ensure!(neighbor.nibble < 16, "fork neighbor nibble out of range");
                ensure!(
                    neighbor.prefix.len() <= PATH_NIBBLES,
                    "fork neighbor prefix of {} nibbles is too long",
                    neighbor.prefix.len()
                );
                let prefix = neighbor
                    .prefix
                    .chars()
                    .map(|c| {
                        c.to_digit(16)
                            .map(|digit| Nibble::from(digit as u8))
                            .ok_or_else(|| format_err!("invalid nibble in fork prefix: {:?}", c))
                    })
                    .collect::<anyhow::Result<NibblePath>>()?;
                Step::Fork {
                    skip,
                    neighbor: ForkNeighbor {
                        nibble: Nibble::from(neighbor.nibble),
                        prefix,
                        root: NodeHash::from_slice(&hex::decode(&neighbor.root)?)?,
                    },
                }
            }
            RawStep::Leaf { skip, neighbor } => Step::Leaf {
                skip,
                neighbor: LeafNeighbor {
                    key: NodeHash::from_slice(&hex::decode(&neighbor.key)?)?,
                    value: NodeHash::from_slice(&hex::decode(&neighbor.value)?)?,
                },
            },
        })
    }
}

impl Serialize for Step {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        RawStep::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        RawStep::deserialize(deserializer)?
            .try_into()
            .map_err(serde::de::Error::custom)
    }
}
