// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use crate::hash::digest;
use crate::nibble::Nibble;
use crate::nibble_path::skip_common_prefix;
use crate::node_type::merkle_root;
use crate::test_helper::{arb_kv_pairs, check_invariants, check_store_consistency, find_key, path_of};
use crate::{Error, InMemoryStore, NodeHash, Step, Trie, NULL_HASH};
use proptest::prelude::*;

#[test]
fn test_empty_trie() {
    let store = InMemoryStore::new();
    let trie = Trie::new(&store);
    assert!(trie.is_empty());
    assert_eq!(trie.size(), 0);
    assert_eq!(trie.hash(), NULL_HASH);
    assert!(matches!(trie.prove(b"anything"), Err(Error::NotPresent)));
    assert!(matches!(
        Trie::new(&store).delete(b"anything"),
        Err(Error::NotPresent)
    ));
}

#[test]
fn test_single_leaf_root() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();

    // One leaf at the root: its prefix is the whole 64-nibble path, which
    // packs back to the raw digest bytes.
    let mut preimage = digest(b"apple").to_vec();
    preimage.extend(digest(b"A").as_bytes());
    assert_eq!(trie.hash(), digest(&preimage));
    assert_eq!(trie.size(), 1);

    let proof = trie.prove(b"apple").unwrap();
    assert!(proof.steps().is_empty());
    assert_eq!(proof.verify(true).unwrap(), trie.hash());
}

#[test]
fn test_two_leaves_share_prefix() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    trie.insert(b"apricot", b"B").unwrap();
    assert_eq!(trie.size(), 2);

    let a = path_of(b"apple");
    let b = path_of(b"apricot");
    let mut a_iter = a.nibbles();
    let mut b_iter = b.nibbles();
    let len = skip_common_prefix(&mut a_iter, &mut b_iter);
    let a_nibble = a_iter.next().unwrap();
    let b_nibble = b_iter.next().unwrap();

    // Rebuild the root by hand: one branch holding the shared prefix, two
    // leaves at the diverging nibbles.
    let mut slots: [Option<NodeHash>; 16] = [None; 16];
    let mut a_leaf = a.sub_path(len + 1, a.num_nibbles()).pack();
    a_leaf.extend(digest(b"A").as_bytes());
    slots[usize::from(a_nibble)] = Some(digest(&a_leaf));
    let mut b_leaf = b.sub_path(len + 1, b.num_nibbles()).pack();
    b_leaf.extend(digest(b"B").as_bytes());
    slots[usize::from(b_nibble)] = Some(digest(&b_leaf));
    let mut preimage = a.sub_path(0, len).pack();
    preimage.extend(merkle_root(&slots).as_bytes());
    assert_eq!(trie.hash(), digest(&preimage));

    assert_eq!(trie.prove(b"apple").unwrap().verify(true).unwrap(), trie.hash());
    assert_eq!(trie.prove(b"apricot").unwrap().verify(true).unwrap(), trie.hash());
    check_store_consistency(&store, &trie);
}

#[test]
fn test_sibling_leaf_becomes_leaf_step() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    trie.insert(b"apricot", b"B").unwrap();

    let a = path_of(b"apple");
    let b = path_of(b"apricot");
    let mut a_iter = a.nibbles();
    let mut b_iter = b.nibbles();
    let len = skip_common_prefix(&mut a_iter, &mut b_iter);

    let proof = trie.prove(b"apple").unwrap();
    assert_eq!(proof.value(), Some(b"A".as_slice()));
    match proof.steps() {
        [Step::Leaf { skip, neighbor }] => {
            assert_eq!(*skip, len);
            assert_eq!(neighbor.key, digest(b"apricot"));
            assert_eq!(neighbor.value, digest(b"B"));
        }
        steps => panic!("expected a single leaf step, got {:?}", steps),
    }
}

#[test]
fn test_exclusion_proof_of_first_insert() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    let proof = trie.prove(b"apple").unwrap();
    assert_eq!(proof.verify(false).unwrap(), NULL_HASH);
    assert_eq!(proof.verify(true).unwrap(), trie.hash());
}

#[test]
fn test_deep_trie_emits_branch_steps() {
    let store = InMemoryStore::new();
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
        .map(|i| (format!("fruit-{}", i).into_bytes(), vec![i as u8]))
        .collect();
    let trie = Trie::from_list(&store, pairs.clone()).unwrap();

    let mut branch_steps = 0;
    for (key, _) in &pairs {
        let proof = trie.prove(key).unwrap();
        assert_eq!(proof.verify(true).unwrap(), trie.hash());
        if let Some(Step::Branch { neighbors, .. }) = proof.steps().first() {
            branch_steps += 1;
            let json = proof.to_json().unwrap();
            let hex = json[0]["neighbors"].as_str().unwrap();
            assert_eq!(hex.len(), 2 * 128, "branch neighbors must be 128 bytes");
            assert_eq!(neighbors.len(), 4);
        }
    }
    assert!(branch_steps > 0, "100 keys must fan out somewhere");
}

#[test]
fn test_duplicate_insert_rejected() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    trie.insert(b"apricot", b"B").unwrap();
    let root = trie.hash();
    assert!(matches!(trie.insert(b"apple", b"A2"), Err(Error::AlreadyPresent)));
    assert_eq!(trie.hash(), root);
    assert_eq!(trie.get(b"apple").unwrap(), Some(b"A".to_vec()));
    check_store_consistency(&store, &trie);
}

#[test]
fn test_from_list_rejects_duplicates() {
    let store = InMemoryStore::new();
    assert!(matches!(
        Trie::from_list(&store, [(b"a".to_vec(), b"1".to_vec()), (b"a".to_vec(), b"2".to_vec())]),
        Err(Error::AlreadyPresent)
    ));
}

#[test]
fn test_get_and_not_present() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    trie.insert(b"apricot", b"B").unwrap();
    assert_eq!(trie.get(b"apple").unwrap(), Some(b"A".to_vec()));
    assert_eq!(trie.get(b"banana").unwrap(), None);
    assert!(matches!(trie.prove(b"banana"), Err(Error::NotPresent)));
    assert!(matches!(trie.delete(b"banana"), Err(Error::NotPresent)));
}

#[test]
fn test_delete_collapses_to_leaf() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    let single = trie.hash();
    trie.insert(b"apricot", b"B").unwrap();
    trie.delete(b"apricot").unwrap();
    assert_eq!(trie.hash(), single);
    assert_eq!(trie.size(), 1);
    trie.delete(b"apple").unwrap();
    assert!(trie.is_empty());
    assert_eq!(trie.hash(), NULL_HASH);
    assert_eq!(store.num_nodes(), 0);
}

#[test]
fn test_child_at_descends_to_leaf() {
    let store = InMemoryStore::new();
    let mut trie = Trie::new(&store);
    trie.insert(b"apple", b"A").unwrap();
    trie.insert(b"apricot", b"B").unwrap();

    let a = path_of(b"apple");
    let b = path_of(b"apricot");
    let mut a_iter = a.nibbles();
    let mut b_iter = b.nibbles();
    let len = skip_common_prefix(&mut a_iter, &mut b_iter);

    // Down the shared prefix and apple's diverging nibble sits apple's leaf.
    let to_leaf: Vec<Nibble> = a.sub_path(0, len + 1).nibbles().collect();
    let sub = trie.child_at(&to_leaf).unwrap().expect("leaf sub-trie");
    assert_eq!(sub.size(), 1);
    let mut preimage = a.sub_path(len + 1, a.num_nibbles()).pack();
    preimage.extend(digest(b"A").as_bytes());
    assert_eq!(sub.hash(), digest(&preimage));

    // The whole trie sits at the empty path.
    assert_eq!(trie.child_at(&[]).unwrap().unwrap().hash(), trie.hash());

    // Stopping inside the prefix, or stepping off a leaf, finds nothing.
    if len > 0 {
        let mid: Vec<Nibble> = a.sub_path(0, len).nibbles().collect();
        assert!(trie.child_at(&mid).unwrap().is_none());
    }
    let mut too_deep = to_leaf.clone();
    too_deep.push(a.get_nibble(len + 1));
    assert!(trie.child_at(&too_deep).unwrap().is_none());
}

#[test]
fn test_from_root_round_trip() {
    let store = InMemoryStore::new();
    let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
        .map(|i| (format!("fruit-{}", i).into_bytes(), vec![i as u8]))
        .collect();
    let trie = Trie::from_list(&store, pairs.clone()).unwrap();

    let recovered = Trie::from_root(&store, trie.hash()).unwrap();
    assert_eq!(recovered.hash(), trie.hash());
    assert_eq!(recovered.size(), trie.size());
    for (key, value) in &pairs {
        assert_eq!(recovered.get(key).unwrap(), Some(value.clone()));
    }

    // A recovered trie keeps proving and mutating through the store.
    let proof = recovered.prove(b"fruit-7").unwrap();
    assert_eq!(proof.verify(true).unwrap(), trie.hash());
    let mut recovered = recovered;
    recovered.insert(b"quince", b"Q").unwrap();
    assert_eq!(recovered.get(b"quince").unwrap(), Some(b"Q".to_vec()));

    assert_eq!(Trie::from_root(&store, NULL_HASH).unwrap().hash(), NULL_HASH);
    assert!(Trie::from_root(&store, NodeHash::random()).is_err());
}

#[test]
fn test_fork_collapse_matches_subtrie() {
    // Three keys shaped so the root forks: two sharing their first nibble
    // and parting on the second, one going its own way immediately.
    let x = find_key(|_| true);
    let xp = path_of(&x);
    let y = find_key(|p| {
        p.get_nibble(0) == xp.get_nibble(0) && p.get_nibble(1) != xp.get_nibble(1)
    });
    let z = find_key(|p| p.get_nibble(0) != xp.get_nibble(0));

    let store = InMemoryStore::new();
    let trie =
        Trie::from_list(&store, [(&x, b"X"), (&y, b"Y"), (&z, b"Z")]).unwrap();
    let rest_store = InMemoryStore::new();
    let rest = Trie::from_list(&rest_store, [(&x, b"X"), (&y, b"Y")]).unwrap();

    let proof = trie.prove(&z).unwrap();
    assert!(matches!(proof.steps(), [Step::Fork { skip: 0, .. }]));
    assert_eq!(proof.verify(false).unwrap(), rest.hash());
    assert_eq!(proof.verify(true).unwrap(), trie.hash());

    // The trie-side delete agrees.
    let mut pruned = trie.clone();
    pruned.delete(&z).unwrap();
    assert_eq!(pruned.hash(), rest.hash());
}

#[test]
fn test_branch_step_exclusion_matches_subtrie() {
    // Four keys with pairwise distinct first nibbles: removing one leaves
    // the root branch in place.
    let a = find_key(|_| true);
    let used = |p: &crate::NibblePath| p.get_nibble(0);
    let n0 = used(&path_of(&a));
    let b = find_key(|p| used(p) != n0);
    let n1 = used(&path_of(&b));
    let c = find_key(|p| used(p) != n0 && used(p) != n1);
    let n2 = used(&path_of(&c));
    let d = find_key(|p| used(p) != n0 && used(p) != n1 && used(p) != n2);

    let store = InMemoryStore::new();
    let trie = Trie::from_list(
        &store,
        [(&a, b"A"), (&b, b"B"), (&c, b"C"), (&d, b"D")],
    )
    .unwrap();
    let rest_store = InMemoryStore::new();
    let rest = Trie::from_list(&rest_store, [(&b, b"B"), (&c, b"C"), (&d, b"D")]).unwrap();

    let proof = trie.prove(&a).unwrap();
    assert!(matches!(proof.steps(), [Step::Branch { skip: 0, .. }]));
    assert_eq!(proof.verify(false).unwrap(), rest.hash());
    assert_eq!(proof.verify(true).unwrap(), trie.hash());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_construction_is_order_independent(
        pairs in arb_kv_pairs(40),
        seed in any::<u64>(),
    ) {
        let store_a = InMemoryStore::new();
        let batch = Trie::from_list(&store_a, pairs.clone()).unwrap();

        let store_b = InMemoryStore::new();
        let mut sequential = Trie::new(&store_b);
        for (key, value) in &pairs {
            sequential.insert(key, value).unwrap();
        }

        let store_c = InMemoryStore::new();
        let mut shuffled_pairs = pairs.clone();
        let mut state = seed;
        for i in (1..shuffled_pairs.len()).rev() {
            // Tiny xorshift; enough to scramble insertion order.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled_pairs.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let mut shuffled = Trie::new(&store_c);
        for (key, value) in &shuffled_pairs {
            shuffled.insert(key, value).unwrap();
        }

        prop_assert_eq!(batch.hash(), sequential.hash());
        prop_assert_eq!(batch.hash(), shuffled.hash());
        prop_assert_eq!(batch.size(), pairs.len() as u64);
        check_invariants(&batch);
        check_invariants(&sequential);
        check_store_consistency(&store_a, &batch);
        check_store_consistency(&store_b, &sequential);
    }

    #[test]
    fn test_insert_delete_rewinds_roots(pairs in arb_kv_pairs(30)) {
        let store = InMemoryStore::new();
        let mut trie = Trie::new(&store);
        let mut roots = vec![trie.hash()];
        for (key, value) in &pairs {
            trie.insert(key, value).unwrap();
            roots.push(trie.hash());
        }
        for (key, _) in pairs.iter().rev() {
            prop_assert_eq!(trie.hash(), roots.pop().unwrap());
            trie.delete(key).unwrap();
        }
        prop_assert_eq!(trie.hash(), NULL_HASH);
        prop_assert!(trie.is_empty());
        prop_assert_eq!(store.num_nodes(), 0);
    }

    #[test]
    fn test_get_returns_inserted_values(pairs in arb_kv_pairs(30)) {
        let store = InMemoryStore::new();
        let trie = Trie::from_list(&store, pairs.clone()).unwrap();
        for (key, value) in &pairs {
            prop_assert_eq!(trie.get(key).unwrap(), Some(value.clone()));
        }
    }

    #[test]
    fn test_hashes_survive_store_round_trip(pairs in arb_kv_pairs(30)) {
        let store = InMemoryStore::new();
        let trie = Trie::from_list(&store, pairs.clone()).unwrap();
        // Decoding every node back out of the store and rehashing from the
        // leaves reproduces the root.
        let recovered = Trie::from_root(&store, trie.hash()).unwrap();
        for (key, value) in &pairs {
            prop_assert_eq!(recovered.get(key).unwrap(), Some(value.clone()));
        }
        prop_assert_eq!(recovered.hash(), trie.hash());
    }
}
