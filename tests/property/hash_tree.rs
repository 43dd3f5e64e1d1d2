//! Property-based tests for hash tree determinism over random DAGs

use proptest::prelude::*;
use scenesync::scene::{MemoryScene, ObjectId};
use proptest::test_runner::TestCaseError;
use scenesync::tree::{hasher, DiamondPolicy, HashTree, RuleProvider, SceneHost, TreeOptions};
use scenesync::types::AttrValue;
use std::collections::{BTreeSet, HashSet};

const KEYS: [&str; 3] = ["a", "b", "c"];
const MEMBERSHIPS: [Option<&str>; 2] = [None, Some("m")];
const POLICIES: [DiamondPolicy; 2] = [DiamondPolicy::CountOnce, DiamondPolicy::PerEdge];

/// One node per entry: (parent index, key, membership, attribute value).
/// Extra edges always point from a lower to a higher index, so the graph stays acyclic.
#[derive(Debug, Clone)]
struct DagSpec {
    nodes: Vec<(usize, usize, usize, i64)>,
    extra: BTreeSet<(usize, usize, usize)>,
}

fn dag_strategy() -> impl Strategy<Value = DagSpec> {
    (2usize..14).prop_flat_map(|n| {
        let nodes = (1..n)
            .map(|i| (0..i, 0..KEYS.len(), 0..MEMBERSHIPS.len(), -5i64..5))
            .collect::<Vec<_>>();
        let extra = prop::collection::btree_set((0..n, 0..n, 0..MEMBERSHIPS.len()), 0..n);
        (nodes, extra).prop_map(|(nodes, extra)| DagSpec {
            nodes,
            extra: extra.into_iter().filter(|(a, b, _)| a < b).collect(),
        })
    })
}

fn build_scene(spec: &DagSpec) -> (MemoryScene, Vec<ObjectId>) {
    build_scene_with(spec, |_, key| KEYS[key].to_string())
}

/// Every object gets its own key, so identities never need a collision suffix.
fn build_unique_scene(spec: &DagSpec) -> (MemoryScene, Vec<ObjectId>) {
    build_scene_with(spec, |i, _| format!("n{}", i + 1))
}

fn build_scene_with<F>(spec: &DagSpec, key_of: F) -> (MemoryScene, Vec<ObjectId>)
where
    F: Fn(usize, usize) -> String,
{
    let mut scene = MemoryScene::new("root");
    let mut objects = vec![scene.root_id()];
    for (i, &(parent, key, membership, value)) in spec.nodes.iter().enumerate() {
        let object = scene.add_child(objects[parent], &key_of(i, key), "node", MEMBERSHIPS[membership]);
        scene.set(object, "value", AttrValue::Int(value));
        objects.push(object);
    }
    for &(a, b, membership) in &spec.extra {
        let already = scene
            .edges(&objects[a])
            .iter()
            .any(|e| e.child == objects[b] && e.membership.as_deref() == MEMBERSHIPS[membership]);
        if !already {
            scene.link_existing(objects[a], objects[b], MEMBERSHIPS[membership]);
        }
    }
    (scene, objects)
}

#[derive(Debug, Clone)]
enum Edit {
    Rename(prop::sample::Index),
    Link(prop::sample::Index, prop::sample::Index, usize),
    Unlink(prop::sample::Index),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        any::<prop::sample::Index>().prop_map(Edit::Rename),
        (any::<prop::sample::Index>(), any::<prop::sample::Index>(), 0..MEMBERSHIPS.len())
            .prop_map(|(a, b, m)| Edit::Link(a, b, m)),
        any::<prop::sample::Index>().prop_map(Edit::Unlink),
    ]
}

/// Rescan `object` if the tree still mirrors it.
fn rescan_object(tree: &mut HashTree<ObjectId>, scene: &MemoryScene, object: ObjectId) {
    if let Some(key) = tree.lookup_ref(scene.volatile_ref(&object)) {
        tree.rescan(scene, key).unwrap();
    }
}

/// Apply one edit to the host and let the tree follow. Links only go from a lower
/// to a higher creation index, which keeps the host graph acyclic.
fn apply_edit(tree: &mut HashTree<ObjectId>, scene: &mut MemoryScene, objects: &[ObjectId], step: usize, edit: &Edit) {
    match edit {
        Edit::Rename(pick) => {
            let object = objects[pick.index(objects.len())];
            scene.rename(&object, &format!("r{}_{}", object.index(), step));
            rescan_object(tree, scene, object);
        }
        Edit::Link(a, b, m) => {
            let (a, b) = (a.index(objects.len()), b.index(objects.len()));
            if a >= b {
                return;
            }
            let (parent, child) = (objects[a], objects[b]);
            let exists = scene
                .edges(&parent)
                .iter()
                .any(|e| e.child == child && e.membership.as_deref() == MEMBERSHIPS[*m]);
            if !exists {
                scene.link(&parent, &child, MEMBERSHIPS[*m]);
                rescan_object(tree, scene, parent);
            }
        }
        Edit::Unlink(pick) => {
            let parent = objects[pick.index(objects.len())];
            if let Some(edge) = scene.edges(&parent).into_iter().next() {
                scene.unlink(&parent, &edge.child, edge.membership.as_deref());
                rescan_object(tree, scene, parent);
            }
        }
    }
}

/// Structural invariants that hold whatever order the edits came in.
fn check_tree(tree: &HashTree<ObjectId>) -> Result<(), TestCaseError> {
    let identities: HashSet<String> = tree.iter().map(|n| n.identity.to_string()).collect();
    prop_assert_eq!(identities.len(), tree.len());
    for node in tree.iter() {
        prop_assert_eq!(tree.lookup(&node.identity), Some(node.key));
        prop_assert_eq!(
            node.own_hash,
            hasher::compute_own_hash(&node.identity, &node.type_tag, &node.attribute_hashes)
        );
        let expected = match tree.options().diamond_policy {
            DiamondPolicy::CountOnce => tree.unique_own_sum(node.key),
            DiamondPolicy::PerEdge => node.children.iter().fold(node.own_hash, |acc, link| {
                acc.wrapping_add(tree.get(link.node).map_or(0, |c| c.aggregate_hash))
            }),
        };
        prop_assert_eq!(node.aggregate_hash, expected, "stale aggregate at {}", node.identity);
    }
    Ok(())
}

proptest! {
    #[test]
    fn renames_match_rebuild_under_both_policies(
        spec in dag_strategy(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..6),
    ) {
        for policy in POLICIES {
            let options = TreeOptions::default().with_policy(policy);
            let (mut scene, objects) = build_unique_scene(&spec);
            let mut tree = HashTree::build(&scene, scene.root(), options.clone()).unwrap();
            for (step, pick) in picks.iter().enumerate() {
                apply_edit(&mut tree, &mut scene, &objects, step, &Edit::Rename(pick.clone()));
            }
            check_tree(&tree)?;

            let fresh = HashTree::build(&scene, scene.root(), options).unwrap();
            prop_assert_eq!(tree.len(), fresh.len());
            for node in fresh.iter() {
                let live = tree.get_by_identity(&node.identity);
                prop_assert!(live.is_some(), "{} missing after renames", node.identity);
                let live = live.unwrap();
                prop_assert_eq!(live.own_hash, node.own_hash);
                prop_assert_eq!(live.aggregate_hash, node.aggregate_hash, "{:?} at {}", policy, node.identity);
            }
            prop_assert_eq!(tree.top_hash(), fresh.top_hash());
        }
    }

    #[test]
    fn structural_edits_keep_aggregates_consistent(
        spec in dag_strategy(),
        edits in prop::collection::vec(edit_strategy(), 1..10),
    ) {
        for policy in POLICIES {
            let options = TreeOptions::default().with_policy(policy);
            let (mut scene, objects) = build_unique_scene(&spec);
            let mut tree = HashTree::build(&scene, scene.root(), options.clone()).unwrap();
            for (step, edit) in edits.iter().enumerate() {
                apply_edit(&mut tree, &mut scene, &objects, step, edit);
            }
            check_tree(&tree)?;

            // Primary parents may differ from a fresh build, but the reachable set may not.
            let fresh = HashTree::build(&scene, scene.root(), options).unwrap();
            prop_assert_eq!(tree.len(), fresh.len());
            if policy == DiamondPolicy::CountOnce {
                prop_assert_eq!(tree.top_hash(), tree.unique_own_sum(tree.root().unwrap()));
            }
        }
    }

    #[test]
    fn top_hash_counts_each_node_once(spec in dag_strategy()) {
        let (scene, objects) = build_scene(&spec);
        let tree = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
        let root = tree.root().unwrap();

        prop_assert_eq!(tree.len(), objects.len());
        prop_assert_eq!(tree.top_hash(), tree.unique_own_sum(root));
    }

    #[test]
    fn identities_are_unique(spec in dag_strategy()) {
        let (scene, _) = build_scene(&spec);
        let tree = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
        let identities: HashSet<String> = tree.iter().map(|n| n.identity.to_string()).collect();
        prop_assert_eq!(identities.len(), tree.len());
        for node in tree.iter() {
            prop_assert_eq!(tree.lookup(&node.identity), Some(node.key));
        }
    }

    #[test]
    fn independent_builds_agree(spec in dag_strategy()) {
        let (a, _) = build_scene(&spec);
        let (b, _) = build_scene(&spec);
        let ta = HashTree::build(&a, a.root(), TreeOptions::default()).unwrap();
        let tb = HashTree::build(&b, b.root(), TreeOptions::default()).unwrap();
        prop_assert_eq!(ta.top_hash(), tb.top_hash());
    }

    #[test]
    fn rescan_after_edit_matches_rebuild(spec in dag_strategy(), pick in any::<prop::sample::Index>(), value in any::<i64>()) {
        let (mut scene, objects) = build_scene(&spec);
        let mut tree = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();

        let target = objects[pick.index(objects.len())];
        scene.set(target, "value", AttrValue::Int(value));
        let key = tree.lookup_ref(scene.volatile_ref(&target)).unwrap();
        let top = tree.rescan(&scene, key).unwrap();

        let fresh = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
        prop_assert_eq!(top, fresh.top_hash());
        prop_assert_eq!(top, tree.unique_own_sum(tree.root().unwrap()));
    }
}
