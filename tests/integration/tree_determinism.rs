//! Integration tests for deterministic identities and hashes across replicas

use scenesync::scene::MemoryScene;
use scenesync::tree::{HashTree, RuleProvider, SceneHost, TreeOptions};
use scenesync::types::{AttrValue, Identity};
use std::collections::BTreeSet;

fn identities(tree: &HashTree<scenesync::scene::ObjectId>) -> BTreeSet<String> {
    tree.iter().map(|n| n.identity.to_string()).collect()
}

#[test]
fn test_independent_builds_agree() {
    let a = MemoryScene::sample(8);
    let b = MemoryScene::sample(8);
    let ta = HashTree::build(&a, a.root(), TreeOptions::default()).unwrap();
    let tb = HashTree::build(&b, b.root(), TreeOptions::default()).unwrap();

    assert_eq!(ta.top_hash(), tb.top_hash());
    assert_eq!(identities(&ta), identities(&tb));
    assert_eq!(ta.len(), 1 + 1 + 8 * 2);
}

#[test]
fn test_attribute_enumeration_order_does_not_matter() {
    let mut a = MemoryScene::new("scene");
    let ra = a.root_id();
    a.set(ra, "fps", AttrValue::Int(24));
    a.set(ra, "unit", AttrValue::from("metric"));

    let mut b = MemoryScene::new("scene");
    let rb = b.root_id();
    b.set(rb, "unit", AttrValue::from("metric"));
    b.set(rb, "fps", AttrValue::Int(24));

    let ta = HashTree::build(&a, ra, TreeOptions::default()).unwrap();
    let tb = HashTree::build(&b, rb, TreeOptions::default()).unwrap();
    assert_eq!(ta.top_hash(), tb.top_hash());
}

#[test]
fn test_sibling_collisions_get_distinct_suffixes() {
    let mut scene = MemoryScene::new("scene");
    let root = scene.root_id();
    let first = scene.add_child(root, "cube", "mesh", Some("objects"));
    let second = scene.add_child(root, "cube", "mesh", Some("objects"));
    let tree = HashTree::build(&scene, root, TreeOptions::default()).unwrap();

    let a = tree.lookup_ref(scene.volatile_ref(&first)).unwrap();
    let b = tree.lookup_ref(scene.volatile_ref(&second)).unwrap();
    assert_eq!(tree.get(a).unwrap().identity, Identity::new("scene/objects:cube"));
    assert_eq!(tree.get(b).unwrap().identity, Identity::new("scene/objects:cube#1"));
}

#[test]
fn test_membership_separates_same_key() {
    let mut scene = MemoryScene::new("scene");
    let root = scene.root_id();
    scene.add_child(root, "cube", "mesh", Some("objects"));
    scene.add_child(root, "cube", "mesh", Some("meshes"));
    let tree = HashTree::build(&scene, root, TreeOptions::default()).unwrap();

    assert!(tree.lookup(&Identity::new("scene/objects:cube")).is_some());
    assert!(tree.lookup(&Identity::new("scene/meshes:cube")).is_some());
}

#[test]
fn test_incremental_rescan_matches_fresh_build() {
    let mut scene = MemoryScene::sample(6);
    let mut tree = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
    let rigs = scene.objects_of_type("object");

    scene.set(rigs[4], "visible", AttrValue::Bool(false));
    scene.set(rigs[1], "scale", AttrValue::Float(2.0));
    let keys: Vec<_> = [rigs[4], rigs[1]]
        .iter()
        .map(|o| tree.lookup_ref(scene.volatile_ref(o)).unwrap())
        .collect();
    let top = tree.rescan_many(&scene, &keys).unwrap();

    let fresh = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
    assert_eq!(top, fresh.top_hash());

    let batch = tree.take_batch();
    assert_eq!(batch.top_hash, top);
    assert_eq!(batch.changes.len(), 2);
    assert!(tree.take_batch().is_empty());
}

#[test]
fn test_structural_growth_is_picked_up_by_parent_rescan() {
    let mut scene = MemoryScene::sample(2);
    let mut tree = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
    let rig = scene.objects_of_type("object")[0];

    let lamp = scene.add_child(rig, "lamp", "light", Some("children"));
    scene.set(lamp, "power", AttrValue::Float(60.0));
    let key = tree.lookup_ref(scene.volatile_ref(&rig)).unwrap();
    tree.rescan(&scene, key).unwrap();

    assert!(tree
        .lookup(&Identity::new("scene/objects:rig_000/children:lamp"))
        .is_some());
    let fresh = HashTree::build(&scene, scene.root(), TreeOptions::default()).unwrap();
    assert_eq!(tree.top_hash(), fresh.top_hash());
}
