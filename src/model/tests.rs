use super::{diff, diff::same_rep, Node, Patch};
use crate::path;

fn sample() -> Node {
    serde_json::from_str(
        r#"{
            "user": { "name": "ada", "age": 36 },
            "todos": [
                { "title": "write", "done": false },
                { "title": "ship", "done": true }
            ],
            "count": 1
        }"#,
    )
    .unwrap()
}

#[test]
fn reads() {
    let m = sample();
    assert_eq!(m.get("count").and_then(Node::as_i64), Some(1));
    assert_eq!(
        m.at(&path!("user", "name")).and_then(Node::as_str),
        Some("ada")
    );
    assert_eq!(
        m.at(&path!("todos", 1, "done")).and_then(Node::as_bool),
        Some(true)
    );
    assert_eq!(m.at(&path!("todos", 9)), None);
    assert_eq!(m.at(&path!("count", "x")), None);
    assert_eq!(m.as_f64(), None);
    assert_eq!(Node::from(2).as_f64(), Some(2.0));
}

#[test]
fn clone_is_shallow_and_mutation_copies_the_spine() {
    let old = sample();
    let mut new = old.clone();
    new.set_at(&path!("user", "age"), 37);

    assert_eq!(old.at(&path!("user", "age")).unwrap().as_i64(), Some(36));
    assert_eq!(new.at(&path!("user", "age")).unwrap().as_i64(), Some(37));

    // The untouched branch keeps its Rc identity, the touched one does not.
    assert!(same_rep(old.get("todos").unwrap(), new.get("todos").unwrap()));
    assert!(!same_rep(old.get("user").unwrap(), new.get("user").unwrap()));
}

#[test]
fn diff_single_leaf_change() {
    let old = sample();
    let mut new = old.clone();
    new.set_at(&path!("todos", 0, "done"), true);

    let patches = diff(&old, &new);
    assert_eq!(
        patches,
        vec![Patch::set(path!("todos", 0, "done"), Node::Bool(true))]
    );
}

#[test]
fn diff_skips_shared_branches_without_descending() {
    let old = sample();
    let mut new = old.clone();
    new.set("count", 2);

    let patches = diff(&old, &new);
    assert_eq!(patches, vec![Patch::set(path!("count"), Node::Int(2))]);
}

#[test]
fn diff_map_add_and_remove() {
    let old = sample();
    let mut new = old.clone();
    new.set("extra", "x");
    new.remove("count");

    let mut patches = diff(&old, &new);
    patches.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(
        patches,
        vec![
            Patch::remove(path!("count")),
            Patch::set(path!("extra"), Node::from("x")),
        ]
    );
}

#[test]
fn diff_seq_grow_and_shrink() {
    let old = Node::from(vec![1, 2, 3]);
    let grown = Node::from(vec![1, 2, 3, 4, 5]);
    assert_eq!(
        diff(&old, &grown),
        vec![
            Patch::set(path!(3), Node::Int(4)),
            Patch::set(path!(4), Node::Int(5)),
        ]
    );

    let shrunk = Node::from(vec![1]);
    // Highest index first so sequential application stays in bounds.
    assert_eq!(
        diff(&old, &shrunk),
        vec![Patch::remove(path!(2)), Patch::remove(path!(1))]
    );
}

#[test]
fn diff_kind_change_replaces_subtree() {
    let old = sample();
    let mut new = old.clone();
    new.set("todos", "gone");

    let patches = diff(&old, &new);
    assert_eq!(patches, vec![Patch::set(path!("todos"), Node::from("gone"))]);
}

#[test]
fn diff_equal_trees_is_empty() {
    let a = sample();
    let b = sample();
    // Value-equal but not Rc-shared still yields no patches.
    assert_eq!(diff(&a, &b), vec![]);
}

#[test]
fn patches_reconstruct_the_new_tree() {
    let old = sample();
    let mut new = old.clone();
    new.set_at(&path!("user", "name"), "grace");
    new.remove("count");
    new.at_mut(&path!("todos")).seq_mut().remove(0);
    new.at_mut(&path!("todos"))
        .push(serde_json::json!({ "title": "rest", "done": false }));

    let mut rebuilt = old.clone();
    for patch in diff(&old, &new) {
        patch.apply_to(&mut rebuilt);
    }
    assert_eq!(rebuilt, new);
}

#[test]
fn vivify_and_extend() {
    let mut m = Node::Null;
    m.set_at(&path!("a", "b"), 1);
    assert_eq!(m.at(&path!("a", "b")).unwrap().as_i64(), Some(1));

    m.set_at(&path!("items", 0), "first");
    m.set_at(&path!("items", 1), "second");
    assert_eq!(m.get("items").unwrap().as_seq().unwrap().len(), 2);
}

#[test]
fn remove_at_missing_is_none() {
    let mut m = sample();
    assert_eq!(m.remove_at(&path!("nope", "deep")), None);
    assert_eq!(m.remove_at(&path!("todos", 9)), None);
    assert!(m.remove_at(&path!("todos", 0)).is_some());
    assert_eq!(m.get("todos").unwrap().as_seq().unwrap().len(), 1);
}

#[test]
#[should_panic(expected = "cannot use int node as a map")]
fn set_on_scalar_panics() {
    let mut m = Node::from(5);
    m.set("k", 1);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn far_index_panics() {
    let mut m = Node::seq();
    m.set_at(&path!(3), 1);
}

#[test]
fn serde_round_trip() {
    let m = sample();
    let json = serde_json::to_string(&m).unwrap();
    let back: Node = serde_json::from_str(&json).unwrap();
    assert_eq!(back, m);
    assert_eq!(m.to_string(), json);
}

#[test]
fn path_display_and_order() {
    assert_eq!(path!("todos", 0, "title").to_string(), "todos[0].title");
    assert_eq!(path!().to_string(), "");
    assert!(path!("a") < path!("a", "b"));
    assert!(path!("a", "b") < path!("b"));
}
