use std::rc::Rc;
use std::time::Duration;

use super::{Annotation, Op, Process, Tracker};
use crate::{model::Node, path, utils::test_helpers::run};

fn annotate(value: impl Into<Node>, op: Op, process: &Process) -> Node {
    Node::Pending(Rc::new(Annotation::new(value.into(), op, process.clone())))
}

#[test]
fn op_flags() {
    let both = Op::ADD | Op::UPDATE;
    assert!(both.contains(Op::ADD));
    assert!(both.contains(Op::UPDATE));
    assert!(!both.contains(Op::ADD | Op::SORT));
    assert!(both.intersects(Op::ADD | Op::SORT));
    assert!(!both.intersects(Op::REMOVE));
    assert_eq!(format!("{both:?}"), "add+update");
    assert_eq!(format!("{:?}", Op::default()), "none");
}

#[test]
fn annotate_commits_plain_value_and_indexes_entry() {
    let t = Tracker::new(serde_json::json!({ "count": 1 }).into());
    let p = Process::next("Increment".into());
    t.produce(|m| m.set("count", annotate(2, Op::UPDATE, &p)));

    let i = t.inspect();
    assert_eq!(i.model().get("count").unwrap().as_i64(), Some(2));
    let at = i.at("count");
    assert!(at.pending());
    assert_eq!(at.remaining(), 1);
    assert!(at.is(Op::UPDATE));
    assert!(!at.is(Op::ADD));
    assert_eq!(at.draft().as_i64(), Some(2));
}

#[test]
fn is_requires_every_flag_in_the_mask() {
    let t = Tracker::new(Node::Null);
    let p = Process::next("Only".into());
    t.produce(|m| m.set("x", annotate(1, Op::ADD, &p)));

    let at = t.inspect().at("x");
    assert!(at.is(Op::ADD));
    assert!(!at.is(Op::ADD | Op::UPDATE));

    t.produce(|m| m.set("x", annotate(2, Op::UPDATE, &p)));
    assert!(at.is(Op::ADD | Op::UPDATE));
}

#[test]
fn remaining_counts_distinct_processes() {
    let t = Tracker::new(Node::Null);
    let p1 = Process::next("First".into());
    let p2 = Process::next("Second".into());
    t.produce(|m| m.set("x", annotate("a", Op::ADD, &p1)));
    t.produce(|m| m.set("x", annotate("b", Op::UPDATE, &p1)));

    // Two annotations, one owner.
    let at = t.inspect().at("x");
    assert_eq!(at.remaining(), 1);
    assert_eq!(at.draft().as_str(), Some("b"));

    t.produce(|m| m.set("x", annotate("c", Op::UPDATE, &p2)));
    assert_eq!(at.remaining(), 2);

    t.prune(&p1);
    assert_eq!(at.remaining(), 1);
    t.prune(&p2);
    assert_eq!(at.remaining(), 0);
}

#[test]
fn concurrent_owners_or_their_ops() {
    let t = Tracker::new(serde_json::json!({ "item": "a" }).into());
    let p1 = Process::next("First".into());
    let p2 = Process::next("Second".into());
    t.produce(|m| m.set("item", annotate("b", Op::UPDATE, &p1)));
    t.produce(|m| m.set("item", annotate("c", Op::ADD, &p2)));

    let at = t.inspect().at("item");
    assert_eq!(at.remaining(), 2);
    assert!(at.is(Op::UPDATE));
    assert!(at.is(Op::ADD));
    assert_eq!(at.ops(), Op::UPDATE | Op::ADD);
    // Last writer wins for the draft view.
    assert_eq!(at.draft().as_str(), Some("c"));

    t.prune(&p1);
    assert_eq!(at.remaining(), 1);
    assert!(!at.is(Op::UPDATE));
    assert_eq!(at.draft().as_str(), Some("c"));

    // Idempotent.
    t.prune(&p1);
    assert_eq!(at.remaining(), 1);

    t.prune(&p2);
    assert!(!at.pending());
    // With nothing pending the draft is the committed value.
    assert_eq!(at.draft().as_str(), Some("c"));
}

#[test]
fn nested_annotations_register_at_their_deep_paths() {
    let t = Tracker::new(Node::map());
    let p = Process::next("Load".into());
    t.produce(|m| {
        let mut items = Node::seq();
        items.push(annotate("first", Op::ADD, &p));
        items.push("second");
        let mut data = Node::map();
        data.set("items", items);
        m.set("data", data);
    });

    let i = t.inspect();
    assert_eq!(i.pending_paths(), vec![path!("data", "items", 0)]);
    assert_eq!(
        i.model().at(&path!("data", "items", 0)).unwrap().as_str(),
        Some("first")
    );
    assert!(i.at(path!("data", "items", 0)).is(Op::ADD));
}

#[test]
fn untouched_branch_keeps_identity_across_produce() {
    use crate::model::same_rep;

    let t = Tracker::new(serde_json::json!({ "a": { "x": 1 }, "b": { "y": 2 } }).into());
    let before = t.model();
    t.produce(|m| m.set_at(&path!("a", "x"), 10));
    let after = t.model();

    assert!(same_rep(before.get("b").unwrap(), after.get("b").unwrap()));
    assert!(!same_rep(before.get("a").unwrap(), after.get("a").unwrap()));
}

#[test]
fn hydration_is_superseded_by_real_commit_at_same_path() {
    let mut initial = Node::map();
    initial.set("user", Node::hydrating("anon", Op::ADD));
    initial.set("count", 0);
    let t = Tracker::new(initial);

    let i = t.inspect();
    assert!(i.at("user").pending());
    assert_eq!(i.model().get("user").unwrap().as_str(), Some("anon"));

    // A commit elsewhere leaves hydration alone.
    t.produce(|m| m.set("count", 1));
    assert!(i.at("user").pending());

    // A commit at the exact path clears it.
    t.produce(|m| m.set("user", "ada"));
    assert!(!i.at("user").pending());
}

#[test]
fn hydration_clears_on_explicit_prune() {
    let mut initial = Node::map();
    initial.set("user", Node::hydrating("anon", Op::ADD));
    let t = Tracker::new(initial);
    assert!(t.inspect().at("user").pending());

    t.prune(&Process::hydration());
    assert!(!t.inspect().at("user").pending());
}

#[test]
fn real_commit_keeps_fresh_annotations_while_clearing_hydration() {
    let mut initial = Node::map();
    initial.set("user", Node::hydrating("anon", Op::ADD));
    let t = Tracker::new(initial);

    let p = Process::next("Rename".into());
    t.produce(|m| m.set("user", annotate("ada", Op::UPDATE, &p)));

    let at = t.inspect().at("user");
    assert_eq!(at.remaining(), 1);
    assert!(at.is(Op::UPDATE));
    assert!(!at.is(Op::ADD));
}

#[test]
fn produce_without_changes_is_a_no_op() {
    let t = Tracker::new(serde_json::json!({ "count": 1 }).into());
    let v = t.version();
    let patches = t.produce(|_| {});
    assert!(patches.is_empty());
    assert_eq!(t.version(), v);
}

#[test]
fn settled_resolves_once_pending_clears() {
    run(async {
        let t = Tracker::new(Node::map());
        let p = Process::next("A".into());
        t.produce(|m| m.set("x", annotate(1, Op::ADD, &p)));

        let at = t.inspect().at("x");
        let t2 = t.clone();
        let p2 = p.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            t2.prune(&p2);
        });

        assert_eq!(at.settled().await.as_i64(), Some(1));
        assert!(!at.pending());
    });
}

#[test]
fn settled_resolves_immediately_when_idle() {
    run(async {
        let t = Tracker::new(serde_json::json!({ "x": 7 }).into());
        assert_eq!(t.inspect().at("x").settled().await.as_i64(), Some(7));
    });
}

#[test]
fn clear_pending_wakes_settled_waiters() {
    run(async {
        let t = Tracker::new(Node::map());
        let p = Process::next("A".into());
        t.produce(|m| m.set("x", annotate(true, Op::ADD, &p)));

        let at = t.inspect().at("x");
        let t2 = t.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t2.clear_pending();
        });
        assert_eq!(at.settled().await.as_bool(), Some(true));
    });
}
