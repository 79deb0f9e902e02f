use std::time::Duration;

use super::{Controller, Regulator, RegulatorShared};
use crate::{action::Action, fault::Reason, utils::test_helpers::run};

#[test]
fn abort_records_first_reason() {
    let c = Controller::new();
    assert!(!c.is_aborted());
    assert_eq!(c.reason(), None);
    assert!(c.fault().is_none());

    c.abort(Reason::Timedout);
    assert!(c.is_aborted());
    assert_eq!(c.reason(), Some(Reason::Timedout));
    assert_eq!(c.fault().map(|f| f.reason()), Some(Reason::Timedout));

    // A later abort does not overwrite the first reason.
    c.abort(Reason::Superseded);
    assert_eq!(c.reason(), Some(Reason::Timedout));
}

#[test]
fn aborted_future_resolves() {
    run(async {
        let c = Controller::new();
        let c2 = c.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            c2.abort(Reason::Unmounted);
        });
        assert_eq!(c.aborted().await, Reason::Unmounted);
    });
}

#[test]
fn policy_blocks_minting() {
    let shared = RegulatorShared::new();
    let r1 = Regulator::new(shared.clone(), 1);
    let r2 = Regulator::new(shared, 2);
    let a: Action<u32> = Action::unicast("A");

    assert!(r1.is_allowed(&a));
    r1.disallow(&a);
    // Registry-wide policy crosses instances.
    assert!(!r2.is_allowed(&a));
    assert_eq!(r2.controller(&a).reason(), Some(Reason::Disallowed));

    r2.allow(&a);
    assert!(r1.is_allowed(&a));

    r1.disallow_own(&a);
    assert!(!r1.is_allowed(&a));
    assert!(r2.is_allowed(&a));
    r1.allow_own(&a);
    assert!(r1.is_allowed(&a));
}

#[test]
fn entries_track_tasks_until_guard_drops() {
    let shared = RegulatorShared::new();
    let r = Regulator::new(shared, 1);
    let a: Action<u32> = Action::unicast("Fetch");

    let entry = r.entry(a.id(), a.name().clone());
    let tasks = r.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].action.as_ref(), "Fetch");
    assert!(!tasks[0].controller.is_aborted());

    drop(entry);
    assert!(r.tasks().is_empty());
}

#[test]
fn abort_scopes() {
    let shared = RegulatorShared::new();
    let r1 = Regulator::new(shared.clone(), 1);
    let r2 = Regulator::new(shared, 2);
    let a: Action<u32> = Action::unicast("A");
    let b: Action<u32> = Action::unicast("B");

    let e1a = r1.entry(a.id(), a.name().clone());
    let e1b = r1.entry(b.id(), b.name().clone());
    let e2a = r2.entry(a.id(), a.name().clone());

    r1.abort_own_matching(&a, Reason::Superseded);
    assert!(e1a.controller().is_aborted());
    assert!(!e1b.controller().is_aborted());
    assert!(!e2a.controller().is_aborted());

    r1.abort_matching(&b, Reason::Superseded);
    assert!(e1b.controller().is_aborted());

    r1.abort_all(Reason::Unmounted);
    assert!(e2a.controller().is_aborted());
    assert_eq!(e2a.controller().reason(), Some(Reason::Unmounted));
}

#[test]
fn release_owner_aborts_own_and_drops_own_policies() {
    let shared = RegulatorShared::new();
    let r1 = Regulator::new(shared.clone(), 1);
    let r2 = Regulator::new(shared, 2);
    let a: Action<u32> = Action::unicast("A");
    let e1 = r1.entry(a.id(), a.name().clone());
    let e2 = r2.entry(a.id(), a.name().clone());
    r1.disallow_own(&a);

    r1.release_owner();
    assert_eq!(e1.controller().reason(), Some(Reason::Unmounted));
    assert!(!e2.controller().is_aborted());
    assert!(r1.is_allowed(&a));
}
