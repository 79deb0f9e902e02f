use std::{cell::RefCell, future::Future, rc::Rc, time::Duration};

use assert_call::{call, CallRecorder};
use impel::{handler, path, Action, ActionContext, Engine, Op, Reason, Registry};
use serde_json::json;

fn run(f: impl Future<Output = ()>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, f);
}

async fn pump() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn optimistic_add_shows_a_draft_and_settles() {
    run(async {
        let registry = Registry::new();
        let engine = Engine::new(&registry, json!({ "todos": [] }));
        engine.mount();

        let add = Action::<String>::unicast("AddTodo");
        let _h = engine.attach(
            &add,
            handler(|cx: ActionContext, title: Rc<String>| async move {
                let draft = cx.pending(title.as_str(), Op::ADD);
                cx.produce(|m| m.at_mut(&path!("todos")).push(draft));
                cx.sleep(Duration::from_millis(50)).await?;
                cx.produce(|m| m.set_at(&path!("todos", 0), title.as_str()));
                Ok(())
            }),
        );

        let done = engine.dispatch(&add, "milk".to_string());
        pump().await;

        let probe = engine.inspect().at(path!("todos", 0));
        assert!(probe.pending());
        assert!(probe.is(Op::ADD));
        assert_eq!(probe.draft().as_str(), Some("milk"));

        done.await;
        let model = engine.model();
        let todos = model.get("todos").unwrap().as_seq().unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].as_str(), Some("milk"));
        assert!(!engine.inspect().at(path!("todos", 0)).pending());
    });
}

#[test]
fn broadcast_replays_to_engines_mounted_later() {
    run(async {
        let mut cr = CallRecorder::new();
        let registry = Registry::new();
        let set_user = Action::<String>::broadcast("SetUser");
        let on_set = |tag: &'static str| {
            handler(move |cx: ActionContext, name: Rc<String>| async move {
                call!("{tag} {name} {}", cx.phase());
                cx.produce(|m| m.set("user", name.as_str()));
                Ok(())
            })
        };

        let a = Engine::new(&registry, json!({ "user": null }));
        let _ha = a.attach(&set_user, on_set("a"));
        a.mount();
        a.dispatch(&set_user, "alice".to_string()).await;

        let b = Engine::new(&registry, json!({ "user": null }));
        let _hb = b.attach(&set_user, on_set("b"));
        b.mount();
        pump().await;

        cr.verify(["a alice live", "b alice replay"]);
        let model = b.model();
        assert_eq!(model.get("user").unwrap().as_str(), Some("alice"));
    });
}

#[test]
fn superseded_refresh_is_reported_not_surfaced() {
    run(async {
        let mut cr = CallRecorder::new();
        let registry = Registry::new();
        let reasons = Rc::new(RefCell::new(Vec::new()));
        registry.on_fault({
            let reasons = reasons.clone();
            move |report| reasons.borrow_mut().push(report.reason)
        });

        let engine = Engine::new(&registry, json!({ "generation": 0 }));
        engine.mount();

        let refresh = Action::<i64>::unicast("Refresh");
        let _h = engine.attach(
            &refresh,
            handler(|cx: ActionContext, n: Rc<i64>| async move {
                call!("start {n}");
                cx.sleep(Duration::from_millis(100)).await?;
                cx.produce(|m| m.set("generation", *n));
                call!("done {n}");
                Ok(())
            })
            .supplant(),
        );

        let first = engine.dispatch(&refresh, 1);
        pump().await;
        let second = engine.dispatch(&refresh, 2);
        futures::join!(first, second);

        cr.verify(["start 1", "start 2", "done 2"]);
        assert_eq!(*reasons.borrow(), [Reason::Superseded]);
        let model = engine.model();
        assert_eq!(model.get("generation").unwrap().as_i64(), Some(2));
    });
}
