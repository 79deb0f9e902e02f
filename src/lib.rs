//! An action dispatch and optimistic state engine for single-threaded UI
//! runtimes.
//!
//! Handlers attached to an [`Engine`] receive dispatched actions, mutate the
//! engine's model through copy-on-write drafts, and can mark values as
//! pending while their work is in flight. [`Inspect`] exposes that pending
//! state to consumers. Middleware on [`Handler`] layers supplant, debounce,
//! throttle, retry and timeout behavior over a handler, and a [`Registry`]
//! connects engines for broadcast delivery, mount-time replay and cached
//! resolution.
//!
//! ```
//! use impel::{handler, Action, Engine, Op, Registry};
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! let local = tokio::task::LocalSet::new();
//! local.block_on(&rt, async {
//!     let registry = Registry::new();
//!     let engine = Engine::new(&registry, serde_json::json!({ "count": 1 }));
//!     engine.mount();
//!
//!     let increment: Action<i64> = Action::unicast("Increment");
//!     let _h = engine.attach(
//!         &increment,
//!         handler(|cx, by: std::rc::Rc<i64>| async move {
//!             let next = cx.model().get("count").and_then(|n| n.as_i64()).unwrap_or(0) + *by;
//!             // Visible immediately, marked pending until the handler settles.
//!             cx.produce(|m| m.set("count", cx.pending(next, Op::UPDATE)));
//!             cx.produce(|m| m.set("count", next));
//!             Ok(())
//!         }),
//!     );
//!     engine.dispatch(&increment, 1).await;
//!     assert_eq!(engine.model().get("count").and_then(|n| n.as_i64()), Some(2));
//! });
//! ```

mod action;
mod cache;
mod engine;
mod fault;
mod handler;
mod model;
mod regulate;
mod track;
mod utils;

pub use action::*;
pub use cache::{CacheKey, ChanneledKey};
pub use engine::*;
pub use fault::*;
pub use handler::{handler, Handler, PollStatus};
pub use model::*;
pub use regulate::{Controller, Regulator, TaskEntry};
pub use track::*;
