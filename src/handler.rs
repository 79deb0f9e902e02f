use std::{any::Any, cell::RefCell, future::Future, marker::PhantomData, rc::Rc, time::Duration};

use futures::{future::LocalBoxFuture, FutureExt};
use parse_display::Display;
use tokio::{
    sync::oneshot,
    task::spawn_local,
    time::{sleep, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    action::{Action, Scalar},
    engine::{ActionContext, Engine},
    fault::{Fault, Reason},
    model::Node,
};


pub(crate) type RawHandler =
    Rc<dyn Fn(ActionContext, Rc<dyn Any>) -> LocalBoxFuture<'static, Result<(), Fault>>>;

/// Wraps an async closure as a [`Handler`].
///
/// The closure receives the invocation's [`ActionContext`] and the dispatched
/// payload.
///
/// ```
/// use impel::handler;
///
/// let h = handler(|cx, n: std::rc::Rc<i64>| async move {
///     cx.produce(|model| model.set("count", *n));
///     Ok(())
/// });
/// # let _ = h.supplant().retry_default();
/// ```
pub fn handler<T, Fut>(f: impl Fn(ActionContext, Rc<T>) -> Fut + 'static) -> Handler<T>
where
    T: 'static,
    Fut: Future<Output = Result<(), Fault>> + 'static,
{
    let f = Rc::new(f);
    Handler {
        raw: Rc::new(move |cx, payload| {
            let Ok(payload) = payload.downcast::<T>() else {
                unreachable!("dispatch payload type is pinned by the action")
            };
            f(cx, payload).boxed_local()
        }),
        driver: None,
        detached: false,
        _action: PhantomData,
    }
}

/// An action handler plus the concurrency behaviors layered onto it.
///
/// Build one with [`handler`], refine it with the combinators below, then
/// register it with [`Engine::attach`]. Combinators nest outside-in: the
/// last one applied observes the whole chain beneath it, so
/// `h.retry_default().timeout(limit)` runs one timer over the entire retry
/// sequence. Note that [`Handler::retry`] never retries abort-classified
/// faults, which includes timeouts.
pub struct Handler<T: 'static> {
    pub(crate) raw: RawHandler,
    pub(crate) driver: Option<Driver<T>>,
    pub(crate) detached: bool,
    pub(crate) _action: PhantomData<fn(T)>,
}

impl<T: 'static> Handler<T> {
    /// Aborts the previous in-flight invocation for the same action before
    /// this one starts.
    ///
    /// The superseded invocation faults with [`Reason::Superseded`]. The
    /// bookkeeping is registry-wide: a supplanting dispatch on one engine
    /// aborts the in-flight invocation on another.
    pub fn supplant(mut self) -> Self {
        let inner = self.raw;
        self.raw = Rc::new(move |cx, payload| {
            let inner = inner.clone();
            async move {
                let mine = cx.controller().clone();
                if let Some(prev) = cx.supplant_swap(mine.clone()) {
                    if !prev.same(&mine) {
                        prev.abort(Reason::Superseded);
                    }
                }
                let out = inner(cx.clone(), payload).await;
                cx.supplant_release(&mine);
                out
            }
            .boxed_local()
        });
        self
    }

    /// Delays execution until `delay` elapses with no newer call; the newer
    /// call supersedes the waiting one.
    pub fn debounce(mut self, delay: Duration) -> Self {
        let state = Rc::new(RefCell::new(DebounceState {
            generation: 0,
            cancel: None,
        }));
        let inner = self.raw;
        self.raw = Rc::new(move |cx, payload| {
            let inner = inner.clone();
            let state = state.clone();
            async move {
                let token = CancellationToken::new();
                let generation = {
                    let mut s = state.borrow_mut();
                    if let Some(prev) = s.cancel.replace(token.clone()) {
                        prev.cancel();
                    }
                    s.generation += 1;
                    s.generation
                };
                let wait = tokio::select! {
                    _ = sleep(delay) => Ok(()),
                    _ = token.cancelled() => Err(Fault::Superseded),
                    reason = cx.controller().aborted() => Err(Fault::from(reason)),
                };
                {
                    let mut s = state.borrow_mut();
                    if s.generation == generation {
                        s.cancel = None;
                    }
                }
                wait?;
                inner(cx, payload).await
            }
            .boxed_local()
        });
        self
    }

    /// Executes the first call immediately; calls arriving inside the window
    /// are coalesced into one trailing execution of the last of them, whose
    /// outcome every coalesced caller shares. The window closes only once it
    /// elapses with nothing queued.
    pub fn throttle(mut self, window: Duration) -> Self {
        let state = Rc::new(RefCell::new(ThrottleState {
            until: None,
            queued: None,
            waiters: Vec::new(),
            draining: false,
        }));
        let inner = self.raw;
        self.raw = Rc::new(move |cx, payload| {
            let inner = inner.clone();
            let state = state.clone();
            async move {
                let wait = {
                    let mut s = state.borrow_mut();
                    let now = Instant::now();
                    if s.draining || s.until.is_some_and(|t| now < t) {
                        s.queued = Some((cx.clone(), payload.clone()));
                        let (tx, rx) = oneshot::channel();
                        s.waiters.push(tx);
                        Some(rx)
                    } else {
                        s.until = Some(now + window);
                        None
                    }
                };
                match wait {
                    Some(rx) => {
                        tokio::select! {
                            out = rx => match out {
                                Ok(out) => out,
                                Err(_) => Err(Fault::Superseded),
                            },
                            reason = cx.controller().aborted() => Err(Fault::from(reason)),
                        }
                    }
                    None => {
                        spawn_drain(state.clone(), inner.clone(), window);
                        inner(cx, payload).await
                    }
                }
            }
            .boxed_local()
        });
        self
    }

    /// Retries non-abort faults after each interval in sequence; once the
    /// intervals are exhausted the last fault propagates. Abort faults are
    /// never retried, and an abort during a backoff delay cancels the
    /// scheduled retry.
    pub fn retry(mut self, intervals: impl IntoIterator<Item = Duration>) -> Self {
        let intervals: Rc<[Duration]> = intervals.into_iter().collect();
        let inner = self.raw;
        self.raw = Rc::new(move |cx, payload| {
            let inner = inner.clone();
            let intervals = intervals.clone();
            async move {
                let mut attempt = 0;
                loop {
                    match inner(cx.clone(), payload.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(fault) if fault.is_abort() => return Err(fault),
                        Err(fault) => {
                            let Some(&delay) = intervals.get(attempt) else {
                                return Err(fault);
                            };
                            attempt += 1;
                            tracing::debug!(action = %cx.action(), attempt, "retrying after fault");
                            cx.sleep(delay).await?;
                        }
                    }
                }
            }
            .boxed_local()
        });
        self
    }

    /// [`Handler::retry`] with a 1s, 2s, 4s backoff.
    pub fn retry_default(self) -> Self {
        self.retry([
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ])
    }

    /// Races the handler against a timer. On timeout the invocation's
    /// controller aborts with [`Reason::Timedout`] and the invocation faults.
    pub fn timeout(mut self, limit: Duration) -> Self {
        let inner = self.raw;
        self.raw = Rc::new(move |cx, payload| {
            let inner = inner.clone();
            async move {
                tokio::select! {
                    out = inner(cx.clone(), payload) => out,
                    _ = sleep(limit) => {
                        cx.controller().abort(Reason::Timedout);
                        Err(Fault::Timedout)
                    }
                    reason = cx.controller().aborted() => Err(Fault::from(reason)),
                }
            }
            .boxed_local()
        });
        self
    }

    /// Marks the handler fire-and-forget: dispatch starts it but does not
    /// await it.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Re-dispatches the action whenever the scalars probed from the model
    /// change, starting with one dispatch for the initial probe.
    ///
    /// Restricting probes to scalars is deliberate: comparing references
    /// would re-trigger on every commit.
    pub fn reactive(self, deps: impl Fn(&Node) -> Vec<Scalar> + 'static) -> Self
    where
        T: Default,
    {
        self.reactive_with(deps, |_| T::default())
    }

    /// [`Handler::reactive`] with the payload built from the model at each
    /// dispatch.
    pub fn reactive_with(
        mut self,
        deps: impl Fn(&Node) -> Vec<Scalar> + 'static,
        payload: impl Fn(&Node) -> T + 'static,
    ) -> Self {
        self.driver = Some(Driver::Reactive {
            deps: Rc::new(deps),
            payload: Rc::new(payload),
        });
        self
    }

    /// Re-dispatches the action on a fixed interval while the engine is
    /// mounted.
    pub fn poll(self, interval: Duration) -> Self
    where
        T: Default,
    {
        self.poll_with(interval, |_| T::default())
    }

    /// [`Handler::poll`] with the payload built from the model at each tick.
    pub fn poll_with(self, interval: Duration, payload: impl Fn(&Node) -> T + 'static) -> Self {
        self.poll_while(interval, payload, |_| PollStatus::Playing)
    }

    /// [`Handler::poll_with`] gated by a status probe. While the probe
    /// reports [`PollStatus::Paused`] no new ticks start; an in-flight tick
    /// is not cancelled by pausing.
    pub fn poll_while(
        mut self,
        interval: Duration,
        payload: impl Fn(&Node) -> T + 'static,
        status: impl Fn(&Node) -> PollStatus + 'static,
    ) -> Self {
        self.driver = Some(Driver::Poll {
            interval,
            payload: Rc::new(payload),
            status: Rc::new(status),
        });
        self
    }
}

/// Play state probed by [`Handler::poll_while`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum PollStatus {
    #[display("playing")]
    Playing,
    #[display("paused")]
    Paused,
}

pub(crate) enum Driver<T> {
    Reactive {
        deps: Rc<dyn Fn(&Node) -> Vec<Scalar>>,
        payload: Rc<dyn Fn(&Node) -> T>,
    },
    Poll {
        interval: Duration,
        payload: Rc<dyn Fn(&Node) -> T>,
        status: Rc<dyn Fn(&Node) -> PollStatus>,
    },
}

pub(crate) async fn drive<T: 'static>(engine: Engine, action: Action<T>, driver: Driver<T>) {
    match driver {
        Driver::Reactive { deps, payload } => {
            let mut last: Option<Vec<Scalar>> = None;
            loop {
                if engine.is_mounted() {
                    let model = engine.model();
                    let probe = deps(&model);
                    if last.as_ref() != Some(&probe) {
                        tracing::trace!(action = %action.name(), "reactive probe changed");
                        last = Some(probe);
                        engine.dispatch(&action, payload(&model)).await;
                        // The dispatch may have moved the probe again.
                        continue;
                    }
                }
                engine.idle().await;
            }
        }
        Driver::Poll {
            interval,
            payload,
            status,
        } => loop {
            if engine.is_mounted() && status(&engine.model()) == PollStatus::Playing {
                engine.dispatch(&action, payload(&engine.model())).await;
                sleep(interval).await;
            } else {
                engine.idle().await;
            }
        },
    }
}

struct DebounceState {
    generation: u64,
    cancel: Option<CancellationToken>,
}

struct ThrottleState {
    until: Option<Instant>,
    queued: Option<(ActionContext, Rc<dyn Any>)>,
    waiters: Vec<oneshot::Sender<Result<(), Fault>>>,
    draining: bool,
}

fn spawn_drain(state: Rc<RefCell<ThrottleState>>, inner: RawHandler, window: Duration) {
    state.borrow_mut().draining = true;
    spawn_local(async move {
        loop {
            let Some(until) = state.borrow().until else {
                break;
            };
            sleep_until(until).await;
            let run = {
                let mut s = state.borrow_mut();
                let queued = s
                    .queued
                    .take()
                    .filter(|(cx, _)| !cx.controller().is_aborted());
                match queued {
                    Some(run) => {
                        // Execution opens the next window.
                        s.until = Some(Instant::now() + window);
                        Some((run, std::mem::take(&mut s.waiters)))
                    }
                    None => {
                        // Dropping the senders rejects any caller still queued.
                        s.waiters.clear();
                        s.until = None;
                        s.draining = false;
                        None
                    }
                }
            };
            let Some(((cx, payload), waiters)) = run else {
                break;
            };
            let out = inner(cx, payload).await;
            for tx in waiters {
                let _ = tx.send(out.clone());
            }
        }
    });
}
