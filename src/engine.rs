use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    panic::resume_unwind,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    future::{join_all, LocalBoxFuture},
    FutureExt,
};
use parse_display::Display;
use slabmap::SlabMap;
use tokio::{
    sync::Notify,
    task::{spawn_local, JoinHandle},
};

use crate::{
    action::{channel_matches, Action, Channel, Channeled, Distribution, Scope},
    cache::{CacheKey, CacheStore, ChanneledKey},
    fault::{Fault, FaultReport},
    handler::{drive, Handler, RawHandler},
    model::{Node, Patch},
    regulate::{Controller, Regulator, RegulatorShared, TaskEntry},
    track::{Annotation, Inspect, Op, Process, Tracker},
    utils::next_id,
};


/// Distinguishes a live delivery from the replay of a recorded dispatch at
/// mount time.
///
/// Handlers with side effects (network fetches in particular) can skip work
/// they already performed when the phase is [`Phase::Replay`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Phase {
    #[display("live")]
    Live,
    #[display("replay")]
    Replay,
}

/// Process-wide hub shared by every [`Engine`].
///
/// The registry owns everything that outlives a single engine: the bus table
/// used by broadcast and multicast delivery, the replay records handed to late
/// mounts, supplant bookkeeping, shared abort policies, the TTL cache and the
/// fault sink. Engines created from the same registry see each other; engines
/// created from different registries are fully isolated.
#[derive(Clone)]
pub struct Registry(Rc<RegistryShared>);

struct RegistryShared {
    buses: RefCell<SlabMap<Weak<EngineShared>>>,
    replay: RefCell<HashMap<(u64, Option<u64>), ReplayRecord>>,
    supplant: RefCell<HashMap<u64, Controller>>,
    regulator: Rc<RegulatorShared>,
    cache: CacheStore,
    sink: RefCell<Option<Rc<dyn Fn(FaultReport)>>>,
}

struct ReplayRecord {
    payload: Rc<dyn Any>,
    channel: Option<Channel>,
}

impl Registry {
    pub fn new() -> Self {
        Self(Rc::new(RegistryShared {
            buses: RefCell::new(SlabMap::new()),
            replay: RefCell::new(HashMap::new()),
            supplant: RefCell::new(HashMap::new()),
            regulator: RegulatorShared::new(),
            cache: CacheStore::new(),
            sink: RefCell::new(None),
        }))
    }

    /// Installs the process-wide fault sink, replacing any previous one.
    ///
    /// Handler faults never reach the dispatching caller; they are delivered
    /// here instead. Without a sink they are logged and dropped.
    pub fn on_fault(&self, sink: impl Fn(FaultReport) + 'static) {
        *self.0.sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub fn clear_fault_sink(&self) {
        *self.0.sink.borrow_mut() = None;
    }

    /// Returns the cached value for `key`, resolving it at most once.
    ///
    /// A fresh entry is served as-is. While a resolution is in flight,
    /// concurrent calls for the same key await that flight instead of invoking
    /// `resolve` again. Faults are handed to every waiting caller and are not
    /// cached.
    pub async fn cacheable<T, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        resolve: impl FnOnce() -> Fut,
    ) -> Result<Rc<T>, Fault>
    where
        T: 'static,
        Fut: Future<Output = Result<T, Fault>> + 'static,
    {
        self.0.cache.fetch(key, &Channel::new(), ttl, resolve).await
    }

    /// [`Registry::cacheable`] addressing one channel slot of `key`.
    pub async fn cacheable_channeled<T, Fut>(
        &self,
        key: &ChanneledKey,
        ttl: Duration,
        resolve: impl FnOnce() -> Fut,
    ) -> Result<Rc<T>, Fault>
    where
        T: 'static,
        Fut: Future<Output = Result<T, Fault>> + 'static,
    {
        self.0.cache.fetch(key.key(), key.channel(), ttl, resolve).await
    }

    /// Eagerly drops every cache entry stored under `key`.
    pub fn invalidate(&self, key: &CacheKey) {
        self.0.cache.invalidate(key);
    }

    /// Eagerly drops the cache entries whose channel contains the filter
    /// carried by `key`.
    pub fn invalidate_channeled(&self, key: &ChanneledKey) {
        self.0.cache.invalidate_channeled(key);
    }

    /// Forgets the recorded dispatches of `action`, so future mounts replay
    /// nothing for it.
    pub fn clear_replay<T>(&self, action: &Action<T>) {
        self.0
            .replay
            .borrow_mut()
            .retain(|(id, _), _| *id != action.id());
    }

    fn report(&self, action: &Rc<str>, fault: Fault) {
        let sink = self.0.sink.borrow().clone();
        let report = FaultReport {
            action: action.clone(),
            reason: fault.reason(),
            fault,
            handled: sink.is_some(),
        };
        match &sink {
            Some(sink) => {
                tracing::debug!(action = %report.action, reason = %report.reason, "handler fault");
                sink(report);
            }
            None => {
                tracing::warn!(
                    action = %report.action,
                    reason = %report.reason,
                    fault = %report.fault,
                    "unhandled fault"
                );
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("buses", &self.0.buses.borrow().len())
            .field("replay", &self.0.replay.borrow().len())
            .finish()
    }
}

/// A component-scoped bus owning one model and the handlers attached to it.
///
/// An engine starts unmounted: handlers can be attached and the model read,
/// but broadcast traffic does not reach it until [`Engine::mount`]. Cloning an
/// engine clones a handle to the same instance.
#[derive(Clone)]
pub struct Engine(Rc<EngineShared>);

struct EngineShared {
    registry: Registry,
    instance: u64,
    scope: Option<Scope>,
    tracker: Tracker,
    handlers: RefCell<BTreeMap<u64, HandlerSlot>>,
    wake: Notify,
    mounted: Cell<bool>,
    bus_key: Cell<Option<usize>>,
}

struct HandlerSlot {
    action: u64,
    name: Rc<str>,
    distribution: Distribution,
    filter: Option<Channel>,
    raw: RawHandler,
    detached: bool,
    replayed: Cell<bool>,
}

impl Engine {
    pub fn new(registry: &Registry, model: impl Into<Node>) -> Self {
        Self::builder(registry).model(model).build()
    }

    pub fn builder(registry: &Registry) -> EngineBuilder {
        EngineBuilder {
            registry: registry.clone(),
            scope: None,
            model: Node::Null,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.0.scope.as_ref()
    }

    pub fn is_mounted(&self) -> bool {
        self.0.mounted.get()
    }

    /// Snapshot of the current model. Cheap: subtrees are shared by
    /// reference.
    pub fn model(&self) -> Node {
        self.0.tracker.model()
    }

    /// Read-only view over pending annotations.
    pub fn inspect(&self) -> Inspect {
        self.0.tracker.inspect()
    }

    /// Commit counter; bumps once per non-empty [`Engine::produce`].
    pub fn version(&self) -> u64 {
        self.0.tracker.version()
    }

    /// Resolves when the model or the pending index next change.
    pub async fn changed(&self) {
        self.0.tracker.changed().await;
    }

    /// Runs `mutate` against a draft of the model and commits the resulting
    /// patches. Returns the patches applied; an untouched draft commits
    /// nothing.
    pub fn produce(&self, mutate: impl FnOnce(&mut Node)) -> Vec<Patch> {
        self.0.tracker.produce(mutate)
    }

    /// Drops the pending entries left by [`Node::hydrating`] values in the
    /// initial model that no later commit has superseded.
    pub fn prune_hydration(&self) {
        self.0.tracker.prune(&Process::hydration());
    }

    /// The regulator view scoped to this engine instance.
    pub fn regulator(&self) -> Regulator {
        Regulator::new(self.0.registry.0.regulator.clone(), self.0.instance)
    }

    /// Live `(action, controller)` pairs for this engine's in-flight
    /// handlers, for manual cancellation.
    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.regulator().tasks()
    }

    /// Registers a handler for `action`. The handler stays attached until the
    /// returned guard drops.
    pub fn attach<T: 'static>(&self, action: &Action<T>, handler: Handler<T>) -> Attached {
        self.attach_impl(action, None, handler)
    }

    /// Registers a handler that only receives dispatches whose channel
    /// contains the filter carried by `target`.
    pub fn attach_channeled<T: 'static>(
        &self,
        target: &Channeled<T>,
        handler: Handler<T>,
    ) -> Attached {
        self.attach_impl(target.action(), Some(target.channel().clone()), handler)
    }

    fn attach_impl<T: 'static>(
        &self,
        action: &Action<T>,
        filter: Option<Channel>,
        handler: Handler<T>,
    ) -> Attached {
        let Handler {
            raw,
            driver,
            detached,
            ..
        } = handler;
        let key = next_id();
        self.0.handlers.borrow_mut().insert(
            key,
            HandlerSlot {
                action: action.id(),
                name: action.name().clone(),
                distribution: action.distribution().clone(),
                filter,
                raw,
                detached,
                replayed: Cell::new(false),
            },
        );
        tracing::debug!(action = %action.name(), engine = self.0.instance, "attach");
        if self.0.mounted.get() {
            self.flush_replay();
        }
        let driver = driver.map(|d| spawn_local(drive(self.clone(), action.clone(), d)));
        Attached {
            engine: Rc::downgrade(&self.0),
            key,
            driver,
        }
    }

    /// Dispatches `action` with no channel.
    ///
    /// Unicast actions deliver to this engine only; broadcast actions to
    /// every mounted engine of the registry; multicast actions to the mounted
    /// engines under the named scope, resolved against this engine's scope
    /// chain. The returned future settles once all matched non-detached
    /// handlers have finished.
    pub fn dispatch<T: 'static>(&self, action: &Action<T>, payload: T) -> Dispatched {
        self.dispatch_raw(action, None, Rc::new(payload))
    }

    /// Dispatches on a channel; handlers whose filter the channel does not
    /// contain are skipped.
    pub fn dispatch_channeled<T: 'static>(&self, target: &Channeled<T>, payload: T) -> Dispatched {
        self.dispatch_raw(target.action(), Some(target.channel().clone()), Rc::new(payload))
    }

    fn dispatch_raw<T: 'static>(
        &self,
        action: &Action<T>,
        channel: Option<Channel>,
        payload: Rc<dyn Any>,
    ) -> Dispatched {
        let registry = &self.0.registry;
        tracing::debug!(action = %action.name(), channel = ?channel, "dispatch");
        let mut targets = Vec::new();
        match action.distribution() {
            Distribution::Unicast => {
                if self.0.mounted.get() {
                    targets.push(self.0.clone());
                }
            }
            Distribution::Broadcast => {
                registry.0.replay.borrow_mut().insert(
                    (action.id(), None),
                    ReplayRecord {
                        payload: payload.clone(),
                        channel: channel.clone(),
                    },
                );
                targets.extend(mounted_buses(registry));
            }
            Distribution::Multicast(scope) => match self.resolve_scope(scope) {
                Some(scope_id) => {
                    registry.0.replay.borrow_mut().insert(
                        (action.id(), Some(scope_id)),
                        ReplayRecord {
                            payload: payload.clone(),
                            channel: channel.clone(),
                        },
                    );
                    targets.extend(
                        mounted_buses(registry)
                            .filter(|bus| bus.scope.as_ref().is_some_and(|s| s.contains(scope_id))),
                    );
                }
                None => {
                    tracing::warn!(
                        action = %action.name(),
                        scope = %scope,
                        "multicast scope not found; dispatch dropped"
                    );
                }
            },
        }
        let mut awaited = Vec::new();
        for bus in &targets {
            for (&key, slot) in bus.handlers.borrow().iter() {
                if slot.action != action.id()
                    || !channel_matches(slot.filter.as_ref(), channel.as_ref())
                {
                    continue;
                }
                // A live delivery also consumes the slot's replay.
                slot.replayed.set(true);
                let run = invocation(bus, slot, payload.clone(), channel.clone(), Phase::Live);
                if slot.detached {
                    spawn_local(run);
                } else {
                    awaited.push((key, run));
                }
            }
        }
        awaited.sort_by_key(|(key, _)| *key);
        Dispatched(spawn_local(async move {
            join_all(awaited.into_iter().map(|(_, run)| run)).await;
        }))
    }

    fn resolve_scope(&self, name: &str) -> Option<u64> {
        Some(self.0.scope.as_ref()?.resolve(name)?.id())
    }

    /// Joins the registry's bus table and replays recorded dispatches to
    /// handlers that have not seen them yet.
    pub fn mount(&self) {
        if self.0.mounted.replace(true) {
            return;
        }
        let key = self.0.registry.0.buses.borrow_mut().insert(Rc::downgrade(&self.0));
        self.0.bus_key.set(Some(key));
        tracing::debug!(engine = self.0.instance, "mount");
        self.flush_replay();
        self.0.wake.notify_waiters();
    }

    /// Leaves the bus table, aborts this instance's in-flight handlers with
    /// an unmounted reason and sweeps the pending index. Attached handlers
    /// and replay records survive for a later remount.
    pub fn unmount(&self) {
        if !self.0.mounted.replace(false) {
            return;
        }
        if let Some(key) = self.0.bus_key.take() {
            self.0.registry.0.buses.borrow_mut().remove(key);
        }
        self.regulator().release_owner();
        self.0.tracker.clear_pending();
        tracing::debug!(engine = self.0.instance, "unmount");
    }

    /// Signal that externally-held inputs changed, so reactive and poll
    /// drivers re-evaluate their probes.
    pub fn props_changed(&self) {
        self.0.wake.notify_waiters();
    }

    fn flush_replay(&self) {
        let mut runs = Vec::new();
        {
            let handlers = self.0.handlers.borrow();
            let replay = self.0.registry.0.replay.borrow();
            for (&key, slot) in handlers.iter() {
                if slot.replayed.get() {
                    continue;
                }
                let record = match &slot.distribution {
                    Distribution::Unicast => None,
                    Distribution::Broadcast => replay.get(&(slot.action, None)),
                    Distribution::Multicast(_) => self.nearest_record(&replay, slot.action),
                };
                let Some(record) = record else {
                    continue;
                };
                if !channel_matches(slot.filter.as_ref(), record.channel.as_ref()) {
                    continue;
                }
                slot.replayed.set(true);
                tracing::debug!(action = %slot.name, engine = self.0.instance, "replay");
                runs.push((
                    key,
                    invocation(
                        &self.0,
                        slot,
                        record.payload.clone(),
                        record.channel.clone(),
                        Phase::Replay,
                    ),
                ));
            }
        }
        runs.sort_by_key(|(key, _)| *key);
        for (_, run) in runs {
            spawn_local(run);
        }
    }

    /// Record lookup for a multicast slot: nearest scope in this engine's
    /// chain that has one.
    fn nearest_record<'a>(
        &self,
        replay: &'a HashMap<(u64, Option<u64>), ReplayRecord>,
        action: u64,
    ) -> Option<&'a ReplayRecord> {
        let mut scope = self.0.scope.as_ref();
        while let Some(s) = scope {
            if let Some(record) = replay.get(&(action, Some(s.id()))) {
                return Some(record);
            }
            scope = s.parent();
        }
        None
    }

    pub(crate) async fn idle(&self) {
        tokio::select! {
            _ = self.0.tracker.changed() => {}
            _ = self.0.wake.notified() => {}
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.0.instance)
            .field("mounted", &self.0.mounted.get())
            .finish()
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        if let Some(key) = self.bus_key.take() {
            self.registry.0.buses.borrow_mut().remove(key);
        }
        Regulator::new(self.registry.0.regulator.clone(), self.instance).release_owner();
    }
}

fn mounted_buses(registry: &Registry) -> impl Iterator<Item = Rc<EngineShared>> {
    registry
        .0
        .buses
        .borrow()
        .values()
        .filter_map(|bus| bus.upgrade())
        .collect::<Vec<_>>()
        .into_iter()
}

fn invocation(
    bus: &Rc<EngineShared>,
    slot: &HandlerSlot,
    payload: Rc<dyn Any>,
    channel: Option<Channel>,
    phase: Phase,
) -> LocalBoxFuture<'static, ()> {
    let engine = Engine(bus.clone());
    let raw = slot.raw.clone();
    let name = slot.name.clone();
    let action = slot.action;
    async move {
        let process = Process::next(name.clone());
        let entry = engine.regulator().entry(action, name.clone());
        let controller = entry.controller().clone();
        let cx = ActionContext(Rc::new(ContextNode {
            engine: engine.clone(),
            process: process.clone(),
            controller: controller.clone(),
            name: name.clone(),
            action,
            channel,
            phase,
        }));
        let result = if controller.is_aborted() {
            // Policy-denied before the handler ever ran.
            Err(controller.fault().unwrap_or(Fault::Disallowed))
        } else {
            raw(cx, payload).await
        };
        if let Err(fault) = result {
            engine.0.registry.report(&name, fault);
        }
        engine.0.tracker.prune(&process);
        drop(entry);
    }
    .boxed_local()
}

pub struct EngineBuilder {
    registry: Registry,
    scope: Option<Scope>,
    model: Node,
}

impl EngineBuilder {
    /// Places the engine under `scope` for multicast delivery.
    pub fn scope(mut self, scope: &Scope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    pub fn model(mut self, model: impl Into<Node>) -> Self {
        self.model = model.into();
        self
    }

    pub fn build(self) -> Engine {
        Engine(Rc::new(EngineShared {
            registry: self.registry,
            instance: next_id(),
            scope: self.scope,
            tracker: Tracker::new(self.model),
            handlers: RefCell::new(BTreeMap::new()),
            wake: Notify::new(),
            mounted: Cell::new(false),
            bus_key: Cell::new(None),
        }))
    }
}

/// Everything a handler invocation can reach: the owning engine, its own
/// process identity and controller, and the dispatch metadata.
#[derive(Clone)]
pub struct ActionContext(Rc<ContextNode>);

struct ContextNode {
    engine: Engine,
    process: Process,
    controller: Controller,
    name: Rc<str>,
    action: u64,
    channel: Option<Channel>,
    phase: Phase,
}

impl ActionContext {
    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    /// Name of the dispatched action.
    pub fn action(&self) -> &Rc<str> {
        &self.0.name
    }

    /// The channel the dispatch was sent on, if any.
    pub fn channel(&self) -> Option<&Channel> {
        self.0.channel.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.0.phase
    }

    /// The process identity owning this invocation's annotations.
    pub fn process(&self) -> &Process {
        &self.0.process
    }

    /// This invocation's cancellation controller.
    pub fn controller(&self) -> &Controller {
        &self.0.controller
    }

    pub fn model(&self) -> Node {
        self.0.engine.model()
    }

    pub fn inspect(&self) -> Inspect {
        self.0.engine.inspect()
    }

    /// Wraps `value` in a pending annotation owned by this invocation.
    ///
    /// Committing the returned node through [`ActionContext::produce`] stores
    /// the plain value and indexes the path as pending until the invocation
    /// settles or the entry is superseded.
    pub fn pending(&self, value: impl Into<Node>, op: Op) -> Node {
        Node::Pending(Rc::new(Annotation::new(
            value.into(),
            op,
            self.0.process.clone(),
        )))
    }

    /// [`Engine::produce`], except that after this invocation was aborted the
    /// call is a silent no-op. Models "component tore down mid-operation".
    pub fn produce(&self, mutate: impl FnOnce(&mut Node)) -> Vec<Patch> {
        if self.0.controller.is_aborted() {
            tracing::trace!(action = %self.0.name, "produce after abort ignored");
            return Vec::new();
        }
        self.0.engine.produce(mutate)
    }

    /// Abort-aware timer: resolves after `duration`, or faults as soon as
    /// this invocation's controller aborts.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Fault> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            reason = self.0.controller.aborted() => Err(Fault::from(reason)),
        }
    }

    pub(crate) fn supplant_swap(&self, mine: Controller) -> Option<Controller> {
        self.0
            .engine
            .0
            .registry
            .0
            .supplant
            .borrow_mut()
            .insert(self.0.action, mine)
    }

    pub(crate) fn supplant_release(&self, mine: &Controller) {
        let mut table = self.0.engine.0.registry.0.supplant.borrow_mut();
        if table.get(&self.0.action).is_some_and(|c| c.same(mine)) {
            table.remove(&self.0.action);
        }
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("action", &self.0.name)
            .field("phase", &self.0.phase)
            .finish()
    }
}

/// Handler registration guard returned by [`Engine::attach`].
///
/// Dropping it detaches the handler and stops its driver, if any.
#[must_use]
pub struct Attached {
    engine: Weak<EngineShared>,
    key: u64,
    driver: Option<JoinHandle<()>>,
}

impl Drop for Attached {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.handlers.borrow_mut().remove(&self.key);
        }
    }
}

impl fmt::Debug for Attached {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Attached({})", self.key)
    }
}

/// Future returned by [`Engine::dispatch`].
///
/// Resolves once every awaited handler of the dispatch has settled; handler
/// faults do not surface here. Dropping it does not cancel the handlers.
pub struct Dispatched(JoinHandle<()>);

impl Future for Dispatched {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(e)) if e.is_panic() => resume_unwind(e.into_panic()),
            Poll::Ready(Err(_)) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}
