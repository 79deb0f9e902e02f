use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

use slabmap::SlabMap;
use tokio_util::sync::CancellationToken;

use crate::{
    action::Action,
    fault::{Fault, Reason},
};

#[cfg(test)]
mod tests;

/// Cancellation handle for one invocation.
///
/// Aborting records a [`Reason`] exactly once; later aborts keep the first
/// reason. Everything abort-aware inside the engine (context sleeps, pending
/// middleware waits, drivers) watches the underlying token.
#[derive(Clone)]
pub struct Controller(Rc<ControllerNode>);

struct ControllerNode {
    token: CancellationToken,
    reason: Cell<Option<Reason>>,
}

impl Controller {
    pub(crate) fn new() -> Self {
        Self(Rc::new(ControllerNode {
            token: CancellationToken::new(),
            reason: Cell::new(None),
        }))
    }

    /// A controller born aborted, handed out when policy blocks an action.
    pub(crate) fn denied() -> Self {
        let controller = Self::new();
        controller.abort(Reason::Disallowed);
        controller
    }

    pub fn abort(&self, reason: Reason) {
        if self.is_aborted() {
            return;
        }
        tracing::debug!(reason = %reason, "abort");
        self.0.reason.set(Some(reason));
        self.0.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.token.is_cancelled()
    }

    /// The recorded abort reason, `None` while live.
    pub fn reason(&self) -> Option<Reason> {
        self.0.reason.get()
    }

    /// The abort mapped to a fault, `None` while live.
    pub fn fault(&self) -> Option<Fault> {
        if self.is_aborted() {
            Some(self.reason().unwrap_or(Reason::Superseded).into())
        } else {
            None
        }
    }

    /// Waits for the abort and returns its reason.
    pub async fn aborted(&self) -> Reason {
        self.0.token.cancelled().await;
        self.reason().unwrap_or(Reason::Superseded)
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "Controller(aborted: {reason})"),
            None => f.write_str("Controller(live)"),
        }
    }
}

struct RegEntry {
    action: u64,
    name: Rc<str>,
    owner: u64,
    controller: Controller,
}

/// Registry-wide regulator state: the live-entry table and policy sets.
pub(crate) struct RegulatorShared {
    entries: RefCell<SlabMap<RegEntry>>,
    disallowed: RefCell<HashSet<u64>>,
    own_disallowed: RefCell<HashMap<u64, HashSet<u64>>>,
}

impl RegulatorShared {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(SlabMap::new()),
            disallowed: RefCell::new(HashSet::new()),
            own_disallowed: RefCell::new(HashMap::new()),
        })
    }
}

/// One engine's view of the shared regulator.
///
/// Plain methods act registry-wide; the `_own` variants touch only tokens
/// and policies belonging to this engine instance.
#[derive(Clone)]
pub struct Regulator {
    shared: Rc<RegulatorShared>,
    owner: u64,
}

impl Regulator {
    pub(crate) fn new(shared: Rc<RegulatorShared>, owner: u64) -> Self {
        Self { shared, owner }
    }

    /// Mints a policy-checked controller for `action`.
    ///
    /// If the action is disallowed (registry-wide or for this instance) the
    /// controller comes back pre-aborted with [`Reason::Disallowed`].
    pub fn controller<T: 'static>(&self, action: &Action<T>) -> Controller {
        self.controller_for(action.id())
    }

    pub(crate) fn controller_for(&self, action: u64) -> Controller {
        if self.allows(action) {
            Controller::new()
        } else {
            Controller::denied()
        }
    }

    /// Mints a controller and tracks it in the live-entry table until the
    /// returned guard drops.
    pub(crate) fn entry(&self, action: u64, name: Rc<str>) -> RegulatorEntry {
        let controller = self.controller_for(action);
        let key = self.shared.entries.borrow_mut().insert(RegEntry {
            action,
            name,
            owner: self.owner,
            controller: controller.clone(),
        });
        RegulatorEntry {
            shared: self.shared.clone(),
            key,
            controller,
        }
    }

    pub fn is_allowed<T: 'static>(&self, action: &Action<T>) -> bool {
        self.allows(action.id())
    }

    fn allows(&self, action: u64) -> bool {
        if self.shared.disallowed.borrow().contains(&action) {
            return false;
        }
        !self
            .shared
            .own_disallowed
            .borrow()
            .get(&self.owner)
            .is_some_and(|set| set.contains(&action))
    }

    /// Blocks future dispatches of `action` everywhere in the registry.
    pub fn disallow<T: 'static>(&self, action: &Action<T>) {
        self.shared.disallowed.borrow_mut().insert(action.id());
    }

    /// Reverses a registry-wide [`Regulator::disallow`].
    pub fn allow<T: 'static>(&self, action: &Action<T>) {
        self.shared.disallowed.borrow_mut().remove(&action.id());
    }

    /// Blocks future dispatches of `action` handled by this instance only.
    pub fn disallow_own<T: 'static>(&self, action: &Action<T>) {
        self.shared
            .own_disallowed
            .borrow_mut()
            .entry(self.owner)
            .or_default()
            .insert(action.id());
    }

    /// Reverses a [`Regulator::disallow_own`].
    pub fn allow_own<T: 'static>(&self, action: &Action<T>) {
        let mut own = self.shared.own_disallowed.borrow_mut();
        if let Some(set) = own.get_mut(&self.owner) {
            set.remove(&action.id());
            if set.is_empty() {
                own.remove(&self.owner);
            }
        }
    }

    /// Aborts every live token in the registry.
    pub fn abort_all(&self, reason: Reason) {
        self.abort_where(reason, |_| true);
    }

    /// Aborts every live token for `action` across all instances.
    pub fn abort_matching<T: 'static>(&self, action: &Action<T>, reason: Reason) {
        let id = action.id();
        self.abort_where(reason, |e| e.action == id);
    }

    /// Aborts this instance's live tokens.
    pub fn abort_own(&self, reason: Reason) {
        let owner = self.owner;
        self.abort_where(reason, |e| e.owner == owner);
    }

    /// Aborts this instance's live tokens for `action`.
    pub fn abort_own_matching<T: 'static>(&self, action: &Action<T>, reason: Reason) {
        let id = action.id();
        let owner = self.owner;
        self.abort_where(reason, |e| e.owner == owner && e.action == id);
    }

    fn abort_where(&self, reason: Reason, filter: impl Fn(&RegEntry) -> bool) {
        // Collect first: aborting can re-enter through synchronous waiters.
        let controllers: Vec<Controller> = self
            .shared
            .entries
            .borrow()
            .values()
            .filter(|e| filter(e))
            .map(|e| e.controller.clone())
            .collect();
        for controller in controllers {
            controller.abort(reason);
        }
    }

    /// Live `(action name, controller)` pairs owned by this instance.
    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.shared
            .entries
            .borrow()
            .values()
            .filter(|e| e.owner == self.owner)
            .map(|e| TaskEntry {
                action: e.name.clone(),
                controller: e.controller.clone(),
            })
            .collect()
    }

    /// Tears down this instance's share of the tables on unmount.
    pub(crate) fn release_owner(&self) {
        self.abort_own(Reason::Unmounted);
        self.shared.own_disallowed.borrow_mut().remove(&self.owner);
    }
}

/// A live slot in the regulator table, released on drop.
pub(crate) struct RegulatorEntry {
    shared: Rc<RegulatorShared>,
    key: usize,
    controller: Controller,
}

impl RegulatorEntry {
    pub fn controller(&self) -> &Controller {
        &self.controller
    }
}

impl Drop for RegulatorEntry {
    fn drop(&mut self) {
        self.shared.entries.borrow_mut().remove(self.key);
    }
}

/// One row of [`Regulator::tasks`]: an in-flight piece of work and its
/// cancellation handle.
#[derive(Clone, Debug)]
pub struct TaskEntry {
    pub action: Rc<str>,
    pub controller: Controller,
}
