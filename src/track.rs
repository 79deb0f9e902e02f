use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::{BitOr, BitOrAssign},
    rc::Rc,
};

use tokio::sync::Notify;

use crate::{
    model::{diff, Node, Patch, PatchOp, Path, Step},
    utils::next_id,
};

#[cfg(test)]
mod tests;

/// Bit set naming the kinds of change a pending operation predicts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Op(u8);

impl Op {
    pub const ADD: Op = Op(1);
    pub const REMOVE: Op = Op(1 << 1);
    pub const UPDATE: Op = Op(1 << 2);
    pub const MOVE: Op = Op(1 << 3);
    pub const REPLACE: Op = Op(1 << 4);
    pub const SORT: Op = Op(1 << 5);

    const NAMES: [(Op, &'static str); 6] = [
        (Op::ADD, "add"),
        (Op::REMOVE, "remove"),
        (Op::UPDATE, "update"),
        (Op::MOVE, "move"),
        (Op::REPLACE, "replace"),
        (Op::SORT, "sort"),
    ];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` if every flag of `other` is set in `self`.
    pub fn contains(self, other: Op) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if `self` and `other` share any flag.
    pub fn intersects(self, other: Op) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Op {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
impl BitOrAssign for Op {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of one handler invocation.
///
/// Pending entries are owned by the process that produced them, so pruning a
/// settled invocation removes exactly its own predictions.
#[derive(Clone)]
pub struct Process(Rc<ProcessNode>);

struct ProcessNode {
    id: u64,
    action: Rc<str>,
}

impl Process {
    pub(crate) fn next(action: Rc<str>) -> Self {
        Self(Rc::new(ProcessNode {
            id: next_id(),
            action,
        }))
    }

    /// The synthetic process owning annotations baked into an initial model.
    ///
    /// All hydration processes compare equal and are never pruned by a
    /// settling invocation; their entries clear when a real produce commits
    /// the same path or through [`crate::Engine::prune_hydration`].
    pub fn hydration() -> Self {
        Self(Rc::new(ProcessNode {
            id: 0,
            action: "hydrate".into(),
        }))
    }

    /// Diagnostic name of the action this process belongs to.
    pub fn action(&self) -> &Rc<str> {
        &self.0.action
    }

    pub fn is_hydration(&self) -> bool {
        self.0.id == 0
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Process {}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Process({}#{})", self.0.action, self.0.id)
    }
}

/// A value wrapped with the pending operation that predicted it.
#[derive(Debug)]
pub struct Annotation {
    value: Node,
    op: Op,
    process: Process,
}

impl Annotation {
    pub(crate) fn new(value: Node, op: Op, process: Process) -> Self {
        Self { value, op, process }
    }

    pub fn value(&self) -> &Node {
        &self.value
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn process(&self) -> &Process {
        &self.process
    }
}

impl Node {
    /// Wraps `value` as pending under the synthetic hydration process.
    ///
    /// Meant for initial models built from server snapshots, where some data
    /// is known to still be in flight even though no live invocation owns it.
    pub fn hydrating(value: impl Into<Node>, op: Op) -> Node {
        Node::Pending(Rc::new(Annotation::new(
            value.into(),
            op,
            Process::hydration(),
        )))
    }
}

struct PendingEntry {
    process: Process,
    op: Op,
    draft: Node,
}

/// Committed model plus the per-path index of in-flight predictions.
#[derive(Clone)]
pub(crate) struct Tracker(Rc<TrackShared>);

struct TrackShared {
    model: RefCell<Node>,
    pending: RefCell<BTreeMap<Path, Vec<PendingEntry>>>,
    changed: Notify,
    version: Cell<u64>,
}

impl Tracker {
    pub fn new(initial: Node) -> Self {
        let tracker = Self(Rc::new(TrackShared {
            model: RefCell::new(Node::Null),
            pending: RefCell::new(BTreeMap::new()),
            changed: Notify::new(),
            version: Cell::new(0),
        }));
        // Initial commit strips hydration annotations into the pending index.
        tracker.produce(|model| *model = initial);
        tracker
    }

    /// Cheap snapshot of the committed model.
    pub fn model(&self) -> Node {
        self.0.model.borrow().clone()
    }

    /// Bumped on every commit that changed the model or the pending index.
    pub fn version(&self) -> u64 {
        self.0.version.get()
    }

    /// Resolved once per change; used by settled-waiters and drivers.
    pub async fn changed(&self) {
        self.0.changed.notified().await;
    }

    /// Runs `mutate` on a draft of the model and commits the result.
    ///
    /// Every committed patch whose value carries [`Node::Pending`] wrappers
    /// has them recorded in the pending index and unwrapped to their plain
    /// values first. A commit at a path supersedes any hydration entries
    /// left there.
    pub fn produce(&self, mutate: impl FnOnce(&mut Node)) -> Vec<Patch> {
        let old = self.0.model.borrow().clone();
        let mut draft = old.clone();
        mutate(&mut draft);

        let raw = diff(&old, &draft);
        if raw.is_empty() {
            return raw;
        }

        let mut committed = draft;
        let mut annotations = Vec::new();
        let mut patches = Vec::with_capacity(raw.len());
        for patch in raw {
            match patch.op {
                PatchOp::Set(value) => {
                    let before = annotations.len();
                    let mut steps = patch.path.steps().to_vec();
                    let plain = strip_pending(value, &mut steps, &mut annotations);
                    if annotations.len() > before {
                        committed.set_at(&patch.path, plain.clone());
                    }
                    patches.push(Patch::set(patch.path, plain));
                }
                PatchOp::Remove => patches.push(patch),
            }
        }

        {
            let mut pending = self.0.pending.borrow_mut();
            // A real commit at a path supersedes hydration left there. Do
            // this before registering so fresh annotations survive.
            for patch in &patches {
                let now_empty = match pending.get_mut(&patch.path) {
                    Some(entries) => {
                        entries.retain(|e| !e.process.is_hydration());
                        entries.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    pending.remove(&patch.path);
                }
            }
            for (path, annotation) in annotations {
                pending.entry(path).or_default().push(PendingEntry {
                    process: annotation.process().clone(),
                    op: annotation.op(),
                    draft: annotation.value().clone(),
                });
            }
        }

        *self.0.model.borrow_mut() = committed;
        self.0.version.set(self.0.version.get() + 1);
        tracing::trace!(patches = patches.len(), "produce committed");
        self.0.changed.notify_waiters();
        patches
    }

    /// Removes every pending entry owned by `process`. Idempotent.
    pub fn prune(&self, process: &Process) {
        let mut removed = 0usize;
        self.0.pending.borrow_mut().retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.process != *process);
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            self.0.version.set(self.0.version.get() + 1);
            tracing::trace!(removed, process = ?process, "pruned pending entries");
            self.0.changed.notify_waiters();
        }
    }

    /// Drops the whole pending index, waking all settled-waiters.
    pub fn clear_pending(&self) {
        let had = !self.0.pending.borrow().is_empty();
        self.0.pending.borrow_mut().clear();
        if had {
            self.0.version.set(self.0.version.get() + 1);
            self.0.changed.notify_waiters();
        }
    }

    pub fn inspect(&self) -> Inspect {
        Inspect(self.clone())
    }
}

/// Unwraps pending wrappers in `node`, recording each annotation and the
/// absolute path it sat at.
///
/// Subtrees without any wrapper are returned as-is so their `Rc` identity is
/// preserved.
fn strip_pending(
    node: Node,
    steps: &mut Vec<Step>,
    out: &mut Vec<(Path, Rc<Annotation>)>,
) -> Node {
    match node {
        Node::Pending(annotation) => {
            out.push((Path::from_steps(steps.clone()), annotation.clone()));
            strip_pending(annotation.value().clone(), steps, out)
        }
        Node::Map(m) if m.values().any(has_pending) => {
            let mut stripped = BTreeMap::new();
            for (key, value) in m.iter() {
                steps.push(Step::Key(key.as_str().into()));
                stripped.insert(key.clone(), strip_pending(value.clone(), steps, out));
                steps.pop();
            }
            Node::Map(Rc::new(stripped))
        }
        Node::Seq(items) if items.iter().any(has_pending) => {
            let mut stripped = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                steps.push(Step::Index(i));
                stripped.push(strip_pending(item.clone(), steps, out));
                steps.pop();
            }
            Node::Seq(Rc::new(stripped))
        }
        other => other,
    }
}

fn has_pending(node: &Node) -> bool {
    match node {
        Node::Pending(_) => true,
        Node::Map(m) => m.values().any(has_pending),
        Node::Seq(items) => items.iter().any(has_pending),
        _ => false,
    }
}

/// Read-only queries over a tracker's model and pending index.
#[derive(Clone)]
pub struct Inspect(pub(crate) Tracker);

impl Inspect {
    pub fn model(&self) -> Node {
        self.0.model()
    }

    /// Queries scoped to one path.
    pub fn at(&self, path: impl Into<Path>) -> InspectPath {
        InspectPath {
            track: self.0.clone(),
            path: path.into(),
        }
    }

    /// Paths that currently have pending entries, in path order.
    pub fn pending_paths(&self) -> Vec<Path> {
        self.0 .0.pending.borrow().keys().cloned().collect()
    }
}

/// Pending-state queries for a single path.
#[derive(Clone)]
pub struct InspectPath {
    track: Tracker,
    path: Path,
}

impl InspectPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` while any pending entry exists at this path.
    pub fn pending(&self) -> bool {
        self.remaining() > 0
    }

    /// Number of distinct processes still pending at this path.
    pub fn remaining(&self) -> usize {
        self.track
            .0
            .pending
            .borrow()
            .get(&self.path)
            .map_or(0, |entries| {
                entries
                    .iter()
                    .map(|e| e.process.0.id)
                    .collect::<BTreeSet<_>>()
                    .len()
            })
    }

    /// OR-combination of all pending op flags at this path.
    pub fn ops(&self) -> Op {
        self.track
            .0
            .pending
            .borrow()
            .get(&self.path)
            .map_or(Op::default(), |entries| {
                entries.iter().fold(Op::default(), |acc, e| acc | e.op)
            })
    }

    /// `true` if every flag in `op` is pending at this path.
    pub fn is(&self, op: Op) -> bool {
        self.ops().contains(op)
    }

    /// Committed value at this path, `Null` if absent.
    pub fn value(&self) -> Node {
        self.track
            .0
            .model
            .borrow()
            .at(&self.path)
            .cloned()
            .unwrap_or_default()
    }

    /// Most recently annotated value at this path, falling back to the
    /// committed value when nothing is pending.
    pub fn draft(&self) -> Node {
        self.track
            .0
            .pending
            .borrow()
            .get(&self.path)
            .and_then(|entries| entries.last())
            .map(|e| e.draft.clone())
            .unwrap_or_else(|| self.value())
    }

    /// Resolves with the committed value once nothing is pending here.
    ///
    /// Checks and waits alternate on one thread, so a change can never slip
    /// between the test and the wait registration.
    pub async fn settled(&self) -> Node {
        loop {
            if !self.pending() {
                return self.value();
            }
            self.track.changed().await;
        }
    }
}
