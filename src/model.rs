use std::{
    collections::BTreeMap,
    fmt::{self, Write as _},
    rc::Rc,
};

use serde::{
    ser::{SerializeMap, SerializeSeq},
    Deserialize, Serialize,
};

use crate::track::Annotation;

mod diff;

pub use diff::diff;
pub(crate) use diff::same_rep;

#[cfg(test)]
mod tests;

/// JSON-like structural value with copy-on-write sharing.
///
/// Containers hold their contents behind [`Rc`], so cloning a tree is cheap
/// and mutating a clone only copies the spine from the root down to the
/// changed node. Untouched branches keep their `Rc` identity, which is what
/// [`diff`] uses to skip them.
///
/// [`Node::Pending`] wraps a value with in-flight metadata; every read
/// accessor sees through the wrapper, so annotated values behave like plain
/// ones everywhere except [`Node::annotation`] and the pending index.
#[derive(Clone, Debug, Default)]
pub enum Node {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Seq(Rc<Vec<Node>>),
    Map(Rc<BTreeMap<String, Node>>),
    Pending(Rc<Annotation>),
}

impl Node {
    /// Creates an empty map node.
    pub fn map() -> Self {
        Self::Map(Rc::new(BTreeMap::new()))
    }

    /// Creates an empty sequence node.
    pub fn seq() -> Self {
        Self::Seq(Rc::new(Vec::new()))
    }

    /// The wrapped value if this node is pending, otherwise the node itself.
    pub fn plain(&self) -> &Node {
        let mut node = self;
        while let Self::Pending(a) = node {
            node = a.value();
        }
        node
    }

    /// In-flight metadata attached to this node, if any.
    pub fn annotation(&self) -> Option<&Rc<Annotation>> {
        match self {
            Self::Pending(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.plain(), Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.plain() {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.plain() {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.plain() {
            Self::Float(x) => Some(*x),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.plain() {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Node]> {
        match self.plain() {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Node>> {
        match self.plain() {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Child value under a map key.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_map()?.get(key)
    }

    /// Node reached by walking `path` from this node.
    ///
    /// Intermediate pending wrappers are seen through; the returned leaf keeps
    /// its wrapper so callers can observe its annotation.
    pub fn at(&self, path: &Path) -> Option<&Node> {
        let mut node = self;
        for step in path.steps() {
            node = match (node.plain(), step) {
                (Self::Map(m), Step::Key(k)) => m.get(&**k)?,
                (Self::Seq(items), Step::Index(i)) => items.get(*i)?,
                _ => return None,
            };
        }
        Some(node)
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Seq(_) => "seq",
            Self::Map(_) => "map",
            Self::Pending(_) => "pending",
        }
    }

    /// Mutable access to this node as a map, replacing `Null` with an empty
    /// map first.
    ///
    /// # Panics
    ///
    /// Panics if the node is neither a map nor `Null`.
    pub fn map_mut(&mut self) -> &mut BTreeMap<String, Node> {
        if matches!(self, Self::Null) {
            *self = Self::map();
        }
        match self {
            Self::Map(m) => Rc::make_mut(m),
            _ => panic!("cannot use {} node as a map", self.kind()),
        }
    }

    /// Mutable access to this node as a sequence, replacing `Null` with an
    /// empty sequence first.
    ///
    /// # Panics
    ///
    /// Panics if the node is neither a sequence nor `Null`.
    pub fn seq_mut(&mut self) -> &mut Vec<Node> {
        if matches!(self, Self::Null) {
            *self = Self::seq();
        }
        match self {
            Self::Seq(items) => Rc::make_mut(items),
            _ => panic!("cannot use {} node as a seq", self.kind()),
        }
    }

    /// Sets a map entry, copying the map spine if it is shared.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Node>) {
        self.map_mut().insert(key.into(), value.into());
    }

    /// Removes a map entry.
    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.map_mut().remove(key)
    }

    /// Appends to a sequence.
    pub fn push(&mut self, value: impl Into<Node>) {
        self.seq_mut().push(value.into());
    }

    /// Mutable node at `path`, creating intermediate maps as needed.
    ///
    /// A key step vivifies `Null` into a map; an index step may extend a
    /// sequence by exactly one slot (`index == len`).
    ///
    /// # Panics
    ///
    /// Panics when a step does not fit the node it lands on, or an index is
    /// past the extend-by-one position.
    pub fn at_mut(&mut self, path: &Path) -> &mut Node {
        let mut node = self;
        for step in path.steps() {
            node = match step {
                Step::Key(k) => node.map_mut().entry(k.to_string()).or_default(),
                Step::Index(i) => {
                    let items = node.seq_mut();
                    if *i == items.len() {
                        items.push(Node::Null);
                    }
                    match items.get_mut(*i) {
                        Some(item) => item,
                        None => panic!("index {i} out of bounds in path {path}"),
                    }
                }
            };
        }
        node
    }

    /// Sets the node at `path`, vivifying intermediate maps.
    pub fn set_at(&mut self, path: &Path, value: impl Into<Node>) {
        *self.at_mut(path) = value.into();
    }

    /// Removes the node at `path`. Returns `None` if the path does not exist.
    ///
    /// Unlike [`Node::at_mut`], removal never vivifies missing parents.
    pub fn remove_at(&mut self, path: &Path) -> Option<Node> {
        let (last, parent_steps) = path.steps().split_last()?;
        let mut node = self;
        for step in parent_steps {
            node = match step {
                Step::Key(k) => match node {
                    Self::Map(m) => Rc::make_mut(m).get_mut(&**k)?,
                    _ => return None,
                },
                Step::Index(i) => match node {
                    Self::Seq(items) => Rc::make_mut(items).get_mut(*i)?,
                    _ => return None,
                },
            };
        }
        match last {
            Step::Key(k) => match node {
                Self::Map(m) => Rc::make_mut(m).remove(&**k),
                _ => None,
            },
            Step::Index(i) => match node {
                Self::Seq(items) if *i < items.len() => Some(Rc::make_mut(items).remove(*i)),
                _ => None,
            },
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        match (self.plain(), other.plain()) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl Serialize for Node {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(x) => serializer.serialize_f64(*x),
            Self::Str(s) => serializer.serialize_str(s),
            Self::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(m) => {
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Self::Pending(a) => a.value().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(serde_json::Value::deserialize(deserializer)?.into())
    }
}

impl From<()> for Node {
    fn from(_: ()) -> Self {
        Self::Null
    }
}
impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}
impl From<i32> for Node {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}
impl From<u32> for Node {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}
impl From<f64> for Node {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}
impl From<String> for Node {
    fn from(value: String) -> Self {
        Self::Str(value.into())
    }
}
impl From<Rc<str>> for Node {
    fn from(value: Rc<str>) -> Self {
        Self::Str(value)
    }
}
impl<T: Into<Node>> From<Vec<T>> for Node {
    fn from(value: Vec<T>) -> Self {
        Self::Seq(Rc::new(value.into_iter().map(Into::into).collect()))
    }
}
impl<T: Into<Node>> From<BTreeMap<String, T>> for Node {
    fn from(value: BTreeMap<String, T>) -> Self {
        Self::Map(Rc::new(
            value.into_iter().map(|(k, v)| (k, v.into())).collect(),
        ))
    }
}
impl<T: Into<Node>> From<Option<T>> for Node {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Self::Null,
        }
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Self::Str(s.into()),
            Value::Array(items) => Self::Seq(Rc::new(items.into_iter().map(Into::into).collect())),
            Value::Object(m) => Self::Map(Rc::new(
                m.into_iter().map(|(k, v)| (k, v.into())).collect(),
            )),
        }
    }
}

/// One step of a [`Path`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Step {
    Key(Rc<str>),
    Index(usize),
}

impl From<&str> for Step {
    fn from(value: &str) -> Self {
        Self::Key(value.into())
    }
}
impl From<String> for Step {
    fn from(value: String) -> Self {
        Self::Key(value.into())
    }
}
impl From<Rc<str>> for Step {
    fn from(value: Rc<str>) -> Self {
        Self::Key(value)
    }
}
impl From<usize> for Step {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// Location of a node in a model tree.
///
/// Paths order lexicographically by their steps, so a parent always sorts
/// before its descendants.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path(Vec<Step>);

impl Path {
    /// The empty path addressing the model root.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self(steps)
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, step: impl Into<Step>) {
        self.0.push(step.into());
    }

    /// This path extended by one step.
    pub fn join(&self, step: impl Into<Step>) -> Self {
        let mut steps = self.0.clone();
        steps.push(step.into());
        Self(steps)
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Self(vec![value.into()])
    }
}
impl From<usize> for Path {
    fn from(value: usize) -> Self {
        Self(vec![value.into()])
    }
}
impl FromIterator<Step> for Path {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            match step {
                Step::Key(k) => {
                    if i > 0 {
                        f.write_char('.')?;
                    }
                    f.write_str(k)?;
                }
                Step::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

/// Builds a [`Path`] from key and index segments.
///
/// ```
/// use impel::path;
///
/// let p = path!("todos", 0, "title");
/// assert_eq!(p.to_string(), "todos[0].title");
/// ```
#[macro_export]
macro_rules! path {
    ($($step:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut p = $crate::Path::root();
        $(p.push($step);)*
        p
    }};
}

/// One structural edit produced by [`diff`].
#[derive(Clone, PartialEq, Debug)]
pub struct Patch {
    pub path: Path,
    pub op: PatchOp,
}

#[derive(Clone, PartialEq, Debug)]
pub enum PatchOp {
    Set(Node),
    Remove,
}

impl Patch {
    pub(crate) fn set(path: Path, value: Node) -> Self {
        Self {
            path,
            op: PatchOp::Set(value),
        }
    }

    pub(crate) fn remove(path: Path) -> Self {
        Self {
            path,
            op: PatchOp::Remove,
        }
    }

    /// Applies this patch to a tree.
    pub fn apply_to(&self, root: &mut Node) {
        match &self.op {
            PatchOp::Set(value) => root.set_at(&self.path, value.clone()),
            PatchOp::Remove => {
                root.remove_at(&self.path);
            }
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.op {
            PatchOp::Set(value) => write!(f, "set {} = {}", self.path, value),
            PatchOp::Remove => write!(f, "remove {}", self.path),
        }
    }
}
