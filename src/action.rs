use std::{collections::BTreeMap, fmt, marker::PhantomData, rc::Rc};

use derive_ex::derive_ex;
use parse_display::Display;
use serde::{Deserialize, Serialize};

use crate::utils::next_id;


/// Typed identity of a dispatchable action.
///
/// Two actions are the same only if they were created by the same constructor
/// call; the name is diagnostic and never used for routing. The payload type
/// `T` ties [`dispatch`](crate::Engine::dispatch) and
/// [`attach`](crate::Engine::attach) together at compile time.
#[derive_ex(Clone, bound())]
pub struct Action<T: 'static>(Rc<ActionNode>, PhantomData<fn(T)>);

struct ActionNode {
    id: u64,
    name: Rc<str>,
    distribution: Distribution,
}

impl<T: 'static> Action<T> {
    fn with(name: impl Into<Rc<str>>, distribution: Distribution) -> Self {
        Self(
            Rc::new(ActionNode {
                id: next_id(),
                name: name.into(),
                distribution,
            }),
            PhantomData,
        )
    }

    /// Creates an action delivered only to handlers on the dispatching engine.
    pub fn unicast(name: impl Into<Rc<str>>) -> Self {
        Self::with(name, Distribution::Unicast)
    }

    /// Creates an action delivered to every mounted engine in the registry.
    pub fn broadcast(name: impl Into<Rc<str>>) -> Self {
        Self::with(name, Distribution::Broadcast)
    }

    /// Creates an action delivered to engines sharing the named scope.
    ///
    /// The scope is resolved against the dispatching engine's chain using
    /// nearest-ancestor-or-self search, so sibling subtrees with the same
    /// scope name stay isolated from each other.
    pub fn multicast(name: impl Into<Rc<str>>, scope: impl Into<Rc<str>>) -> Self {
        Self::with(name, Distribution::Multicast(scope.into()))
    }

    pub fn name(&self) -> &Rc<str> {
        &self.0.name
    }

    pub fn distribution(&self) -> &Distribution {
        &self.0.distribution
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    /// Pairs this action with a channel for filtered dispatch or attachment.
    pub fn channeled(&self, channel: Channel) -> Channeled<T> {
        Channeled {
            action: self.clone(),
            channel,
        }
    }
}

impl<T> PartialEq for Action<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl<T> Eq for Action<T> {}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("distribution", &self.0.distribution)
            .finish()
    }
}

/// An [`Action`] narrowed to a channel.
///
/// Used on the dispatch side to tag a call and on the attach side to filter
/// deliveries. See [`channel_matches`] for the pairing rules.
#[derive_ex(Clone, bound())]
pub struct Channeled<T: 'static> {
    action: Action<T>,
    channel: Channel,
}

impl<T: 'static> Channeled<T> {
    pub fn action(&self) -> &Action<T> {
        &self.action
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl<T> PartialEq for Channeled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action && self.channel == other.channel
    }
}

impl<T> fmt::Debug for Channeled<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channeled")
            .field("action", &self.action)
            .field("channel", &self.channel)
            .finish()
    }
}

/// How dispatches of an action find their target engines.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Distribution {
    #[display("unicast")]
    Unicast,
    #[display("broadcast")]
    Broadcast,
    #[display("multicast({0})")]
    Multicast(Rc<str>),
}

/// Scalar value usable in channel filters.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}
impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}
impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}
impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}
impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}
impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Ordered key/value filter carried by dispatches and attachments.
#[derive(Clone, PartialEq, Default, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(BTreeMap<String, Scalar>);

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Scalar>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `true` if every entry of `self` appears in `other` with an equal value.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }

    /// Deterministic text form used as a cache key component: the JSON
    /// encoding, with keys in `BTreeMap` order and values escaped so
    /// unequal channels never share a form.
    pub(crate) fn canonical(&self) -> String {
        serde_json::to_string(self).expect("string-keyed scalar maps always serialize")
    }
}

impl FromIterator<(String, Scalar)> for Channel {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

/// Builds a [`Channel`] from `key => value` pairs.
///
/// ```
/// use impel::channel;
///
/// let c = channel! { "Role" => "admin", "UserId" => 5 };
/// assert_eq!(c.len(), 2);
/// ```
#[macro_export]
macro_rules! channel {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut c = $crate::Channel::new();
        $(c.insert($key, $value);)*
        c
    }};
}

/// Decides whether a dispatch reaches a handler.
///
/// Publications broaden and subscriptions narrow: an unchanneled dispatch and
/// an empty dispatch channel both reach every handler of the action, an
/// unchanneled (or empty-channel) attachment accepts every dispatch, and a
/// non-empty pair matches when the handler's filter is a subset of the
/// dispatch channel.
pub fn channel_matches(filter: Option<&Channel>, dispatch: Option<&Channel>) -> bool {
    match (filter, dispatch) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(f), Some(c)) => c.is_empty() || f.is_subset_of(c),
    }
}

/// Named position in an engine hierarchy, used to confine multicast actions.
#[derive(Clone)]
pub struct Scope(Rc<ScopeNode>);

struct ScopeNode {
    id: u64,
    name: Rc<str>,
    parent: Option<Scope>,
}

impl Scope {
    /// Creates a root scope.
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self(Rc::new(ScopeNode {
            id: next_id(),
            name: name.into(),
            parent: None,
        }))
    }

    /// Creates a scope nested under `self`.
    pub fn child(&self, name: impl Into<Rc<str>>) -> Self {
        Self(Rc::new(ScopeNode {
            id: next_id(),
            name: name.into(),
            parent: Some(self.clone()),
        }))
    }

    pub fn name(&self) -> &Rc<str> {
        &self.0.name
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    /// Nearest scope named `name`, starting from `self` and walking up.
    pub(crate) fn resolve(&self, name: &str) -> Option<&Scope> {
        let mut scope = self;
        loop {
            if &*scope.0.name == name {
                return Some(scope);
            }
            scope = scope.0.parent.as_ref()?;
        }
    }

    /// `true` if this chain passes through the scope instance with `id`.
    pub(crate) fn contains(&self, id: u64) -> bool {
        let mut scope = Some(self);
        while let Some(s) = scope {
            if s.0.id == id {
                return true;
            }
            scope = s.0.parent.as_ref();
        }
        false
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Scope({}#{})", self.0.name, self.0.id)
    }
}
