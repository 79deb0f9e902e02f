use std::{
    any::Any, cell::RefCell, collections::HashMap, fmt, future::Future, rc::Rc, time::Duration,
};

use futures::{
    future::{LocalBoxFuture, Shared},
    FutureExt,
};
use tokio::time::Instant;

use crate::{action::Channel, fault::Fault, utils::next_id};


/// Identity of a cacheable resource family.
///
/// Like actions, cache keys compare by construction identity; the name is
/// diagnostic only.
#[derive(Clone)]
pub struct CacheKey(Rc<CacheKeyNode>);

struct CacheKeyNode {
    id: u64,
    name: Rc<str>,
}

impl CacheKey {
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self(Rc::new(CacheKeyNode {
            id: next_id(),
            name: name.into(),
        }))
    }

    pub fn name(&self) -> &Rc<str> {
        &self.0.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    /// Narrows this key to one channel, addressing a single cache slot.
    pub fn channeled(&self, channel: Channel) -> ChanneledKey {
        ChanneledKey {
            key: self.clone(),
            channel,
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for CacheKey {}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CacheKey({}#{})", self.0.name, self.0.id)
    }
}

/// A [`CacheKey`] narrowed to a channel.
#[derive(Clone, Debug)]
pub struct ChanneledKey {
    key: CacheKey,
    channel: Channel,
}

impl ChanneledKey {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

type SharedResolve = Shared<LocalBoxFuture<'static, Result<Rc<dyn Any>, Fault>>>;

enum Slot {
    Ready {
        value: Rc<dyn Any>,
        expires: Instant,
        channel: Channel,
    },
    Flight {
        shared: SharedResolve,
        generation: u64,
        channel: Channel,
    },
}

impl Slot {
    fn channel(&self) -> &Channel {
        match self {
            Self::Ready { channel, .. } => channel,
            Self::Flight { channel, .. } => channel,
        }
    }
}

enum Plan {
    Hit(Rc<dyn Any>),
    Join(SharedResolve),
    Lead,
}

/// TTL cache with single-flight de-duplication.
///
/// Slots are keyed by `(key identity, canonical channel)`. While a value is
/// being resolved, concurrent fetches of the same slot join the in-flight
/// future instead of resolving again. Failed resolutions are never stored.
pub(crate) struct CacheStore(RefCell<HashMap<(u64, String), Slot>>);

impl CacheStore {
    pub fn new() -> Self {
        Self(RefCell::new(HashMap::new()))
    }

    pub async fn fetch<T, Fut>(
        &self,
        key: &CacheKey,
        channel: &Channel,
        ttl: Duration,
        resolve: impl FnOnce() -> Fut,
    ) -> Result<Rc<T>, Fault>
    where
        T: 'static,
        Fut: Future<Output = Result<T, Fault>> + 'static,
    {
        let slot_key = (key.id(), channel.canonical());
        let plan = match self.0.borrow().get(&slot_key) {
            Some(Slot::Ready { value, expires, .. }) if Instant::now() < *expires => {
                Plan::Hit(value.clone())
            }
            Some(Slot::Flight { shared, .. }) => Plan::Join(shared.clone()),
            _ => Plan::Lead,
        };

        match plan {
            Plan::Hit(value) => {
                tracing::trace!(key = %key.0.name, "cache hit");
                downcast(value)
            }
            Plan::Join(shared) => downcast(shared.await?),
            Plan::Lead => {
                // Create the future outside the borrow; the resolver body may
                // touch the cache synchronously.
                let fut = resolve();
                let shared = async move { fut.await.map(|v| Rc::new(v) as Rc<dyn Any>) }
                    .boxed_local()
                    .shared();
                let generation = next_id();
                self.0.borrow_mut().insert(
                    slot_key.clone(),
                    Slot::Flight {
                        shared: shared.clone(),
                        generation,
                        channel: channel.clone(),
                    },
                );

                let out = shared.await;

                // Finalize only if the flight still owns its slot; an
                // invalidation during the flight discards the result.
                let mut store = self.0.borrow_mut();
                let ours = matches!(
                    store.get(&slot_key),
                    Some(Slot::Flight { generation: g, .. }) if *g == generation
                );
                if ours {
                    match &out {
                        Ok(value) => {
                            store.insert(
                                slot_key,
                                Slot::Ready {
                                    value: value.clone(),
                                    expires: Instant::now() + ttl,
                                    channel: channel.clone(),
                                },
                            );
                        }
                        Err(_) => {
                            store.remove(&slot_key);
                        }
                    }
                }
                drop(store);
                downcast(out?)
            }
        }
    }

    /// Removes every slot of `key`, across all channels.
    pub fn invalidate(&self, key: &CacheKey) {
        let id = key.id();
        self.0.borrow_mut().retain(|(slot_id, _), _| *slot_id != id);
    }

    /// Removes the slots of `key` whose stored channel is a superset of the
    /// given (possibly partial) channel.
    pub fn invalidate_channeled(&self, key: &ChanneledKey) {
        let id = key.key().id();
        self.0.borrow_mut().retain(|(slot_id, _), slot| {
            *slot_id != id || !key.channel().is_subset_of(slot.channel())
        });
    }
}

fn downcast<T: 'static>(value: Rc<dyn Any>) -> Result<Rc<T>, Fault> {
    value
        .downcast()
        .map_err(|_| Fault::msg("cache slot holds a different type"))
}
