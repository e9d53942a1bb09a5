//! DataLoader utilities for batch loading
//!
//! Implements the DataLoader pattern for preventing N+1 query problems.
//! See: https://github.com/graphql/dataloader
//!
//! Every `load` issued before the scheduler gets control back joins the same
//! batch. The first key of a batch parks its future on
//! [`tokio::task::yield_now`]; sibling futures polled in that turn (for example
//! the list items of one GraphQL selection, which async-graphql joins within a
//! single task) append their keys, and the batch function runs once when the
//! first future resumes. Batching therefore depends on the executor polling
//! siblings before rescheduling the yielded future; it never waits on a timer.
//!
//! If the opening future is dropped before its batch resolves, every waiter of
//! that batch fails with [`GraphQLError::BatchCancelled`] instead of hanging.

use async_graphql::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{GraphQLError, Result};

/// Batch loader trait for loading multiple items at once
#[async_trait]
pub trait BatchLoader<K, V>: Send + Sync
where
    K: Send + Sync + Clone + Eq + Hash,
    V: Send + Sync + Clone,
{
    /// Load batch of items by keys
    ///
    /// This method should fetch all items for the given keys in a single
    /// database query or API call to avoid N+1 problems. The result must hold
    /// one value per key, in key order.
    async fn load_batch(&self, keys: &[K]) -> Result<Vec<V>>;
}

/// Adapts an async closure `Vec<K> -> Result<Vec<V>>` into a [`BatchLoader`]
pub struct BatchFn<F, K, V> {
    f: F,
    _types: PhantomData<fn(K) -> V>,
}

impl<F, K, V> BatchFn<F, K, V> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, K, V> BatchLoader<K, V> for BatchFn<F, K, V>
where
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<V>>> + Send,
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    async fn load_batch(&self, keys: &[K]) -> Result<Vec<V>> {
        (self.f)(keys.to_vec()).await
    }
}

enum Slot<V> {
    Ready(V),
    Pending(Vec<oneshot::Sender<Result<V>>>),
}

struct LoaderState<K, V> {
    slots: HashMap<K, Slot<V>>,
    queue: Vec<K>,
    flush_scheduled: bool,
}

impl<K: Eq + Hash, V> LoaderState<K, V> {
    /// Fail the waiters of still-pending `keys` and forget those keys
    fn fail(&mut self, keys: Vec<K>, error: &GraphQLError) {
        for key in keys {
            if !matches!(self.slots.get(&key), Some(Slot::Pending(_))) {
                continue;
            }
            if let Some(Slot::Pending(waiters)) = self.slots.remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }
}

struct LoaderInner<K, V> {
    name: String,
    scope: Uuid,
    batch: Box<dyn BatchLoader<K, V>>,
    state: Mutex<LoaderState<K, V>>,
}

/// Memoizing, batching loader
///
/// Keys loaded within one scheduler turn are passed to the batch function
/// together, in call order. Identical keys share one slot, and results stay
/// memoized for the lifetime of the loader. Failed batches are not memoized.
pub struct Loader<K, V> {
    inner: Arc<LoaderInner<K, V>>,
}

impl<K, V> Clone for Loader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Loader<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    /// Create new loader with a batch loader
    pub fn new<L>(name: impl Into<String>, scope: Uuid, batch: L) -> Self
    where
        L: BatchLoader<K, V> + 'static,
    {
        Self {
            inner: Arc::new(LoaderInner {
                name: name.into(),
                scope,
                batch: Box::new(batch),
                state: Mutex::new(LoaderState {
                    slots: HashMap::new(),
                    queue: Vec::new(),
                    flush_scheduled: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Load a single item by key
    ///
    /// Returns the memoized value when present, otherwise joins the current
    /// batch window.
    pub async fn load(&self, key: K) -> Result<V> {
        let (receiver, leader) = {
            let mut state = self.inner.state.lock();
            match state.slots.get_mut(&key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Pending(waiters)) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    (receiver, false)
                }
                None => {
                    let (sender, receiver) = oneshot::channel();
                    state.slots.insert(key.clone(), Slot::Pending(vec![sender]));
                    state.queue.push(key);
                    let leader = !state.flush_scheduled;
                    state.flush_scheduled = true;
                    (receiver, leader)
                }
            }
        };

        if leader {
            let mut window = Window {
                inner: &*self.inner,
                in_flight: None,
                armed: true,
            };
            tokio::task::yield_now().await;
            self.dispatch(&mut window).await;
        }

        receiver
            .await
            .map_err(|_| GraphQLError::BatchCancelled(self.inner.name.clone()))?
    }

    /// Load multiple items by keys
    ///
    /// All keys join one batch window; values come back in key order.
    pub async fn load_many(&self, keys: Vec<K>) -> Result<Vec<V>> {
        futures::future::try_join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Clear the memoized values
    ///
    /// Keys whose batch is still in flight are left alone.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.slots.retain(|_, slot| matches!(slot, Slot::Pending(_)));
    }

    /// Prime the cache with a value
    ///
    /// Useful for seeding the cache with data you already have. Pending
    /// loads of the key resolve to the primed value.
    pub fn prime(&self, key: K, value: V) {
        let mut state = self.inner.state.lock();
        if let Some(Slot::Pending(waiters)) = state.slots.insert(key, Slot::Ready(value.clone())) {
            for waiter in waiters {
                let _ = waiter.send(Ok(value.clone()));
            }
        }
    }

    async fn dispatch(&self, window: &mut Window<'_, K, V>) {
        let keys = {
            let mut state = self.inner.state.lock();
            state.flush_scheduled = false;
            std::mem::take(&mut state.queue)
        };
        if keys.is_empty() {
            window.armed = false;
            return;
        }
        window.in_flight = Some(keys.clone());

        tracing::debug!(
            loader = %self.inner.name,
            scope = %self.inner.scope,
            keys = keys.len(),
            "dispatching batch"
        );

        let outcome = match self.inner.batch.load_batch(&keys).await {
            Ok(values) if values.len() == keys.len() => Ok(values),
            Ok(values) => Err(GraphQLError::BatchLengthMismatch {
                name: self.inner.name.clone(),
                expected: keys.len(),
                actual: values.len(),
            }),
            Err(error) => Err(error),
        };
        window.armed = false;

        let mut state = self.inner.state.lock();
        match outcome {
            Ok(values) => {
                for (key, value) in keys.into_iter().zip(values) {
                    if let Some(Slot::Pending(waiters)) = state.slots.insert(key, Slot::Ready(value.clone())) {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(value.clone()));
                        }
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    loader = %self.inner.name,
                    scope = %self.inner.scope,
                    error = %error,
                    "batch failed"
                );
                state.fail(keys, &error);
            }
        }
    }
}

/// Batch window owned by the future that opened it.
///
/// Dropping that future before the batch resolves fails every waiter of the
/// window with [`GraphQLError::BatchCancelled`], so the keys can be loaded
/// again and the next `load` opens a fresh window.
struct Window<'a, K: Eq + Hash, V> {
    inner: &'a LoaderInner<K, V>,
    in_flight: Option<Vec<K>>,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for Window<'_, K, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        let keys = match self.in_flight.take() {
            Some(keys) => keys,
            None => {
                state.flush_scheduled = false;
                std::mem::take(&mut state.queue)
            }
        };
        tracing::warn!(
            loader = %self.inner.name,
            scope = %self.inner.scope,
            keys = keys.len(),
            "batch abandoned"
        );
        state.fail(keys, &GraphQLError::BatchCancelled(self.inner.name.clone()));
    }
}

/// Per-request registry of named loaders
///
/// Create one per GraphQL execution and drop it with the request; a name maps
/// to at most one loader for the registry's lifetime.
pub struct LoaderRegistry {
    scope: Uuid,
    loaders: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self {
            scope: Uuid::new_v4(),
            loaders: Mutex::new(HashMap::new()),
        }
    }

    /// Request scope id, reported in batch logs
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    /// Loader registered under `name`, created around `batch` on first use.
    ///
    /// Later calls return the existing loader and drop their `batch`.
    pub fn acquire<K, V, L>(&self, name: &str, batch: L) -> Result<Loader<K, V>>
    where
        K: Send + Sync + Clone + Eq + Hash + 'static,
        V: Send + Sync + Clone + 'static,
        L: BatchLoader<K, V> + 'static,
    {
        let mut loaders = self.loaders.lock();
        if let Some(existing) = loaders.get(name) {
            return (**existing)
                .downcast_ref::<Loader<K, V>>()
                .cloned()
                .ok_or_else(|| GraphQLError::LoaderTypeMismatch(name.to_string()));
        }

        let loader = Loader::new(name, self.scope, batch);
        loaders.insert(name.to_string(), Arc::new(loader.clone()));
        Ok(loader)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loaders.lock().contains_key(name)
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything a resolver can reach its [`LoaderRegistry`] through
pub trait LoaderAccess {
    fn loader_registry(&self) -> Option<&LoaderRegistry>;
}

impl LoaderAccess for LoaderRegistry {
    fn loader_registry(&self) -> Option<&LoaderRegistry> {
        Some(self)
    }
}

impl LoaderAccess for Option<&LoaderRegistry> {
    fn loader_registry(&self) -> Option<&LoaderRegistry> {
        *self
    }
}

impl LoaderAccess for Context<'_> {
    fn loader_registry(&self) -> Option<&LoaderRegistry> {
        self.data_opt::<LoaderRegistry>()
    }
}

/// Registry reachable through `access`, or [`GraphQLError::LoaderUnavailable`]
pub fn loader_registry<A>(access: &A) -> Result<&LoaderRegistry>
where
    A: LoaderAccess + ?Sized,
{
    access.loader_registry().ok_or(GraphQLError::LoaderUnavailable)
}

/// Load `key` through the loader named `name`, creating it around `batch`
/// if this request has not used that name yet
pub async fn load<A, K, V, L>(access: &A, name: &str, key: K, batch: L) -> Result<V>
where
    A: LoaderAccess + Sync + ?Sized,
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
    L: BatchLoader<K, V> + 'static,
{
    let loader = loader_registry(access)?.acquire(name, batch)?;
    loader.load(key).await
}
