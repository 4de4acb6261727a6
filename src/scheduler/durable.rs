//! A work queue whose items survive restarts through a persistent store.

use futures_lite::future::Boxed;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use super::{Cancel, Scheduler, work};
use crate::cx::Cx;
use crate::error::{Cancelled, Error};
use crate::sync::RwLock;

/// Items with a stable identity.
pub trait Identified {
    /// The identity type.
    type Id: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// This item's identity.
    fn id(&self) -> Self::Id;
}

/// Persistence for a [`DurableQueue`].
///
/// Calls are serialized by the queue; implementations need no locking of
/// their own.
pub trait Store<M>: Send + Sync {
    /// Reads every persisted item, oldest first.
    fn load(&self) -> Vec<M>;

    /// Replaces the persisted items with `items`.
    fn save(&self, items: &[M]);
}

type Process<M> = Arc<dyn Fn(M, Cx) -> Boxed<Result<(), Error>> + Send + Sync>;

/// A queue of persisted items, each processed as a job of a scheduler.
///
/// Items are saved before their job is scheduled and removed from the store
/// only after processing succeeds, so an item whose processing was
/// interrupted is still stored and is picked up again by the next
/// [`DurableQueue::new`] on the same store. Failed items stay stored too.
pub struct DurableQueue<M: Identified, S: Scheduler> {
    inner: Arc<DurableInner<M, S>>,
}

struct DurableInner<M: Identified, S: Scheduler> {
    store: Box<dyn Store<M>>,
    /// Guards every store access; holds the handles of items not yet
    /// processed.
    queued: RwLock<HashMap<M::Id, S::Handle>>,
    scheduler: S,
    process: Process<M>,
}

impl<M, S> DurableQueue<M, S>
where
    M: Identified + Clone + Send + Sync + 'static,
    S: Scheduler + 'static,
{
    /// Creates the queue and schedules every item already in `store`.
    pub async fn new<St, F, Fut>(
        cx: &Cx,
        store: St,
        scheduler: S,
        process: F,
    ) -> Result<Self, Cancelled>
    where
        St: Store<M> + 'static,
        F: Fn(M, Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let inner = Arc::new(DurableInner {
            store: Box::new(store),
            queued: RwLock::new(HashMap::new()),
            scheduler,
            process: Arc::new(move |item: M, cx: Cx| -> Boxed<Result<(), Error>> {
                Box::pin(process(item, cx))
            }),
        });
        {
            let mut queued = inner.queued.write(cx).await?;
            let items = inner.store.load();
            tracing::debug!(recovered = items.len(), "durable queue loaded");
            for item in items {
                let id = item.id();
                let handle = inner.schedule_item(item).await;
                queued.insert(id, handle);
            }
        }
        Ok(Self { inner })
    }

    /// Persists `item`, then schedules it.
    pub async fn append(&self, cx: &Cx, item: M) -> Result<(), Cancelled> {
        let mut queued = self.inner.queued.write(cx).await?;
        let mut items = self.inner.store.load();
        items.push(item.clone());
        self.inner.store.save(&items);
        tracing::trace!(id = ?item.id(), stored = items.len(), "item appended");

        let id = item.id();
        let handle = self.inner.schedule_item(item).await;
        queued.insert(id, handle);
        Ok(())
    }

    /// Empties the store and cancels every item not yet processed.
    pub async fn clear(&self, cx: &Cx) -> Result<(), Cancelled> {
        let handles: Vec<S::Handle> = {
            let mut queued = self.inner.queued.write(cx).await?;
            self.inner.store.save(&[]);
            queued.drain().map(|(_, handle)| handle).collect()
        };
        tracing::debug!(cancelled = handles.len(), "durable queue cleared");
        for handle in handles {
            handle.cancel();
        }
        Ok(())
    }

    /// Number of items scheduled and not yet processed.
    pub async fn pending(&self, cx: &Cx) -> Result<usize, Cancelled> {
        self.inner.queued.read_with(cx, HashMap::len).await
    }

    /// The items currently persisted.
    pub async fn stored(&self, cx: &Cx) -> Result<Vec<M>, Cancelled> {
        let _section = self.inner.queued.read(cx).await?;
        Ok(self.inner.store.load())
    }
}

impl<M, S> DurableInner<M, S>
where
    M: Identified + Clone + Send + Sync + 'static,
    S: Scheduler + 'static,
{
    /// Schedules processing of `item`. Must be called inside a write
    /// section.
    async fn schedule_item(self: &Arc<Self>, item: M) -> S::Handle {
        let inner: Weak<Self> = Arc::downgrade(self);
        let job = work(move |cx| {
            let inner = inner.clone();
            let item = item.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Err(Error::Cancelled);
                };
                let id = item.id();
                let result = (inner.process)(item, cx).await;
                inner.finish(&id, &result).await;
                result
            }
        });
        self.scheduler.schedule(S::Config::default(), job).await
    }

    async fn finish(&self, id: &M::Id, result: &Result<(), Error>) {
        let mut queued = self.queued.write_uncancelled().await;
        queued.remove(id);
        match result {
            Ok(()) => {
                let mut items = self.store.load();
                items.retain(|item| item.id() != *id);
                self.store.save(&items);
                tracing::trace!(?id, stored = items.len(), "item processed");
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(?id, "item processing cancelled, left in store");
            }
            Err(err) => {
                tracing::warn!(?id, error = %err, "item processing failed, left in store");
            }
        }
    }
}

impl<M: Identified, S: Scheduler> Debug for DurableQueue<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue").finish_non_exhaustive()
    }
}
