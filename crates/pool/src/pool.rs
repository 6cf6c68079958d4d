//! Index-addressed pool of self-healing slots

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Entry, PoolError, RebuildGate, Result};

/// Lifecycle events are only used for cascades; a lagging follower treats
/// the gap as a sweep.
const EVENT_CAPACITY: usize = 256;

/// Slot lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// Slot began (re)building
    Started(usize),
    /// Slot build finished, successfully or not
    Settled(usize),
}

/// Observable state of one slot
pub enum SlotState<T: ?Sized> {
    Building,
    Ready(Arc<T>),
    Failed(PoolError),
}

impl<T: ?Sized> SlotState<T> {
    pub fn is_building(&self) -> bool {
        matches!(self, Self::Building)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl<T: ?Sized> Clone for SlotState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Building => Self::Building,
            Self::Ready(value) => Self::Ready(value.clone()),
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for SlotState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "Building"),
            Self::Ready(_) => write!(f, "Ready"),
            Self::Failed(e) => write!(f, "Failed({})", e),
        }
    }
}

/// Handed to the creator for each build
pub struct PoolParams<T: ?Sized> {
    pub index: usize,
    /// Fires when this build is superseded or the pool is closed
    pub cancel: CancellationToken,
    pub pool: WeakPool<T>,
    generation: u64,
}

impl<T: ?Sized + Send + Sync + 'static> PoolParams<T> {
    /// Restart this slot once `trigger` resolves.
    ///
    /// The watcher stops when the returned entry is torn down or detached,
    /// and never restarts a newer build of the same slot.
    pub fn restart_on<F>(&self, entry: Entry<T>, trigger: F) -> Entry<T>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let watching = CancellationToken::new();
        let stop = watching.clone();
        let pool = self.pool.clone();
        let (index, generation) = (self.index, self.generation);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = watching.cancelled() => {}
                _ = trigger => {
                    if let Some(pool) = pool.upgrade() {
                        pool.restart_generation(index, generation);
                    }
                }
            }
        });

        entry.defer(move || stop.cancel())
    }
}

type Creator<T> = dyn Fn(PoolParams<T>) -> BoxFuture<'static, Result<Entry<T>>> + Send + Sync;

struct Slot<T: ?Sized> {
    generation: u64,
    state: watch::Sender<SlotState<T>>,
    entry: Option<Entry<T>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner<T: ?Sized> {
    name: String,
    capacity: usize,
    slots: Mutex<Vec<Slot<T>>>,
    creator: Box<Creator<T>>,
    events: broadcast::Sender<PoolEvent>,
    /// Bumped on every settle; wakes callers waiting for any ready slot
    settled: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl<T: ?Sized> Drop for Inner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        for slot in self.slots.get_mut().iter_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }
}

/// Fixed-capacity pool of lazily built, independently restartable resources.
///
/// Cloning is cheap and shares the slots. The last clone going away closes
/// every resource; watchers and build tasks only hold [`WeakPool`]s.
pub struct Pool<T: ?Sized> {
    inner: Arc<Inner<T>>,
}

impl<T: ?Sized> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning pool handle, used for restart signalling
pub struct WeakPool<T: ?Sized> {
    inner: Weak<Inner<T>>,
}

impl<T: ?Sized> Clone for WeakPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> WeakPool<T> {
    pub fn upgrade(&self) -> Option<Pool<T>> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }

    /// Restart `index` if the pool still exists
    pub fn restart(&self, index: usize) {
        if let Some(pool) = self.upgrade() {
            pool.restart(index);
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Pool<T> {
    /// Create a pool and start building every slot.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<F, Fut>(capacity: usize, creator: F) -> Self
    where
        F: Fn(PoolParams<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Entry<T>>> + Send + 'static,
    {
        Self::named("pool", capacity, creator)
    }

    /// Like [`Pool::new`], with a name used in logs
    pub fn named<F, Fut>(name: impl Into<String>, capacity: usize, creator: F) -> Self
    where
        F: Fn(PoolParams<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Entry<T>>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                state: watch::channel(SlotState::Building).0,
                entry: None,
                cancel: cancel.child_token(),
                task: None,
            })
            .collect();
        let creator: Box<Creator<T>> = Box::new(
            move |params: PoolParams<T>| -> BoxFuture<'static, Result<Entry<T>>> {
                Box::pin(creator(params))
            },
        );

        let pool = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                capacity,
                slots: Mutex::new(slots),
                creator,
                events: broadcast::channel(EVENT_CAPACITY).0,
                settled: watch::channel(0).0,
                cancel,
            }),
        };

        for index in 0..capacity {
            pool.start(index);
        }

        pool
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of ready slots
    pub fn size(&self) -> usize {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.state.borrow().is_ready())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn downgrade(&self) -> WeakPool<T> {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Current state of `index` without waiting
    pub fn try_get_sync(&self, index: usize) -> Option<SlotState<T>> {
        self.inner
            .slots
            .lock()
            .get(index)
            .map(|slot| slot.state.borrow().clone())
    }

    /// Wait for slot `index` to settle.
    ///
    /// Joins the in-flight build instead of starting another one. A failed
    /// slot returns its error until something restarts it.
    pub async fn get(&self, index: usize, cancel: &CancellationToken) -> Result<Arc<T>> {
        let mut state = self.subscribe(index)?;

        loop {
            let current = state.borrow_and_update().clone();
            match current {
                SlotState::Ready(value) => return Ok(value),
                SlotState::Failed(e) => return Err(e),
                SlotState::Building => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Aborted),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(PoolError::Closed);
                    }
                }
            }
        }
    }

    /// Any ready resource, picked with the OS RNG; waits while none is ready.
    ///
    /// The resource stays in the pool and may be shared with other callers.
    pub async fn get_crypto_random(&self, cancel: &CancellationToken) -> Result<Arc<T>> {
        let mut settled = self.inner.settled.subscribe();

        loop {
            let _ = settled.borrow_and_update();
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            let ready: Vec<Arc<T>> = self
                .inner
                .slots
                .lock()
                .iter()
                .filter_map(|slot| match &*slot.state.borrow() {
                    SlotState::Ready(value) => Some(value.clone()),
                    _ => None,
                })
                .collect();
            if !ready.is_empty() {
                let pick = OsRng.gen_range(0..ready.len());
                return Ok(ready[pick].clone());
            }

            self.wait_settled(&mut settled, cancel).await?;
        }
    }

    /// Remove a ready entry picked with the OS RNG, transferring ownership to
    /// the caller; its slot starts rebuilding. Waits while none is ready.
    ///
    /// Picking and removal happen under the slot lock, so concurrent takers
    /// never receive the same entry.
    pub async fn take_crypto_random(&self, cancel: &CancellationToken) -> Result<Entry<T>> {
        let mut settled = self.inner.settled.subscribe();

        loop {
            let _ = settled.borrow_and_update();
            if self.is_closed() {
                return Err(PoolError::Closed);
            }

            if let Some((index, entry)) = self.try_take_random() {
                debug!("Took {} #{}", self.inner.name, index);
                self.start(index);
                return Ok(entry);
            }

            self.wait_settled(&mut settled, cancel).await?;
        }
    }

    /// Tear down slot `index` and rebuild it
    pub fn restart(&self, index: usize) {
        if index >= self.inner.capacity {
            warn!("Ignoring restart of {} #{} (capacity {})", self.inner.name, index, self.inner.capacity);
            return;
        }
        debug!("Restarting {} #{}", self.inner.name, index);
        self.start(index);
    }

    /// Restart every slot currently failed, leaving the others alone.
    ///
    /// Returns the number of restarted slots.
    pub fn restart_failed(&self) -> usize {
        let failed: Vec<usize> = self
            .inner
            .slots
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.borrow().is_failed())
            .map(|(index, _)| index)
            .collect();

        for &index in &failed {
            self.start(index);
        }
        failed.len()
    }

    /// Cascade rebuilds from `upstream`.
    ///
    /// Whenever an upstream slot starts rebuilding, bump `gate` and restart
    /// this pool's failed slots. Runs until either pool goes away.
    pub fn follow<U>(&self, upstream: &Pool<U>, gate: RebuildGate)
    where
        U: ?Sized + Send + Sync + 'static,
    {
        let mut events = upstream.events();
        let pool = self.downgrade();
        let cancel = self.inner.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };

                match event {
                    Ok(PoolEvent::Started(_)) | Err(RecvError::Lagged(_)) => {
                        let Some(pool) = pool.upgrade() else { return };
                        gate.bump();
                        let restarted = pool.restart_failed();
                        if restarted > 0 {
                            debug!("Upstream restarted, restarted {} failed {} slot(s)", restarted, pool.name());
                        }
                    }
                    Ok(PoolEvent::Settled(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    /// Close every resource and fail every slot with [`PoolError::Closed`]
    pub fn close(&self) {
        self.inner.cancel.cancel();

        let mut entries = Vec::new();
        let mut tasks = Vec::new();
        {
            let mut slots = self.inner.slots.lock();
            for slot in slots.iter_mut() {
                slot.cancel.cancel();
                slot.generation += 1;
                slot.state.send_replace(SlotState::Failed(PoolError::Closed));
                entries.extend(slot.entry.take());
                tasks.extend(slot.task.take());
            }
        }

        for task in tasks {
            task.abort();
        }
        drop(entries);
        self.inner.settled.send_modify(|n| *n += 1);
        info!("Closed {}", self.inner.name);
    }

    fn subscribe(&self, index: usize) -> Result<watch::Receiver<SlotState<T>>> {
        self.inner
            .slots
            .lock()
            .get(index)
            .map(|slot| slot.state.subscribe())
            .ok_or(PoolError::OutOfBounds {
                index,
                capacity: self.inner.capacity,
            })
    }

    async fn wait_settled(
        &self,
        settled: &mut watch::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Aborted),
            changed = settled.changed() => changed.map_err(|_| PoolError::Closed),
        }
    }

    fn try_take_random(&self) -> Option<(usize, Entry<T>)> {
        let mut slots = self.inner.slots.lock();

        let ready: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, _)| index)
            .collect();
        if ready.is_empty() {
            return None;
        }

        let index = ready[OsRng.gen_range(0..ready.len())];
        let slot = &mut slots[index];
        let entry = slot.entry.take()?;
        slot.state.send_replace(SlotState::Building);
        Some((index, entry))
    }

    fn restart_generation(&self, index: usize, generation: u64) {
        let current = self
            .inner
            .slots
            .lock()
            .get(index)
            .map(|slot| slot.generation);
        if current == Some(generation) {
            self.restart(index);
        }
    }

    fn start(&self, index: usize) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }

        let (params, old_entry, old_task) = {
            let mut slots = inner.slots.lock();
            let slot = &mut slots[index];
            slot.cancel.cancel();
            slot.generation += 1;
            slot.cancel = inner.cancel.child_token();
            slot.state.send_replace(SlotState::Building);

            let params = PoolParams {
                index,
                cancel: slot.cancel.clone(),
                pool: self.downgrade(),
                generation: slot.generation,
            };
            (params, slot.entry.take(), slot.task.take())
        };

        if let Some(task) = old_task {
            task.abort();
        }
        drop(old_entry);
        let _ = inner.events.send(PoolEvent::Started(index));

        let generation = params.generation;
        let cancel = params.cancel.clone();
        let build = (inner.creator)(params);
        let pool = self.downgrade();

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(PoolError::Aborted),
                result = build => result,
            };
            if let Some(pool) = pool.upgrade() {
                pool.settle(index, generation, result);
            }
        });

        let mut slots = inner.slots.lock();
        let slot = &mut slots[index];
        if slot.generation == generation {
            slot.task = Some(task);
        } else {
            task.abort();
        }
    }

    fn settle(&self, index: usize, generation: u64, result: Result<Entry<T>>) {
        let inner = &self.inner;

        let outcome = {
            let mut slots = inner.slots.lock();
            let slot = &mut slots[index];
            if slot.generation != generation {
                // Superseded while finishing; the entry is torn down below
                Err(result)
            } else {
                slot.task = None;
                match result {
                    Ok(entry) => {
                        slot.state.send_replace(SlotState::Ready(entry.value().clone()));
                        slot.entry = Some(entry);
                        Ok(None)
                    }
                    Err(e) => {
                        slot.state.send_replace(SlotState::Failed(e.clone()));
                        Ok(Some(e))
                    }
                }
            }
        };

        match outcome {
            Err(stale) => {
                drop(stale);
                return;
            }
            Ok(None) => info!("Added {} #{} ({}/{})", inner.name, index, self.size(), inner.capacity),
            Ok(Some(PoolError::Aborted | PoolError::Closed)) => debug!("Aborted {} #{}", inner.name, index),
            Ok(Some(e)) => error!("Failed {} #{}: {}", inner.name, index, e),
        }

        inner.settled.send_modify(|n| *n += 1);
        let _ = inner.events.send(PoolEvent::Settled(index));
    }
}

impl<T: ?Sized + Send + Sync + 'static> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Build counter per slot
    fn counters(capacity: usize) -> Arc<Vec<AtomicUsize>> {
        Arc::new((0..capacity).map(|_| AtomicUsize::new(0)).collect())
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    /// Pool whose slot `i` yields `(i, build number)`
    fn counting_pool(capacity: usize, builds: Arc<Vec<AtomicUsize>>) -> Pool<(usize, usize)> {
        Pool::named("test", capacity, move |params| {
            let builds = builds.clone();
            async move {
                let n = builds[params.index].fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Entry::new(Arc::new((params.index, n))))
            }
        })
    }

    #[tokio::test]
    async fn test_pool_fills_every_slot() {
        brume_logging::init_test();
        let builds = counters(4);
        let pool = counting_pool(4, builds.clone());
        let cancel = CancellationToken::new();

        for index in 0..4 {
            let value = pool.get(index, &cancel).await.unwrap();
            assert_eq!(*value, (index, 1));
        }
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.capacity(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_build() {
        let builds = counters(1);
        let counted = builds.clone();
        let pool: Pool<usize> = Pool::new(1, move |_params| {
            let counted = counted.clone();
            async move {
                counted[0].fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Entry::new(Arc::new(7)))
            }
        });

        let cancel = CancellationToken::new();
        let gets = (0..5).map(|_| pool.get(0, &cancel));
        let results = futures::future::join_all(gets).await;

        assert!(results.iter().all(|r| matches!(r, Ok(v) if **v == 7)));
        assert_eq!(builds[0].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_isolates_other_slots() {
        let builds = counters(3);
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let counted = builds.clone();
        let pool: Pool<(usize, usize)> = Pool::new(3, move |params| {
            let counted = counted.clone();
            let flag = flag.clone();
            async move {
                let n = counted[params.index].fetch_add(1, Ordering::SeqCst) + 1;
                let entry = Entry::new(Arc::new((params.index, n)));
                if params.index == 1 && n == 1 {
                    return Ok(entry.on_close(move || flag.store(true, Ordering::SeqCst)));
                }
                Ok(entry)
            }
        });
        let cancel = CancellationToken::new();

        let before: Vec<_> = futures::future::join_all((0..3).map(|i| pool.get(i, &cancel)))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        pool.restart(1);
        let rebuilt = pool.get(1, &cancel).await.unwrap();

        assert_eq!(*rebuilt, (1, 2));
        assert!(closed.load(Ordering::SeqCst), "old entry must be torn down");
        assert!(Arc::ptr_eq(&before[0], &pool.get(0, &cancel).await.unwrap()));
        assert!(Arc::ptr_eq(&before[2], &pool.get(2, &cancel).await.unwrap()));
        assert_eq!(builds[0].load(Ordering::SeqCst), 1);
        assert_eq!(builds[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_slot_reports_error_until_restarted() {
        let builds = counters(2);
        let counted = builds.clone();
        let pool: Pool<usize> = Pool::new(2, move |params| {
            let counted = counted.clone();
            async move {
                let n = counted[params.index].fetch_add(1, Ordering::SeqCst);
                if params.index == 1 && n == 0 {
                    return Err(PoolError::Failed("unreachable".to_string()));
                }
                Ok(Entry::new(Arc::new(params.index)))
            }
        });
        let cancel = CancellationToken::new();

        assert_eq!(
            pool.get(1, &cancel).await.unwrap_err(),
            PoolError::Failed("unreachable".to_string())
        );
        assert!(pool.get(0, &cancel).await.is_ok());

        assert_eq!(pool.restart_failed(), 1);
        assert_eq!(*pool.get(1, &cancel).await.unwrap(), 1);
        assert_eq!(pool.restart_failed(), 0);
        assert_eq!(builds[0].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_follow_restarts_only_failed_slots_once_per_sweep() {
        let upstream = counting_pool(1, counters(1));
        let builds = counters(3);
        let counted = builds.clone();
        let downstream: Pool<usize> = Pool::new(3, move |params| {
            let counted = counted.clone();
            async move {
                let n = counted[params.index].fetch_add(1, Ordering::SeqCst);
                if params.index == 0 && n == 0 {
                    return Err(PoolError::Failed("upstream gone".to_string()));
                }
                Ok(Entry::new(Arc::new(params.index)))
            }
        });
        let gate = RebuildGate::new();
        downstream.follow(&upstream, gate.clone());

        let cancel = CancellationToken::new();
        assert!(downstream.get(0, &cancel).await.is_err());
        assert!(downstream.get(1, &cancel).await.is_ok());
        assert!(downstream.get(2, &cancel).await.is_ok());

        upstream.restart(0);
        eventually(|| matches!(downstream.try_get_sync(0), Some(SlotState::Ready(_)))).await;

        assert_eq!(gate.sweeps(), 1);
        assert_eq!(builds[0].load(Ordering::SeqCst), 2);
        assert_eq!(builds[1].load(Ordering::SeqCst), 1);
        assert_eq!(builds[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_take_transfers_ownership_and_rebuilds() {
        let builds = counters(2);
        let closes = Arc::new(AtomicUsize::new(0));
        let counted = builds.clone();
        let closing = closes.clone();
        let pool: Pool<(usize, usize)> = Pool::new(2, move |params| {
            let counted = counted.clone();
            let closing = closing.clone();
            async move {
                let n = counted[params.index].fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Entry::new(Arc::new((params.index, n)))
                    .on_close(move || {
                        closing.fetch_add(1, Ordering::SeqCst);
                    }))
            }
        });
        let cancel = CancellationToken::new();
        eventually(|| pool.size() == 2).await;

        let taken = pool.take_crypto_random(&cancel).await.unwrap();
        let (index, generation) = **taken.value();
        assert_eq!(generation, 1);

        let replacement = pool.get(index, &cancel).await.unwrap();
        assert_eq!(*replacement, (index, 2));

        let value = taken.detach();
        assert_eq!(*value, (index, 1));
        assert_eq!(closes.load(Ordering::SeqCst), 0, "taken resource must stay open");
    }

    #[tokio::test]
    async fn test_concurrent_takes_never_share_an_entry() {
        let pool = counting_pool(4, counters(4));
        let cancel = CancellationToken::new();
        eventually(|| pool.size() == 4).await;

        let takes = (0..4).map(|_| pool.take_crypto_random(&cancel));
        let taken: Vec<_> = futures::future::join_all(takes)
            .await
            .into_iter()
            .map(|r| r.unwrap().detach())
            .collect();

        for (i, a) in taken.iter().enumerate() {
            for b in &taken[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
            }
        }
    }

    #[tokio::test]
    async fn test_get_is_cancellable_and_build_survives() {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let pool: Pool<u8> = Pool::new(1, move |_params| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(Entry::new(Arc::new(1)))
            }
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        assert_eq!(pool.get(0, &cancel).await.unwrap_err(), PoolError::Aborted);

        // The caller giving up does not cancel the build
        release.notify_one();
        let fresh = CancellationToken::new();
        assert_eq!(*pool.get(0, &fresh).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_leaves_no_slot_building() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();

        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let pool: Pool<u8> = Pool::new(2, move |_params| {
            let guard = DropFlag(flag.clone());
            async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Ok(Entry::new(Arc::new(0)))
            }
        });
        let cancel = CancellationToken::new();
        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.get(0, &cancel).await })
        };
        tokio::task::yield_now().await;

        pool.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Closed);
        for index in 0..2 {
            assert!(matches!(
                pool.try_get_sync(index),
                Some(SlotState::Failed(PoolError::Closed))
            ));
        }
        eventually(|| dropped.load(Ordering::SeqCst)).await;
        assert_eq!(
            pool.get_crypto_random(&cancel).await.unwrap_err(),
            PoolError::Closed
        );
    }

    #[tokio::test]
    async fn test_dropping_pool_closes_entries() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let pool: Pool<u8> = Pool::new(1, move |_params| {
            let flag = flag.clone();
            async move { Ok(Entry::new(Arc::new(0)).on_close(move || flag.store(true, Ordering::SeqCst))) }
        });
        let cancel = CancellationToken::new();
        pool.get(0, &cancel).await.unwrap();

        drop(pool);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_restart_on_trigger() {
        let builds = counters(1);
        let counted = builds.clone();
        let (close_tx, close_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let close_rx = Arc::new(tokio::sync::Mutex::new(close_rx));

        let pool: Pool<usize> = Pool::new(1, move |params| {
            let counted = counted.clone();
            let close_rx = close_rx.clone();
            async move {
                let n = counted[0].fetch_add(1, Ordering::SeqCst) + 1;
                let entry = Entry::new(Arc::new(n));
                Ok(params.restart_on(entry, async move {
                    close_rx.lock().await.recv().await;
                }))
            }
        });
        let cancel = CancellationToken::new();
        assert_eq!(*pool.get(0, &cancel).await.unwrap(), 1);

        close_tx.send(()).unwrap();
        eventually(|| matches!(pool.try_get_sync(0), Some(SlotState::Ready(ref v)) if **v == 2)).await;
        assert_eq!(builds[0].load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_out_of_bounds() {
        let pool = counting_pool(1, counters(1));
        let cancel = CancellationToken::new();
        assert_eq!(
            pool.get(3, &cancel).await.unwrap_err(),
            PoolError::OutOfBounds { index: 3, capacity: 1 }
        );
        assert!(pool.try_get_sync(3).is_none());
        pool.restart(3);
    }
}
