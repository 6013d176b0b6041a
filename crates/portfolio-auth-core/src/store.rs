//! Observable session-state store.
//!
//! [`SessionStore`] is the single writer and is owned by the coordinator.
//! Consumers get a [`SessionView`], which can read and observe but never
//! commit.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use futures::{StreamExt, future, stream::BoxStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;

use crate::SessionState;

/// Default capacity of the live snapshot channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A committed state together with its revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// Monotonic commit counter; `0` before the first commit.
    pub revision: u64,
    /// The committed state.
    pub state: SessionState,
}

/// Synchronous change observer.
pub type Observer = Arc<dyn Fn(&StateSnapshot) + Send + Sync>;

struct Inner {
    state: SessionState,
    revision: u64,
}

struct Shared {
    inner: RwLock<Inner>,
    observers: RwLock<Vec<(u64, Observer)>>,
    next_observer: AtomicU64,
    // Serializes commit + notification so observers see revisions in order.
    commit_lock: Mutex<()>,
    // Thread currently holding `commit_lock`, to catch observers that commit.
    committer: Mutex<Option<ThreadId>>,
    // Taken when the writer is dropped so live receivers see the channel close.
    sender: RwLock<Option<broadcast::Sender<StateSnapshot>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held `commit_lock`; clears the recorded committer when released.
struct CommitGuard<'a> {
    committer: &'a Mutex<Option<ThreadId>>,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        lock(self.committer).take();
    }
}

impl Shared {
    /// Acquire `commit_lock`.
    ///
    /// Committing from inside an observer would block forever on the lock
    /// the outer commit still holds; debug builds panic instead.
    fn serialize(&self) -> CommitGuard<'_> {
        let current = thread::current().id();
        debug_assert!(
            *lock(&self.committer) != Some(current),
            "re-entrant commit from a session observer"
        );
        let serial = lock(&self.commit_lock);
        *lock(&self.committer) = Some(current);
        CommitGuard {
            committer: &self.committer,
            _serial: serial,
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let inner = read(&self.inner);
        StateSnapshot {
            revision: inner.revision,
            state: inner.state.clone(),
        }
    }

    /// Caller must hold `commit_lock`.
    fn commit_locked(&self, state: SessionState) -> StateSnapshot {
        let snapshot = {
            let mut inner = write(&self.inner);
            inner.revision += 1;
            inner.state = state;
            StateSnapshot {
                revision: inner.revision,
                state: inner.state.clone(),
            }
        };

        let observers: Vec<Observer> = read(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(&snapshot);
        }
        if let Some(sender) = read(&self.sender).as_ref() {
            let _ = sender.send(snapshot.clone()); // live receivers
        }

        snapshot
    }
}

/// Writer side of the session-state store.
///
/// Not `Clone`: exactly one owner commits. Dropping it closes every live
/// receiver handed out by its views.
pub struct SessionStore {
    shared: Arc<Shared>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create a store holding [`SessionState::initializing`] at revision 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a store whose live snapshot channel buffers `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    state: SessionState::initializing(),
                    revision: 0,
                }),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                committer: Mutex::new(None),
                sender: RwLock::new(Some(sender)),
            }),
        }
    }

    /// Replace the whole state and notify observers before returning.
    ///
    /// Returns the new revision.
    pub fn commit(&self, state: SessionState) -> u64 {
        let _serial = self.shared.serialize();
        self.shared.commit_locked(state).revision
    }

    /// Atomically derive the next state from the current one.
    ///
    /// Nothing is committed, and nobody is notified, when `f` returns `None`.
    pub fn update<F>(&self, f: F) -> Option<u64>
    where
        F: FnOnce(&SessionState) -> Option<SessionState>,
    {
        let _serial = self.shared.serialize();
        let next = f(&read(&self.shared.inner).state)?;
        Some(self.shared.commit_locked(next).revision)
    }

    /// Latest committed state.
    #[must_use]
    pub fn read(&self) -> SessionState {
        read(&self.shared.inner).state.clone()
    }

    /// Latest revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        read(&self.shared.inner).revision
    }

    /// Read-only handle for consumers.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        write(&self.shared.sender).take();
    }
}

/// Read-only, cloneable handle on the store.
#[derive(Clone)]
pub struct SessionView {
    shared: Arc<Shared>,
}

impl SessionView {
    /// Latest committed state. Never blocks on an outstanding operation.
    #[must_use]
    pub fn read(&self) -> SessionState {
        read(&self.shared.inner).state.clone()
    }

    /// Latest committed state with its revision.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.shared.snapshot()
    }

    /// Latest revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        read(&self.shared.inner).revision
    }

    /// Register a synchronous observer, invoked after every commit.
    ///
    /// Observers run while the commit is still serialized: an observer that
    /// commits (directly or through the coordinator, e.g. `clear_error`)
    /// deadlocks the thread. Debug builds panic on such a call instead.
    #[must_use = "dropping the subscription unsubscribes the observer"]
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        write(&self.shared.observers).push((id, Arc::new(observer)));
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
            active: true,
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        read(&self.shared.observers).len()
    }

    /// Get a receiver for live snapshots.
    #[must_use]
    pub fn receiver(&self) -> broadcast::Receiver<StateSnapshot> {
        if let Some(sender) = read(&self.shared.sender).as_ref() {
            return sender.subscribe();
        }
        // Writer is gone: hand out an already-closed receiver.
        broadcast::channel(1).1
    }

    /// Stream that yields the current snapshot, then live ones.
    ///
    /// Snapshots missed by a lagging consumer are skipped.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, StateSnapshot> {
        let rx = self.receiver();
        let current = self.snapshot();
        let after = current.revision;

        let live = BroadcastStream::new(rx)
            .filter_map(move |res| future::ready(res.ok().filter(|s| s.revision > after)));

        futures::stream::once(future::ready(current)).chain(live).boxed()
    }

    /// Wait for the first snapshot whose state satisfies `predicate`,
    /// starting with the current one.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Option<StateSnapshot>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.receiver();
        let mut seen = self.snapshot();
        if predicate(&seen.state) {
            return Some(seen);
        }

        loop {
            match rx.recv().await {
                Ok(snapshot) if snapshot.revision > seen.revision => {
                    if predicate(&snapshot.state) {
                        return Some(snapshot);
                    }
                    seen = snapshot;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "state receiver lagged, re-reading store");
                    seen = self.snapshot();
                    if predicate(&seen.state) {
                        return Some(seen);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("snapshot", &self.shared.snapshot())
            .finish_non_exhaustive()
    }
}

/// Observer registration returned by [`SessionView::subscribe`].
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Remove the observer. Idempotent, and a no-op once the store is gone.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            write(&shared.observers).retain(|(id, _)| *id != self.id);
        }
    }

    /// Whether the observer is still registered from this handle's view.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
