//! Correlation of in-flight requests with their responses.
//!
//! Every two-way call registers an entry keyed by its request id before the
//! request is written. The entry is resolved exactly once: by a response, by
//! its timeout, or by the table being closed. Resolution removes the entry
//! from the map first, so whichever path removes it wins and every later
//! attempt is a no-op.
//!
//! A registry may be shared by several clients. Each entry carries the
//! [`OwnerId`] of the client that registered it, so one client closing only
//! fails its own calls.

use crate::error::{Error, Result};
use crate::protocol::{RequestId, Response};
use crate::worker::TaskPool;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Callback invoked once with the outcome of an asynchronous call.
pub type AsyncCallback = Box<dyn FnOnce(CallbackResponse) + Send + 'static>;

/// Outcome delivered to an [`AsyncCallback`].
#[derive(Debug)]
pub struct CallbackResponse {
    /// Id of the request.
    pub request_id: RequestId,
    /// When the call was registered.
    pub start: Instant,
    /// When the request finished writing, if it did.
    pub read_start: Option<Instant>,
    /// The response, or why none was received.
    pub result: Result<Response>,
}

/// Timestamps of one call.
#[derive(Debug)]
pub struct CallTiming {
    start: Instant,
    read_start: OnceLock<Instant>,
}

impl CallTiming {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            read_start: OnceLock::new(),
        }
    }

    /// When the call was registered.
    #[must_use]
    pub const fn start(&self) -> Instant {
        self.start
    }

    /// When the request finished writing.
    #[must_use]
    pub fn read_start(&self) -> Option<Instant> {
        self.read_start.get().copied()
    }

    /// Record the end of the write phase. Only the first call has effect.
    pub fn mark_read_start(&self) {
        let _ = self.read_start.set(Instant::now());
    }
}

/// Tag naming the client that registered a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Calls tied to no client, such as heartbeats. Only
    /// [`PendingResponses::close_all`] resolves them.
    pub const NONE: Self = Self(0);
}

enum Completion {
    Waiter(oneshot::Sender<Result<Response>>),
    Callback {
        // Boxed closures are not `Sync`; the lock makes the map shareable.
        callback: Mutex<AsyncCallback>,
        timer: Option<AbortHandle>,
    },
}

struct Entry {
    owner: OwnerId,
    timing: Arc<CallTiming>,
    completion: Completion,
}

type Entries = DashMap<RequestId, Entry>;

/// Handle held by a synchronous caller while it waits for its response.
///
/// Dropping the handle before the call resolves unregisters the call, so an
/// abandoned wait leaves nothing behind in the registry.
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    timing: Arc<CallTiming>,
    rx: oneshot::Receiver<Result<Response>>,
    entries: Weak<Entries>,
}

impl PendingResponse {
    /// Id of the request.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Timestamps of the call.
    #[must_use]
    pub fn timing(&self) -> &CallTiming {
        &self.timing
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            if entries.remove(&self.id).is_some() {
                trace!("caller of {} stopped waiting, unregistered", self.id);
            }
        }
    }
}

/// Registry of calls awaiting a response.
pub struct PendingResponses {
    entries: Arc<Entries>,
    workers: Arc<TaskPool>,
    next_owner: AtomicU64,
}

impl fmt::Debug for PendingResponses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponses")
            .field("pending", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl PendingResponses {
    /// Create an empty registry whose callbacks run on `workers`.
    #[must_use]
    pub fn new(workers: Arc<TaskPool>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            workers,
            next_owner: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh owner tag for a client sharing this registry.
    pub fn owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Pool that runs asynchronous callbacks.
    #[must_use]
    pub fn workers(&self) -> &TaskPool {
        &self.workers
    }

    /// Number of unresolved calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no call is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is still awaiting resolution.
    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Register a synchronous call made by `owner`.
    pub fn register(&self, owner: OwnerId, id: RequestId) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let timing = Arc::new(CallTiming::new());

        self.entries.insert(
            id,
            Entry {
                owner,
                timing: Arc::clone(&timing),
                completion: Completion::Waiter(tx),
            },
        );
        trace!("registered pending response {} (total: {})", id, self.len());

        PendingResponse {
            id,
            timing,
            rx,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Register an asynchronous call made by `owner` whose outcome goes to
    /// `callback`.
    pub fn register_callback(
        &self,
        owner: OwnerId,
        id: RequestId,
        callback: AsyncCallback,
    ) -> Arc<CallTiming> {
        let timing = Arc::new(CallTiming::new());

        self.entries.insert(
            id,
            Entry {
                owner,
                timing: Arc::clone(&timing),
                completion: Completion::Callback {
                    callback: Mutex::new(callback),
                    timer: None,
                },
            },
        );
        trace!("registered async callback {} (total: {})", id, self.len());

        timing
    }

    /// Resolve the call a response belongs to.
    ///
    /// Returns `false` when no call is waiting for it, which is the normal
    /// fate of a response that arrives after its call timed out.
    pub fn fulfill(&self, response: Response) -> bool {
        let id = response.id;
        let Some((_, entry)) = self.entries.remove(&id) else {
            debug!("dropping response for unknown or resolved request {}", id);
            return false;
        };

        let result = match response.error.clone() {
            Some(message) => Err(Error::Remote(message)),
            None => Ok(response),
        };
        self.resolve(id, entry, result, true);
        true
    }

    /// Resolve `id` with a read timeout if it is still pending.
    pub fn expire(&self, id: RequestId, timeout: Duration) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                debug!("request {} timed out after {:?}", id, timeout);
                self.resolve(id, entry, Err(Error::ReadTimeout(timeout)), false);
                true
            }
            None => false,
        }
    }

    /// Remove `id` without resolving it. Used when the request was never
    /// written, so the caller already holds the error.
    pub fn discard(&self, id: &RequestId) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                if let Completion::Callback {
                    timer: Some(timer), ..
                } = entry.completion
                {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Resolve every pending call with [`Error::NotConnected`].
    pub fn close_all(&self) {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        self.close_ids(ids);
    }

    /// Resolve the pending calls of `owner` with [`Error::NotConnected`],
    /// leaving every other caller of the registry untouched.
    pub fn close_owner(&self, owner: OwnerId) -> usize {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.value().owner == owner)
            .map(|e| *e.key())
            .collect();
        self.close_ids(ids)
    }

    fn close_ids(&self, ids: Vec<RequestId>) -> usize {
        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                self.resolve(id, entry, Err(Error::NotConnected), true);
                closed += 1;
            }
        }
        closed
    }

    /// Expire an asynchronous call after `timeout` unless it resolves first.
    pub fn expire_after(self: &Arc<Self>, id: RequestId, timeout: Duration) {
        let table = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(id, timeout);
        });

        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                if let Completion::Callback { timer: slot, .. } = &mut entry.completion {
                    *slot = Some(timer.abort_handle());
                }
            }
            // Resolved while the timer was being armed.
            None => timer.abort(),
        }
    }

    /// Wait for `pending` to resolve, or time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadTimeout`] if the timer wins the race, otherwise
    /// whatever error the response carried.
    pub async fn wait(&self, mut pending: PendingResponse, timeout: Duration) -> Result<Response> {
        let id = pending.id;
        let rx = &mut pending.rx;

        tokio::select! {
            biased;

            outcome = &mut *rx => outcome.unwrap_or(Err(Error::ChannelClosed)),
            () = tokio::time::sleep(timeout) => {
                if self.entries.remove(&id).is_some() {
                    debug!("request {} timed out after {:?}", id, timeout);
                    Err(Error::ReadTimeout(timeout))
                } else {
                    // Lost the race to a concurrent resolution; its value is
                    // already in flight on the channel.
                    rx.await.unwrap_or(Err(Error::ChannelClosed))
                }
            }
        }
    }

    fn resolve(&self, id: RequestId, entry: Entry, result: Result<Response>, abort_timer: bool) {
        match entry.completion {
            Completion::Waiter(tx) => {
                if tx.send(result).is_err() {
                    trace!("caller of {} stopped waiting", id);
                }
            }
            Completion::Callback { callback, timer } => {
                let callback = callback.into_inner();
                if abort_timer {
                    if let Some(timer) = timer {
                        timer.abort();
                    }
                }

                let response = CallbackResponse {
                    request_id: id,
                    start: entry.timing.start(),
                    read_start: entry.timing.read_start(),
                    result,
                };
                self.workers.submit(Box::new(move || callback(response)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSettings;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn table() -> Arc<PendingResponses> {
        Arc::new(PendingResponses::new(Arc::new(TaskPool::disabled())))
    }

    #[tokio::test]
    async fn test_fulfill_wakes_waiter() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);

        assert!(table.fulfill(Response::ok(id, Bytes::from_static(b"pong"))));
        let response = table.wait(pending, Duration::from_secs(1)).await.unwrap();

        assert_eq!(response.payload, Bytes::from_static(b"pong"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fulfill_is_noop() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);

        assert!(table.fulfill(Response::ok(id, Bytes::new())));
        assert!(!table.fulfill(Response::ok(id, Bytes::new())));
        assert!(table.wait(pending, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);

        table.fulfill(Response::error(id, "boom"));
        let err = table
            .wait(pending, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Remote(message) if message == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);

        let err = table
            .wait(pending, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ReadTimeout(t) if t == Duration::from_secs(5)));
        assert!(!table.contains(&id));
        assert!(!table.fulfill(Response::ok(id, Bytes::new())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_once_under_race() {
        for _ in 0..200 {
            let table = table();
            let id = Uuid::new_v4();
            let pending = table.register(OwnerId::NONE, id);

            let fulfiller = {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.fulfill(Response::ok(id, Bytes::new())) })
            };
            let outcome = table.wait(pending, Duration::from_micros(50)).await;
            let fulfilled = fulfiller.await.unwrap();

            match outcome {
                Ok(_) => assert!(fulfilled),
                Err(Error::ReadTimeout(_)) => assert!(!fulfilled),
                Err(e) => panic!("unexpected outcome: {e}"),
            }
            assert!(table.is_empty());
        }
    }

    #[tokio::test]
    async fn test_callback_runs_once() {
        let table = table();
        let id = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = Arc::clone(&calls);
        let timing = table.register_callback(
            OwnerId::NONE,
            id,
            Box::new(move |response: CallbackResponse| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(response);
            }),
        );
        timing.mark_read_start();
        table.expire_after(id, Duration::from_secs(5));

        assert!(table.fulfill(Response::ok(id, Bytes::from_static(b"late"))));
        assert!(!table.expire(id, Duration::from_secs(5)));

        let response = rx.await.unwrap();
        assert_eq!(response.request_id, id);
        assert!(response.read_start.is_some());
        assert!(response.result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_expires() {
        let table = table();
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        table.register_callback(
            OwnerId::NONE,
            id,
            Box::new(move |response: CallbackResponse| {
                let _ = tx.send(response.result);
            }),
        );
        table.expire_after(id, Duration::from_secs(2));

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::ReadTimeout(_))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_fails_waiters() {
        let table = table();
        let pending = table.register(OwnerId::NONE, Uuid::new_v4());

        table.close_all();
        let err = table
            .wait(pending, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_worker_pool_runs_callbacks() {
        let workers = Arc::new(TaskPool::new(WorkerSettings {
            size: 4,
            queue_len: 8,
            queue_number: 2,
        }));
        let table = PendingResponses::new(workers);
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        table.register_callback(
            OwnerId::NONE,
            id,
            Box::new(move |response: CallbackResponse| {
                let _ = tx.send(response.request_id);
            }),
        );
        table.fulfill(Response::ok(id, Bytes::new()));

        assert_eq!(rx.await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_close_owner_spares_other_owners() {
        let table = table();
        let (mine, theirs) = (table.owner(), table.owner());
        assert_ne!(mine, theirs);

        let closing = table.register(mine, Uuid::new_v4());
        let other_id = Uuid::new_v4();
        let other = table.register(theirs, other_id);

        assert_eq!(table.close_owner(mine), 1);
        assert!(matches!(
            table.wait(closing, Duration::from_secs(1)).await,
            Err(Error::NotConnected)
        ));

        assert!(table.contains(&other_id));
        table.fulfill(Response::ok(other_id, Bytes::from_static(b"still here")));
        let response = table.wait(other, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.payload, Bytes::from_static(b"still here"));
    }

    #[tokio::test]
    async fn test_dropped_handle_unregisters_call() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);
        assert!(table.contains(&id));

        drop(pending);
        assert!(table.is_empty());
        assert!(!table.fulfill(Response::ok(id, Bytes::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_unregisters_call() {
        let table = table();
        let id = Uuid::new_v4();
        let pending = table.register(OwnerId::NONE, id);

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), table.wait(pending, Duration::from_secs(5))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(table.is_empty());
    }
}
