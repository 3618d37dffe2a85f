//! Lifecycle event hub.
//!
//! Subscribers register a handler per [`EventKind`]. Publishing an event
//! calls every matching handler in registration order; a handler may hand
//! back deferred async work. All deferred work of one dispatch is collected
//! into a [`BroadcastResult`], which the publisher awaits. Deferred tasks run
//! concurrently, a failing task never cancels its siblings, and failures are
//! recorded for diagnostics instead of being returned to the publisher.

use futures::future::join_all;
use sqlrunner_core::{Error, Row, Value};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Async work a subscriber asks the publisher to wait for.
pub type DeferredWork = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

type Handler = Arc<dyn Fn(&Event) -> Option<DeferredWork> + Send + Sync>;

/// Most recent subscriber failures kept for [`Broadcaster::take_failures`].
pub const FAILURE_HISTORY: usize = 64;

/// Box a future as deferred subscriber work.
pub fn defer<F>(work: F) -> Option<DeferredWork>
where
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    Some(Box::pin(work))
}

/// Names of the events a subscriber can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeQuery,
    AfterQuery,
    BeforeTransactionStart,
    AfterTransactionStart,
    BeforeTransactionCommit,
    AfterTransactionCommit,
    BeforeTransactionRollback,
    AfterTransactionRollback,
}

/// Payload of a query event.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub sql: Arc<str>,
    pub params: Arc<[Value]>,
}

/// Payload of the event published once a statement settled.
#[derive(Debug, Clone)]
pub struct AfterQueryEvent {
    pub sql: Arc<str>,
    pub params: Arc<[Value]>,
    pub success: bool,
    pub execution_time: Option<Duration>,
    pub rows: Option<Arc<[Row]>>,
    pub error: Option<Arc<Error>>,
}

/// A published lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    BeforeQuery(QueryEvent),
    AfterQuery(AfterQueryEvent),
    /// Depth before the transaction (or savepoint) starts.
    BeforeTransactionStart { depth: u32 },
    /// Depth after the transaction (or savepoint) started.
    AfterTransactionStart { depth: u32 },
    /// Depth before the commit.
    BeforeTransactionCommit { depth: u32 },
    /// Depth after the commit.
    AfterTransactionCommit { depth: u32 },
    /// Depth before the rollback.
    BeforeTransactionRollback { depth: u32 },
    /// Depth after the rollback.
    AfterTransactionRollback { depth: u32 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BeforeQuery(_) => EventKind::BeforeQuery,
            Event::AfterQuery(_) => EventKind::AfterQuery,
            Event::BeforeTransactionStart { .. } => EventKind::BeforeTransactionStart,
            Event::AfterTransactionStart { .. } => EventKind::AfterTransactionStart,
            Event::BeforeTransactionCommit { .. } => EventKind::BeforeTransactionCommit,
            Event::AfterTransactionCommit { .. } => EventKind::AfterTransactionCommit,
            Event::BeforeTransactionRollback { .. } => EventKind::BeforeTransactionRollback,
            Event::AfterTransactionRollback { .. } => EventKind::AfterTransactionRollback,
        }
    }
}

/// Identifies one registration; pass it to [`Broadcaster::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// A deferred task that failed, kept for observability.
#[derive(Debug)]
pub struct SubscriberFailure {
    pub event: EventKind,
    pub subscription: SubscriptionHandle,
    pub error: Error,
}

impl fmt::Display for SubscriberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscriber {:?} failed on {:?}: {}",
            self.subscription.0, self.event, self.error
        )
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    failures: VecDeque<SubscriberFailure>,
    failures_total: u64,
}

/// Shared publish/subscribe hub.
///
/// Cloning is cheap and every clone sees the same subscribers, so one
/// broadcaster can serve every session of a driver.
#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("Broadcaster")
            .field("subscriptions", &registry.subscriptions.len())
            .field("failures", &registry.failures.len())
            .finish()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> Option<DeferredWork> + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().subscriptions.push(Subscription {
            handle,
            kind,
            handler: Arc::new(handler),
        });
        handle
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut registry = self.lock();
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.handle != handle);
        registry.subscriptions.len() != before
    }

    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        self.lock().subscriptions.iter().any(|s| s.kind == kind)
    }

    /// Fan the event out to matching handlers and collect their deferred work.
    ///
    /// Handlers run without the registry lock held, so they may subscribe or
    /// unsubscribe themselves.
    pub fn broadcast(&self, event: &Event) -> BroadcastResult {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionHandle, Handler)> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (s.handle, Arc::clone(&s.handler)))
            .collect();

        let mut pending = Vec::new();
        for (handle, handler) in handlers {
            if let Some(work) = handler(event) {
                pending.push((handle, work));
            }
        }

        BroadcastResult {
            kind,
            pending,
            broadcaster: self.clone(),
        }
    }

    /// Broadcast and wait for every deferred task to settle.
    pub async fn publish(&self, event: &Event) -> BroadcastReport {
        self.broadcast(event).wait().await
    }

    /// Number of retained subscriber failures, at most [`FAILURE_HISTORY`].
    pub fn failure_count(&self) -> usize {
        self.lock().failures.len()
    }

    /// Failures observed over the broadcaster's lifetime, including ones
    /// already drained or evicted.
    pub fn failures_total(&self) -> u64 {
        self.lock().failures_total
    }

    /// Drain retained subscriber failures, oldest first.
    pub fn take_failures(&self) -> Vec<SubscriberFailure> {
        self.lock().failures.drain(..).collect()
    }

    fn record_failure(&self, failure: SubscriberFailure) {
        tracing::warn!(
            event = ?failure.event,
            subscription = failure.subscription.0,
            error = %failure.error,
            "subscriber deferred work failed"
        );
        let mut registry = self.lock();
        registry.failures_total += 1;
        if registry.failures.len() == FAILURE_HISTORY {
            registry.failures.pop_front();
        }
        registry.failures.push_back(failure);
    }
}

/// Deferred work collected from one dispatch.
#[must_use = "deferred subscriber work only runs when awaited"]
pub struct BroadcastResult {
    kind: EventKind,
    pending: Vec<(SubscriptionHandle, DeferredWork)>,
    broadcaster: Broadcaster,
}

impl BroadcastResult {
    /// Number of deferred tasks collected.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every deferred task to completion.
    ///
    /// Resolves when the slowest task finishes. Never fails: task errors are
    /// recorded on the broadcaster and summarized in the report.
    pub async fn wait(self) -> BroadcastReport {
        let BroadcastResult {
            kind,
            pending,
            broadcaster,
        } = self;
        let total = pending.len();
        if total == 0 {
            return BroadcastReport::default();
        }

        let outcomes = join_all(
            pending
                .into_iter()
                .map(|(handle, work)| async move { (handle, work.await) }),
        )
        .await;

        let mut failed = 0;
        for (subscription, outcome) in outcomes {
            if let Err(error) = outcome {
                failed += 1;
                broadcaster.record_failure(SubscriberFailure {
                    event: kind,
                    subscription,
                    error,
                });
            }
        }

        BroadcastReport {
            settled: total,
            failed,
        }
    }
}

/// Summary of one settled dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub settled: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn before_query() -> Event {
        Event::BeforeQuery(QueryEvent {
            sql: Arc::from("SELECT 1"),
            params: Arc::from(Vec::new()),
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let hub = Broadcaster::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            hub.subscribe(EventKind::BeforeQuery, move |_| {
                order.lock().unwrap().push(id);
                None
            });
        }
        let result = hub.broadcast(&before_query());
        assert!(result.is_empty());
        drop(result);

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn only_matching_kind_is_notified() {
        let hub = Broadcaster::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        hub.subscribe(EventKind::AfterTransactionCommit, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        });

        drop(hub.broadcast(&before_query()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(hub.has_subscribers(EventKind::AfterTransactionCommit));
        assert!(!hub.has_subscribers(EventKind::BeforeQuery));
    }

    #[test]
    fn failing_work_does_not_cancel_siblings() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let hub = Broadcaster::new();
        let finished = Arc::new(AtomicU64::new(0));

        hub.subscribe(EventKind::BeforeQuery, |_| {
            defer(async { Err(Error::Subscriber("audit sink down".into())) })
        });
        let done = Arc::clone(&finished);
        hub.subscribe(EventKind::BeforeQuery, move |_| {
            let done = Arc::clone(&done);
            defer(async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let report = rt.block_on(hub.publish(&before_query()));

        assert_eq!(report, BroadcastReport { settled: 2, failed: 1 });
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(hub.failure_count(), 1);
        let failures = hub.take_failures();
        assert_eq!(failures[0].event, EventKind::BeforeQuery);
        assert!(failures[0].to_string().contains("audit sink down"));
        assert_eq!(hub.failure_count(), 0);
        assert_eq!(hub.failures_total(), 1);
    }

    #[test]
    fn failure_history_keeps_only_the_most_recent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let hub = Broadcaster::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        hub.subscribe(EventKind::BeforeQuery, move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            defer(async move { Err(Error::Subscriber(format!("failure {n}"))) })
        });

        let published = FAILURE_HISTORY + 10;
        for _ in 0..published {
            let report = rt.block_on(hub.publish(&before_query()));
            assert_eq!(report.failed, 1);
        }

        assert_eq!(hub.failure_count(), FAILURE_HISTORY);
        assert_eq!(hub.failures_total(), published as u64);
        let failures = hub.take_failures();
        assert_eq!(failures.len(), FAILURE_HISTORY);
        assert!(failures[0].to_string().contains("failure 10"));
        assert!(
            failures[FAILURE_HISTORY - 1]
                .to_string()
                .contains(&format!("failure {}", published - 1))
        );
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let hub = Broadcaster::new();
        let handle = hub.subscribe(EventKind::BeforeQuery, |_| None);
        assert!(hub.unsubscribe(handle));
        assert!(!hub.unsubscribe(handle));
        assert!(!hub.has_subscribers(EventKind::BeforeQuery));
    }

    #[test]
    fn clones_share_subscribers() {
        let hub = Broadcaster::new();
        let other = hub.clone();
        other.subscribe(EventKind::AfterQuery, |_| None);
        assert!(hub.has_subscribers(EventKind::AfterQuery));
    }
}
