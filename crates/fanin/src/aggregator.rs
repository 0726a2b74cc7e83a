//! Dynamic set of per-namespace sources fanned into one event stream.
//!
//! Each namespace moves through a small state machine:
//!
//! ```text
//! Connecting --ok--> Active --failure--> PendingReconnect --timer--> Connecting
//!      |                                        ^
//!      +---------------failure------------------+
//! (failure with the attempt budget spent) --> Exhausted
//! ```
//!
//! All bookkeeping lives behind one mutex per aggregator. Callbacks coming
//! from workers and timers carry the epoch of the connection attempt they
//! belong to; anything from a superseded or removed attempt is ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use nswatch_core::{scope_of, AggregatedEvent, ChangeEvent, Transformer, WatchConfig, WatchError, WatchTransport};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::source::{SingleSourceWatch, SourceOptions};
use crate::{guarded, lock, read, write};

pub type EventHandler<R> = Arc<dyn Fn(&AggregatedEvent<R>) -> anyhow::Result<()> + Send + Sync>;

/// Called with the error and the namespace it belongs to.
pub type ErrorHandler = Arc<dyn Fn(&WatchError, &str) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    /// A worker is being created and subscribed.
    Connecting,
    /// Worker live, no timer.
    Active,
    /// Worker torn down, reconnect timer pending.
    PendingReconnect,
    /// Attempt budget spent; only an explicit start revives it.
    Exhausted,
}

/// Point-in-time view of one namespace's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub state: SourceState,
    pub reconnect_attempts: u32,
    /// Delay of the pending reconnect timer, if one is scheduled.
    pub pending_delay: Option<Duration>,
}

struct ReconnectTimer {
    task: JoinHandle<()>,
    delay: Duration,
}

struct SourceWatch<R> {
    worker: Option<SingleSourceWatch<R>>,
    state: SourceState,
    reconnect_attempts: u32,
    reconnect_timer: Option<ReconnectTimer>,
    epoch: u64,
}

impl<R> SourceWatch<R> {
    fn connecting(epoch: u64) -> Self {
        Self { worker: None, state: SourceState::Connecting, reconnect_attempts: 0, reconnect_timer: None, epoch }
    }

    fn active(&self) -> bool {
        self.state == SourceState::Active
    }

    fn cancel_timer(&mut self) {
        if let Some(t) = self.reconnect_timer.take() {
            t.task.abort();
        }
    }

    fn teardown(&mut self) {
        self.cancel_timer();
        if let Some(w) = self.worker.take() {
            w.stop();
        }
    }

    fn status(&self) -> SourceStatus {
        SourceStatus {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            pending_delay: self.reconnect_timer.as_ref().map(|t| t.delay),
        }
    }
}

impl<R> Drop for SourceWatch<R> {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

struct Inner<R> {
    transport: Arc<dyn WatchTransport>,
    transformer: Arc<dyn Transformer<R>>,
    config: WatchConfig,
    sources: Mutex<FxHashMap<String, SourceWatch<R>>>,
    event_handlers: RwLock<Vec<EventHandler<R>>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    epochs: AtomicU64,
}

/// Owns the namespace -> source mapping. Cloning yields another handle to
/// the same aggregator; dropping the last handle stops every worker.
pub struct WatchAggregator<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for WatchAggregator<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<R> WatchAggregator<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(transport: Arc<dyn WatchTransport>, transformer: Arc<dyn Transformer<R>>, config: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                transformer,
                config,
                sources: Mutex::new(FxHashMap::default()),
                event_handlers: RwLock::new(Vec::new()),
                error_handlers: RwLock::new(Vec::new()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// Register an event handler. Handlers run in registration order for
    /// every event; a failing handler is logged and skipped.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&AggregatedEvent<R>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.event_handlers).push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&WatchError, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.inner.error_handlers).push(Arc::new(handler));
    }

    /// Start every requested namespace that is not already live, concurrently.
    ///
    /// Waits for all attempts to settle. Per-namespace failures go to the
    /// error handlers and the reconnect schedule; the call itself only fails
    /// for an empty request.
    pub async fn start_watching<I, S>(&self, namespaces: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let requested = dedup(namespaces);
        if requested.is_empty() {
            return Err(WatchError::EmptyNamespaces);
        }
        let t0 = Instant::now();
        let mut pending = Vec::with_capacity(requested.len());
        {
            let mut sources = lock(&self.inner.sources);
            for ns in requested {
                let epoch = self.inner.next_epoch();
                match sources.get_mut(&ns) {
                    Some(src) if matches!(src.state, SourceState::Active | SourceState::Connecting) => {
                        debug!(ns = %ns, state = ?src.state, "already watching; skipped");
                        continue;
                    }
                    Some(src) => {
                        info!(ns = %ns, state = ?src.state, attempts = src.reconnect_attempts, "reviving source");
                        src.cancel_timer();
                        if src.state == SourceState::Exhausted {
                            src.reconnect_attempts = 0;
                        }
                        src.state = SourceState::Connecting;
                        src.epoch = epoch;
                    }
                    None => {
                        sources.insert(ns.clone(), SourceWatch::connecting(epoch));
                    }
                }
                pending.push((ns, epoch));
            }
        }

        let requested_count = pending.len();
        let results =
            futures::future::join_all(pending.into_iter().map(|(ns, epoch)| Inner::connect(Arc::clone(&self.inner), ns, epoch)))
                .await;
        let started = results.iter().filter(|ok| **ok).count();
        info!(
            requested = requested_count,
            started,
            failed = requested_count - started,
            took_ms = %t0.elapsed().as_millis(),
            "start_watching settled"
        );
        Ok(())
    }

    /// Stop and forget the given namespaces. Unknown ones are ignored.
    pub fn stop_watching<I, S>(&self, namespaces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut stopped = Vec::new();
        {
            let mut sources = lock(&self.inner.sources);
            for ns in dedup(namespaces) {
                // Timer first, so a reconnect can never resurrect a removed namespace.
                if let Some(src) = sources.get_mut(&ns) {
                    src.teardown();
                    sources.remove(&ns);
                    stopped.push(ns);
                }
            }
            publish_active(&sources);
        }
        for ns in &stopped {
            info!(ns = %ns, "stopped watching namespace");
        }
    }

    pub fn stop_all(&self) {
        let all = self.watched_namespaces();
        if !all.is_empty() {
            info!(count = all.len(), "stopping all sources");
        }
        self.stop_watching(all);
    }

    /// Converge on `namespaces`: stop what is not listed, start what is new,
    /// and leave the intersection alone (no restart, counters kept).
    pub async fn update_namespaces<I, S>(&self, namespaces: I) -> Result<(), WatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let desired: FxHashSet<String> = dedup(namespaces).into_iter().collect();
        let current: FxHashSet<String> = self.watched_namespaces().into_iter().collect();
        let mut to_stop: Vec<String> = current.difference(&desired).cloned().collect();
        let mut to_start: Vec<String> = desired.difference(&current).cloned().collect();
        to_stop.sort();
        to_start.sort();
        info!(stop = ?to_stop, start = ?to_start, kept = desired.len() - to_start.len(), "updating namespaces");
        if !to_stop.is_empty() {
            self.stop_watching(to_stop);
        }
        if !to_start.is_empty() {
            self.start_watching(to_start).await?;
        }
        Ok(())
    }

    /// Every namespace with bookkeeping, live or not, sorted.
    pub fn watched_namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = lock(&self.inner.sources).keys().cloned().collect();
        out.sort();
        out
    }

    /// True only while the namespace's worker is believed healthy.
    pub fn is_watching_namespace(&self, namespace: &str) -> bool {
        lock(&self.inner.sources).get(namespace).is_some_and(SourceWatch::active)
    }

    pub fn active_watch_count(&self) -> usize {
        lock(&self.inner.sources).values().filter(|s| s.active()).count()
    }

    pub fn source_status(&self, namespace: &str) -> Option<SourceStatus> {
        lock(&self.inner.sources).get(namespace).map(SourceWatch::status)
    }
}

impl<R> Inner<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create and subscribe a fresh worker for `ns`. Returns true when the
    /// worker was installed as the namespace's live source.
    async fn connect(inner: Arc<Self>, ns: String, epoch: u64) -> bool {
        let worker = SingleSourceWatch::new(Arc::clone(&inner.transport), Arc::clone(&inner.transformer), SourceOptions::owned());
        let weak = Arc::downgrade(&inner);
        {
            let weak = Weak::clone(&weak);
            let ns = ns.clone();
            worker.on_event(move |ev| {
                if let Some(inner) = weak.upgrade() {
                    inner.fan_in(&ns, epoch, ev);
                }
                Ok(())
            });
        }
        {
            let ns = ns.clone();
            worker.on_failure(move |err| {
                let Some(inner) = weak.upgrade() else { return };
                if err.is_terminal() {
                    Inner::handle_failure(&inner, &ns, epoch, err.clone());
                } else {
                    inner.report(err, &ns);
                }
            });
        }

        match worker.start(scope_of(&ns)).await {
            Ok(()) => {
                let mut sources = lock(&inner.sources);
                match sources.get_mut(&ns) {
                    Some(src) if src.epoch == epoch && src.state == SourceState::Connecting => {
                        let recovered = src.reconnect_attempts;
                        src.worker = Some(worker);
                        src.state = SourceState::Active;
                        src.reconnect_attempts = 0;
                        publish_active(&sources);
                        info!(ns = %ns, after_attempts = recovered, "source active");
                        true
                    }
                    _ => {
                        debug!(ns = %ns, "source removed or superseded while connecting; discarding worker");
                        worker.stop();
                        false
                    }
                }
            }
            Err(e) => {
                Inner::handle_failure(&inner, &ns, epoch, e);
                false
            }
        }
    }

    /// Terminal failure of the attempt identified by `epoch`: tear the worker
    /// down and either schedule the next attempt or give up.
    fn handle_failure(inner: &Arc<Self>, ns: &str, epoch: u64, err: WatchError) {
        let exhausted = {
            let mut sources = lock(&inner.sources);
            let Some(src) = sources.get_mut(ns) else {
                debug!(ns = %ns, error = %err, "failure for removed namespace ignored");
                return;
            };
            if src.epoch != epoch || !matches!(src.state, SourceState::Active | SourceState::Connecting) {
                debug!(ns = %ns, error = %err, "stale failure ignored");
                return;
            }
            if let Some(w) = src.worker.take() {
                w.stop();
            }
            let exhausted = if src.reconnect_attempts >= inner.config.max_reconnect_attempts {
                src.cancel_timer();
                src.state = SourceState::Exhausted;
                Some(src.reconnect_attempts)
            } else {
                src.reconnect_attempts += 1;
                let attempt = src.reconnect_attempts;
                let delay = inner.config.backoff_delay(attempt);
                let task = tokio::spawn(Inner::reconnect_after(Arc::downgrade(inner), ns.to_string(), epoch, delay));
                src.cancel_timer();
                src.reconnect_timer = Some(ReconnectTimer { task, delay });
                src.state = SourceState::PendingReconnect;
                info!(ns = %ns, attempt, delay_ms = %delay.as_millis(), "reconnect scheduled");
                counter!("watch_reconnects_scheduled_total", 1u64);
                histogram!("watch_reconnect_delay_ms", delay.as_secs_f64() * 1000.0);
                None
            };
            publish_active(&sources);
            exhausted
        };

        warn!(ns = %ns, error = %err, "source failed");
        inner.report(&err, ns);
        if let Some(attempts) = exhausted {
            warn!(ns = %ns, attempts, "reconnect budget exhausted; giving up");
            counter!("watch_exhausted_total", 1u64);
            inner.report(&WatchError::Exhausted { attempts }, ns);
        }
    }

    async fn reconnect_after(weak: Weak<Self>, ns: String, epoch: u64, delay: Duration) {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else { return };
        let next = {
            let mut sources = lock(&inner.sources);
            match sources.get_mut(&ns) {
                Some(src) if src.epoch == epoch && src.state == SourceState::PendingReconnect => {
                    let next = inner.next_epoch();
                    // Detach rather than abort: this is the timer's own task.
                    src.reconnect_timer = None;
                    src.state = SourceState::Connecting;
                    src.epoch = next;
                    info!(ns = %ns, attempt = src.reconnect_attempts, "reconnecting");
                    next
                }
                _ => return,
            }
        };
        Inner::connect(inner, ns, next).await;
    }

    /// Whether `epoch` is still the attempt recorded for `ns`. Events from a
    /// worker that was stopped or superseded must not reach handlers.
    fn is_current(&self, ns: &str, epoch: u64) -> bool {
        lock(&self.sources).get(ns).is_some_and(|src| src.epoch == epoch)
    }

    fn fan_in(&self, ns: &str, epoch: u64, event: &ChangeEvent<R>) {
        if !self.is_current(ns, epoch) {
            debug!(ns = %ns, "event from a stopped source dropped");
            counter!("watch_events_dropped_total", 1u64, "reason" => "stale");
            return;
        }
        let aggregated = AggregatedEvent { namespace: ns.to_string(), received_at: Utc::now(), event: event.clone() };
        counter!("watch_events_total", 1u64, "namespace" => ns.to_string());
        let handlers = read(&self.event_handlers).clone();
        for handler in handlers {
            if let Err(msg) = guarded(|| handler(&aggregated)) {
                warn!(ns = %ns, error = %msg, "event handler failed");
                counter!("watch_handler_errors_total", 1u64, "kind" => "event");
            }
        }
    }

    fn report(&self, err: &WatchError, ns: &str) {
        let handlers = read(&self.error_handlers).clone();
        for handler in handlers {
            if let Err(msg) = guarded(|| handler(err, ns)) {
                warn!(ns = %ns, error = %msg, "error handler failed");
                counter!("watch_handler_errors_total", 1u64, "kind" => "error");
            }
        }
    }
}

fn publish_active<R>(sources: &FxHashMap<String, SourceWatch<R>>) {
    gauge!("watch_active_sources", sources.values().filter(|s| s.active()).count() as f64);
}

/// Collect namespaces, keeping first occurrences in input order.
fn dedup<I, S>(namespaces: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = FxHashSet::default();
    namespaces.into_iter().map(Into::into).filter(|ns| seen.insert(ns.clone())).collect()
}
