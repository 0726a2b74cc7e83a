//! One long-lived subscription to one namespace, normalized into change events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::StreamExt;
use metrics::counter;
use nswatch_core::{ChangeEvent, ChangeKind, RawNotification, RawStream, Transformer, WatchConfig, WatchError, WatchTransport};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{guarded, lock, read, write};

/// Receives every normalized event, in transport order. An `Err` is reported
/// on the failure sinks as [`WatchError::Sink`] without ending the watch.
pub type EventSink<R> = Arc<dyn Fn(&ChangeEvent<R>) -> anyhow::Result<()> + Send + Sync>;

/// Receives failures. Terminal ones (see [`WatchError::is_terminal`]) are
/// reported exactly once per subscription.
pub type FailureSink = Arc<dyn Fn(&WatchError) + Send + Sync>;

/// Construction-time capabilities of a [`SingleSourceWatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOptions {
    /// Re-subscribe on its own after a terminal failure.
    pub auto_reconnect: bool,
    /// Backoff used when `auto_reconnect` is set.
    pub reconnect: WatchConfig,
}

impl SourceOptions {
    /// For sources owned by an aggregator, which drives reconnection itself.
    pub fn owned() -> Self {
        Self { auto_reconnect: false, reconnect: WatchConfig::default() }
    }

    pub fn standalone(reconnect: WatchConfig) -> Self {
        Self { auto_reconnect: true, reconnect }
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self::owned()
    }
}

struct Sinks<R> {
    events: RwLock<Vec<EventSink<R>>>,
    failures: RwLock<Vec<FailureSink>>,
}

impl<R> Sinks<R> {
    fn deliver(&self, label: &str, event: &ChangeEvent<R>) {
        let sinks = read(&self.events).clone();
        for sink in sinks {
            if let Err(msg) = guarded(|| sink(event)) {
                warn!(ns = %label, error = %msg, "event sink failed");
                counter!("watch_handler_errors_total", 1u64, "kind" => "sink");
                self.fail(label, &WatchError::Sink(msg));
            }
        }
    }

    fn fail(&self, label: &str, err: &WatchError) {
        let sinks = read(&self.failures).clone();
        for sink in sinks {
            if let Err(msg) = guarded(|| {
                sink(err);
                Ok(())
            }) {
                warn!(ns = %label, error = %msg, "failure sink failed");
            }
        }
    }
}

struct Running {
    label: String,
    task: JoinHandle<()>,
    open: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl Running {
    /// Aborting alone only lands at the pump's next pending poll; the flag
    /// stops it between two ready notifications.
    fn cancel(self) -> String {
        self.cancelled.store(true, Ordering::Release);
        self.open.store(false, Ordering::Release);
        self.task.abort();
        self.label
    }
}

enum Slot {
    Idle,
    Opening,
    Open(Running),
}

/// Owns at most one subscription to one namespace (or, with `None`, to the
/// whole collection).
pub struct SingleSourceWatch<R> {
    transport: Arc<dyn WatchTransport>,
    transformer: Arc<dyn Transformer<R>>,
    options: SourceOptions,
    sinks: Arc<Sinks<R>>,
    slot: Mutex<Slot>,
}

impl<R> SingleSourceWatch<R> {
    pub fn new(transport: Arc<dyn WatchTransport>, transformer: Arc<dyn Transformer<R>>, options: SourceOptions) -> Self {
        Self {
            transport,
            transformer,
            options,
            sinks: Arc::new(Sinks { events: RwLock::new(Vec::new()), failures: RwLock::new(Vec::new()) }),
            slot: Mutex::new(Slot::Idle),
        }
    }

    pub fn on_event<F>(&self, sink: F)
    where
        F: Fn(&ChangeEvent<R>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        write(&self.sinks.events).push(Arc::new(sink));
    }

    pub fn on_failure<F>(&self, sink: F)
    where
        F: Fn(&WatchError) + Send + Sync + 'static,
    {
        write(&self.sinks.failures).push(Arc::new(sink));
    }

    /// Cancel the subscription, if any. Idempotent. No event is delivered
    /// once this returns, apart from one whose sinks are already running.
    pub fn stop(&self) {
        let prev = std::mem::replace(&mut *lock(&self.slot), Slot::Idle);
        match prev {
            Slot::Open(r) => {
                let label = r.cancel();
                info!(ns = %label, "source watch stopped");
            }
            Slot::Opening => debug!("source watch stopped while subscribing"),
            Slot::Idle => {}
        }
    }

    /// True iff a subscription is currently open.
    pub fn is_active(&self) -> bool {
        matches!(&*lock(&self.slot), Slot::Open(r) if r.open.load(Ordering::Acquire))
    }
}

impl<R> SingleSourceWatch<R>
where
    R: Send + Sync + 'static,
{

    /// Open the subscription. Fails with [`WatchError::AlreadyWatching`] while
    /// one is open or being opened, and with the transport's error if the
    /// subscribe call itself fails.
    pub async fn start(&self, namespace: Option<&str>) -> Result<(), WatchError> {
        let label = namespace.unwrap_or("(all)").to_string();
        {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Opening => return Err(WatchError::AlreadyWatching),
                Slot::Open(r) if r.open.load(Ordering::Acquire) => return Err(WatchError::AlreadyWatching),
                _ => {}
            }
            if let Slot::Open(stale) = std::mem::replace(&mut *slot, Slot::Opening) {
                stale.cancel();
            }
        }

        let t0 = Instant::now();
        let stream = match self.transport.subscribe(namespace).await {
            Ok(s) => s,
            Err(e) => {
                let mut slot = lock(&self.slot);
                if matches!(*slot, Slot::Opening) {
                    *slot = Slot::Idle;
                }
                warn!(ns = %label, error = %e, took_ms = %t0.elapsed().as_millis(), "subscribe failed");
                counter!("watch_failures_total", 1u64, "namespace" => label, "reason" => e.label());
                return Err(e);
            }
        };

        let mut slot = lock(&self.slot);
        if !matches!(*slot, Slot::Opening) {
            debug!(ns = %label, "stopped while subscribing; dropping stream");
            return Err(WatchError::Cancelled);
        }
        let open = Arc::new(AtomicBool::new(true));
        let cancelled = Arc::new(AtomicBool::new(false));
        let pump = Pump {
            label: label.clone(),
            scope: namespace.map(str::to_string),
            transport: Arc::clone(&self.transport),
            transformer: Arc::clone(&self.transformer),
            sinks: Arc::clone(&self.sinks),
            options: self.options.clone(),
            open: Arc::clone(&open),
            cancelled: Arc::clone(&cancelled),
        };
        let task = tokio::spawn(pump.run(stream));
        *slot = Slot::Open(Running { label: label.clone(), task, open, cancelled });
        info!(ns = %label, took_ms = %t0.elapsed().as_millis(), "source watch started");
        Ok(())
    }
}

impl<R> Drop for SingleSourceWatch<R> {
    fn drop(&mut self) {
        if let Slot::Open(r) = std::mem::replace(&mut *lock(&self.slot), Slot::Idle) {
            r.cancel();
        }
    }
}

/// Background side of a source: reads the stream until it fails.
struct Pump<R> {
    label: String,
    scope: Option<String>,
    transport: Arc<dyn WatchTransport>,
    transformer: Arc<dyn Transformer<R>>,
    sinks: Arc<Sinks<R>>,
    options: SourceOptions,
    open: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl<R> Pump<R>
where
    R: Send + Sync + 'static,
{
    async fn run(self, mut stream: RawStream) {
        loop {
            let Some(err) = self.drain(stream).await else {
                debug!(ns = %self.label, "pump cancelled");
                return;
            };
            self.open.store(false, Ordering::Release);
            warn!(ns = %self.label, error = %err, "source watch failed");
            counter!("watch_failures_total", 1u64, "namespace" => self.label.clone(), "reason" => err.label());
            self.sinks.fail(&self.label, &err);
            if !self.options.auto_reconnect {
                return;
            }
            match self.resubscribe().await {
                Some(next) if !self.is_cancelled() => {
                    stream = next;
                    self.open.store(true, Ordering::Release);
                    info!(ns = %self.label, "source watch reconnected");
                }
                _ => return,
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Read until the stream fails. `None` once the source was stopped.
    async fn drain(&self, mut stream: RawStream) -> Option<WatchError> {
        while let Some(item) = stream.next().await {
            if self.is_cancelled() {
                return None;
            }
            match item {
                Ok(raw) => self.handle(raw),
                Err(e) => return Some(e),
            }
        }
        (!self.is_cancelled()).then_some(WatchError::StreamEnded)
    }

    fn handle(&self, raw: RawNotification) {
        let Some(kind) = ChangeKind::from_raw(&raw.kind) else {
            debug!(ns = %self.label, raw_kind = %raw.kind, "dropping unrecognized notification");
            counter!("watch_events_dropped_total", 1u64, "reason" => "unknown_kind");
            return;
        };
        let resource = match guarded(|| self.transformer.transform(&raw.object)) {
            Ok(r) => r,
            Err(msg) => {
                warn!(ns = %self.label, kind = ?kind, error = %msg, "dropping notification that failed to transform");
                counter!("watch_events_dropped_total", 1u64, "reason" => "transform");
                return;
            }
        };
        self.sinks.deliver(&self.label, &ChangeEvent { kind, resource });
    }

    /// Self-managed backoff loop; only used when `auto_reconnect` is set.
    async fn resubscribe(&self) -> Option<RawStream> {
        let cfg = &self.options.reconnect;
        let mut attempts = 0u32;
        loop {
            if attempts >= cfg.max_reconnect_attempts {
                warn!(ns = %self.label, attempts, "giving up on source watch");
                counter!("watch_exhausted_total", 1u64);
                self.sinks.fail(&self.label, &WatchError::Exhausted { attempts });
                return None;
            }
            attempts += 1;
            let delay = cfg.backoff_delay(attempts);
            info!(ns = %self.label, attempt = attempts, delay_ms = %delay.as_millis(), "source watch reconnecting");
            tokio::time::sleep(delay).await;
            match self.transport.subscribe(self.scope.as_deref()).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!(ns = %self.label, attempt = attempts, error = %e, "reconnect failed");
                    counter!("watch_failures_total", 1u64, "namespace" => self.label.clone(), "reason" => e.label());
                    self.sinks.fail(&self.label, &e);
                }
            }
        }
    }
}
