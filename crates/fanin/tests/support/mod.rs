#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use nswatch_core::{RawNotification, RawStream, WatchConfig, WatchError, WatchTransport};
use nswatch_fanin::WatchAggregator;
use tokio::sync::Notify;
use tokio::time::Instant;

type Feed = mpsc::UnboundedSender<Result<RawNotification, WatchError>>;

#[derive(Default)]
struct State {
    feeds: HashMap<String, Vec<Feed>>,
    subscribes: HashMap<String, Vec<Instant>>,
    fail_next: HashMap<String, u32>,
    gates: HashMap<String, Arc<Notify>>,
}

/// In-memory transport: every subscribe opens a channel the test can push
/// notifications, errors or a clean end into. Keys are namespaces, `"*"`
/// for unscoped subscriptions.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<State>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` subscribe calls for `ns` fail.
    pub fn fail_next_subscribes(&self, ns: &str, n: u32) {
        self.state.lock().unwrap().fail_next.insert(ns.to_string(), n);
    }

    /// Park every later subscribe call for `ns` until the returned gate is
    /// notified once per call. The call is counted as soon as it arrives.
    pub fn hold_subscribes(&self, ns: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gates.insert(ns.to_string(), gate.clone());
        gate
    }

    pub fn subscribe_count(&self, ns: &str) -> usize {
        self.state.lock().unwrap().subscribes.get(ns).map_or(0, Vec::len)
    }

    pub fn subscribe_times(&self, ns: &str) -> Vec<Instant> {
        self.state.lock().unwrap().subscribes.get(ns).cloned().unwrap_or_default()
    }

    /// Whether the most recent subscription for `ns` is still being read.
    pub fn is_subscribed(&self, ns: &str) -> bool {
        self.state.lock().unwrap().feeds.get(ns).and_then(|f| f.last()).is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&self, ns: &str, kind: &str, object: serde_json::Value) {
        self.push(ns, Ok(RawNotification { kind: kind.to_string(), object }));
    }

    pub fn fail(&self, ns: &str, err: WatchError) {
        self.push(ns, Err(err));
    }

    /// End the latest subscription for `ns` cleanly.
    pub fn end(&self, ns: &str) {
        if let Some(feeds) = self.state.lock().unwrap().feeds.get_mut(ns) {
            feeds.pop();
        }
    }

    fn push(&self, ns: &str, item: Result<RawNotification, WatchError>) {
        let state = self.state.lock().unwrap();
        let tx = state.feeds.get(ns).and_then(|f| f.last()).expect("no subscription for namespace");
        tx.unbounded_send(item).expect("subscription closed");
    }
}

#[async_trait::async_trait]
impl WatchTransport for FakeTransport {
    async fn subscribe(&self, namespace: Option<&str>) -> Result<RawStream, WatchError> {
        let key = namespace.unwrap_or("*").to_string();
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.subscribes.entry(key.clone()).or_default().push(Instant::now());
            state.gates.get(&key).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.fail_next.get_mut(&key) {
            if *n > 0 {
                *n -= 1;
                return Err(WatchError::transport(format!("scripted subscribe failure for {key}")));
            }
        }
        let (tx, rx) = mpsc::unbounded();
        state.feeds.entry(key).or_default().push(tx);
        Ok(rx.boxed())
    }
}

pub fn config(base_ms: u64, multiplier: f64, max_attempts: u32) -> WatchConfig {
    WatchConfig {
        max_reconnect_attempts: max_attempts,
        reconnect_base_delay: Duration::from_millis(base_ms),
        reconnect_backoff_multiplier: multiplier,
        reconnect_max_delay: None,
    }
}

/// Aggregator over raw JSON resources.
pub fn aggregator(transport: &Arc<FakeTransport>, cfg: WatchConfig) -> WatchAggregator<serde_json::Value> {
    WatchAggregator::new(transport.clone(), Arc::new(nswatch_core::RawJson), cfg)
}

pub type Recorded<T> = Arc<Mutex<Vec<T>>>;

pub fn record_events(agg: &WatchAggregator<serde_json::Value>) -> Recorded<nswatch_core::AggregatedEvent<serde_json::Value>> {
    let out: Recorded<_> = Arc::default();
    let sink = out.clone();
    agg.on_event(move |ev| {
        sink.lock().unwrap().push(ev.clone());
        Ok(())
    });
    out
}

pub fn record_errors(agg: &WatchAggregator<serde_json::Value>) -> Recorded<(WatchError, String)> {
    let out: Recorded<_> = Arc::default();
    let sink = out.clone();
    agg.on_error(move |err, ns| {
        sink.lock().unwrap().push((err.clone(), ns.to_string()));
        Ok(())
    });
    out
}

/// Let spawned tasks run without advancing the (paused) clock.
pub async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

pub fn obj(name: &str) -> serde_json::Value {
    serde_json::json!({ "metadata": { "name": name } })
}
