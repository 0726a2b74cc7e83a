//! nswatch core types: change events, the error taxonomy and the contracts
//! of the watch transport and resource transformer collaborators.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;

pub use config::WatchConfig;
pub use error::WatchError;

pub type Uid = [u8; 16];

/// Reserved aggregator key for the unscoped (all namespaces) collection.
pub const ALL_NAMESPACES: &str = "*";

/// Map an aggregator key to the scope handed to the transport.
pub fn scope_of(namespace: &str) -> Option<&str> {
    if namespace == ALL_NAMESPACES { None } else { Some(namespace) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Map the transport's raw type string. Anything else (BOOKMARK, ERROR,
    /// vendor extensions) is not a change and yields `None`.
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "ADDED" => Some(Self::Added),
            "MODIFIED" => Some(Self::Modified),
            "DELETED" => Some(Self::Deleted),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

/// One observed mutation of a watched resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent<R> {
    pub kind: ChangeKind,
    pub resource: R,
}

/// A change event tagged with the namespace that produced it and the moment
/// it crossed into the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedEvent<R> {
    pub namespace: String,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ChangeEvent<R>,
}

/// Raw notification as delivered by the transport, before any mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNotification {
    pub kind: String,
    pub object: serde_json::Value,
}

/// Stream of raw notifications for one subscription.
///
/// - `Some(Ok(_))`: a notification
/// - `Some(Err(_))`: terminal transport error, nothing follows
/// - `None`: the server ended the stream cleanly
///
/// Dropping the stream cancels the subscription.
pub type RawStream = BoxStream<'static, Result<RawNotification, WatchError>>;

/// Single-resource watch transport.
#[async_trait::async_trait]
pub trait WatchTransport: Send + Sync {
    /// Open one subscription scoped to `namespace`, or to the whole
    /// collection when `None`.
    async fn subscribe(&self, namespace: Option<&str>) -> Result<RawStream, WatchError>;
}

/// Shapes a raw object into the domain resource. Must be pure; an error drops
/// only the offending notification.
pub trait Transformer<R>: Send + Sync {
    fn transform(&self, raw: &serde_json::Value) -> anyhow::Result<R>;
}

impl<R, F> Transformer<R> for F
where
    F: Fn(&serde_json::Value) -> anyhow::Result<R> + Send + Sync,
{
    fn transform(&self, raw: &serde_json::Value) -> anyhow::Result<R> {
        self(raw)
    }
}

/// Passes the raw JSON through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawJson;

impl Transformer<serde_json::Value> for RawJson {
    fn transform(&self, raw: &serde_json::Value) -> anyhow::Result<serde_json::Value> {
        Ok(raw.clone())
    }
}

/// Compact view of a watched object handed to event consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceView {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    pub creation_ts: i64,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
}
