use serde::{Deserialize, Serialize};

/// Failures surfaced by watch sources and the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum WatchError {
    #[error("invalid call: namespace list is empty")]
    EmptyNamespaces,
    #[error("subscription already open; stop it first")]
    AlreadyWatching,
    #[error("watch stopped while subscribing")]
    Cancelled,
    #[error("transport: {0}")]
    Transport(String),
    #[error("watch stream ended")]
    StreamEnded,
    #[error("event sink: {0}")]
    Sink(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

impl WatchError {
    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(e.to_string())
    }

    /// Subscription-level failure: the source is closed and must be
    /// re-created to resume.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::StreamEnded)
    }

    /// `reason` label on `watch_failures_total`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptyNamespaces => "empty_namespaces",
            Self::AlreadyWatching => "already_watching",
            Self::Cancelled => "cancelled",
            Self::Transport(_) => "transport",
            Self::StreamEnded => "stream_ended",
            Self::Sink(_) => "sink",
            Self::Exhausted { .. } => "exhausted",
        }
    }
}
