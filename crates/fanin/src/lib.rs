//! nswatch fan-in: per-namespace watch workers merged into one event stream,
//! with failure isolation and backoff reconnection per namespace.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod aggregator;
pub mod source;

pub use aggregator::{ErrorHandler, EventHandler, SourceState, SourceStatus, WatchAggregator};
pub use source::{EventSink, FailureSink, SingleSourceWatch, SourceOptions};

/// Run a callback, turning both `Err` and panics into a message.
pub(crate) fn guarded<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("panicked: {msg}"))
        }
    }
}

// Bookkeeping stays usable after a callback panicked while a lock was held.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
