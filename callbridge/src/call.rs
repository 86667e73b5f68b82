//! Calls, response handlers and identifier allocation

use crate::error::CallResult;
use callbridge_api::{CallEnvelope, CallId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Upper bound of the random starting offset for async identifiers
const ID_SEED_RANGE: u64 = 1 << 40;

/// Channel a call travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Sync,
    Async,
}

/// One outbound request for a plugin method
#[derive(Debug, Clone)]
pub struct Call {
    /// Assigned by the channel carrying the call
    pub id: CallId,
    pub plugin_id: String,
    pub method_name: String,
    pub options: Value,
    pub mode: CallMode,
    pub created_at: DateTime<Utc>,
}

impl Call {
    pub fn new(plugin_id: impl Into<String>, method_name: impl Into<String>, options: Value) -> Self {
        Self {
            id: CallId::sentinel(),
            plugin_id: plugin_id.into(),
            method_name: method_name.into(),
            options,
            mode: CallMode::Async,
            created_at: Utc::now(),
        }
    }

    /// Time since the call was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.created_at)
    }

    /// Transport envelope for this call
    pub fn envelope(&self) -> CallEnvelope {
        CallEnvelope::new(
            self.id.clone(),
            self.plugin_id.clone(),
            self.method_name.clone(),
            self.options.clone(),
        )
    }
}

/// Caller-supplied sink for the outcome of a call
///
/// Persistent registrations invoke the same handler once per response.
#[derive(Clone)]
pub struct ResponseHandler(Arc<dyn Fn(CallResult) + Send + Sync>);

impl ResponseHandler {
    /// Handler that may be invoked any number of times
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(CallResult) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Handler that runs `f` on the first response only
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let f = Mutex::new(Some(f));
        Self::new(move |result| {
            let f = f.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(f) = f {
                f(result);
            }
        })
    }

    /// Deliver a result
    pub fn call(&self, result: CallResult) {
        (self.0)(result)
    }
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseHandler")
    }
}

/// Monotonic identifier source seeded with a random offset
///
/// The offset keeps identifiers of a fresh session clear of the tail of a
/// previous one (for example after a runtime reload).
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Start at a random offset
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(1..ID_SEED_RANGE))
    }

    /// Start at a fixed value
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Allocate the next identifier
    pub fn next_id(&self) -> CallId {
        CallId::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let ids = IdGenerator::starting_at(100);
        assert_eq!(ids.next_id(), CallId::from(100));
        assert_eq!(ids.next_id(), CallId::from(101));

        let ids = IdGenerator::new();
        let seen: HashSet<CallId> = (0..1000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 1000);
        assert!(seen.iter().all(|id| !id.is_sentinel() && !id.is_sync()));
    }

    #[test]
    fn test_sessions_start_at_different_offsets() {
        let a = IdGenerator::new().next_id();
        let b = IdGenerator::new().next_id();
        let c = IdGenerator::new().next_id();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_once_handler_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler = ResponseHandler::once(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handler.call(Ok(json!(1)));
        handler.call(Ok(json!(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_envelope() {
        let mut call = Call::new("Storage", "get", json!({"key": "token"}));
        call.id = CallId::from(5);
        let envelope = call.envelope();
        assert_eq!(envelope.callback_id, CallId::from(5));
        assert_eq!(envelope.plugin_id, "Storage");
        assert_eq!(call.mode, CallMode::Async);
    }

    #[test]
    fn test_call_age() {
        let mut call = Call::new("Device", "info", json!({}));
        assert!(call.age() >= chrono::Duration::zero());

        call.created_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(call.age() >= chrono::Duration::seconds(5));
    }
}
