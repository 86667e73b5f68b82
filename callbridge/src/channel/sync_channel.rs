//! Synchronous invocation channel
//!
//! The calling thread is suspended inside [`SyncTransport::call_sync`] until
//! the host returns a reply JSON or its wait budget elapses.

use super::{Channel, Outcome};
use crate::call::{Call, CallMode, ResponseHandler};
use crate::error::{BridgeError, TransportError};
use callbridge_api::{CallId, ErrorKind, SyncReply};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Host-exposed blocking call primitive
pub trait SyncTransport: Send + Sync {
    /// Whether the host exposes the primitive
    fn is_available(&self) -> bool;

    /// Block until the host returns a serialized [`SyncReply`]
    fn call_sync(
        &self,
        plugin_id: &str,
        method_name: &str,
        options_json: &str,
        timeout: Duration,
    ) -> Result<String, TransportError>;
}

/// Why a synchronous invocation did not produce data
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFailure {
    /// The channel itself failed; the call may be retried elsewhere
    Channel(BridgeError),
    /// The host answered with an error; surface it to the caller
    Rejected(BridgeError),
}

/// Blocking request/response channel
pub struct SyncChannel {
    transport: Option<Arc<dyn SyncTransport>>,
    timeout: RwLock<Duration>,
    counter: AtomicU64,
}

impl SyncChannel {
    pub fn new(transport: Option<Arc<dyn SyncTransport>>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout: RwLock::new(timeout),
            counter: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    /// Identifier from the sync space, never shared with async calls
    fn next_id(&self) -> CallId {
        CallId::sync(self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Invoke and block for up to `timeout`
    pub fn invoke_blocking(
        &self,
        plugin_id: &str,
        method_name: &str,
        options: &Value,
        timeout: Duration,
    ) -> Result<Value, SyncFailure> {
        let transport = match &self.transport {
            Some(transport) if transport.is_available() => transport,
            _ => {
                return Err(SyncFailure::Channel(BridgeError::unavailable(
                    "Sync channel not available",
                )))
            }
        };

        let options_json = serde_json::to_string(options).map_err(|e| {
            SyncFailure::Channel(BridgeError::malformed(format!(
                "Failed to serialize options: {}",
                e
            )))
        })?;

        let reply_json = transport
            .call_sync(plugin_id, method_name, &options_json, timeout)
            .map_err(|e| SyncFailure::Channel(e.into()))?;

        let reply: SyncReply = serde_json::from_str(&reply_json).map_err(|e| {
            SyncFailure::Channel(BridgeError::malformed(format!(
                "Malformed sync reply: {}",
                e
            )))
        })?;

        reply.into_result().map_err(|payload| {
            let error = BridgeError::from(payload);
            if error.kind == ErrorKind::Timeout {
                tracing::warn!(plugin = %plugin_id, method = %method_name, "Sync call timed out");
            }
            SyncFailure::Rejected(error)
        })
    }
}

impl Channel for SyncChannel {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn is_available(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_available())
    }

    fn send(&self, mut call: Call, _handler: Option<ResponseHandler>) -> Result<Outcome, BridgeError> {
        call.id = self.next_id();
        call.mode = CallMode::Sync;
        tracing::debug!(
            callback_id = %call.id,
            plugin = %call.plugin_id,
            method = %call.method_name,
            mode = ?call.mode,
            "Sync call"
        );

        let result =
            self.invoke_blocking(&call.plugin_id, &call.method_name, &call.options, self.timeout());
        tracing::debug!(
            callback_id = %call.id,
            elapsed_ms = call.age().num_milliseconds(),
            ok = result.is_ok(),
            "Sync call returned"
        );

        match result {
            Ok(data) => Ok(Outcome::Completed(Ok(data))),
            Err(SyncFailure::Rejected(error)) => Ok(Outcome::Completed(Err(error))),
            Err(SyncFailure::Channel(error)) => Err(error),
        }
    }
}
