//! Diagnostic sink for events that must not crash the bridge
//!
//! Orphan responses, malformed inbound payloads and sync fallbacks are
//! reported here instead of being thrown at a caller.

use crate::error::BridgeError;
use callbridge_api::{CallId, ErrorPayload};
use std::sync::{Mutex, PoisonError};

/// A non-fatal bridge event
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A failure response arrived for an identifier with no pending callback
    OrphanResponse {
        callback_id: CallId,
        plugin_id: String,
        method_name: String,
        error: ErrorPayload,
    },
    /// An inbound response could not be parsed
    MalformedResponse { error: String },
    /// The synchronous channel failed and the call fell back to async
    SyncFallback {
        plugin_id: String,
        method_name: String,
        reason: String,
    },
    /// A call without a response handler failed
    UnhandledFailure {
        plugin_id: String,
        method_name: String,
        error: BridgeError,
    },
}

/// Receives diagnostic events
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: Diagnostic);
}

/// Sink that logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn record(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::OrphanResponse {
                callback_id,
                plugin_id,
                method_name,
                error,
            } => tracing::warn!(
                callback_id = %callback_id,
                plugin = %plugin_id,
                method = %method_name,
                error = %error.message,
                "Error response for unknown callback"
            ),
            Diagnostic::MalformedResponse { error } => {
                tracing::error!(error = %error, "Malformed response from host")
            }
            Diagnostic::SyncFallback {
                plugin_id,
                method_name,
                reason,
            } => tracing::warn!(
                plugin = %plugin_id,
                method = %method_name,
                reason = %reason,
                "Sync call failed, falling back to async"
            ),
            Diagnostic::UnhandledFailure {
                plugin_id,
                method_name,
                error,
            } => tracing::warn!(
                plugin = %plugin_id,
                method = %method_name,
                error = %error,
                "Call failed with no response handler"
            ),
        }
    }
}

/// In-memory sink (useful for testing)
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DiagnosticSink for MemoryDiagnostics {
    fn record(&self, diagnostic: Diagnostic) {
        TracingDiagnostics.record(diagnostic.clone());
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}
