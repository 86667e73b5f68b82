//! Host-side dispatch correlator
//!
//! [`MessageHandler`] receives calls from the script runtime, invokes the
//! target plugin on a blocking worker and routes exactly one response per
//! tracked call back: through the [`ResponseTransport`] for asynchronous
//! calls, or into a [`SyncCallSlot`] for synchronous ones.
//!
//! ```text
//! post_message(json) ──► PluginCall(id) ──► worker: plugin.invoke(call)
//!                                                   │
//!                             call.resolve/reject ◄─┘
//!                                    │
//!               id = "sync_n" ───────┼──────── otherwise
//!                    ▼                              ▼
//!           SyncCallSlot.signal()        ResponseTransport.post_response()
//!                    ▼
//!   call_sync() returns reply JSON
//! ```

use crate::plugin::{PluginCall, ResponseSink};
use crate::registry::PluginRegistry;
use callbridge_api::{
    CallEnvelope, CallId, ErrorKind, ErrorPayload, MessageType, ResponseEnvelope, SyncReply,
    SYNC_VERSION,
};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

/// Default budget for a synchronous call
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome written into a sync slot by the completing plugin
pub type SlotOutcome = Result<Option<Value>, ErrorPayload>;

/// Errors raised by a response transport
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Response transport unavailable")]
    TransportUnavailable,

    #[error("Failed to post response: {0}")]
    Transport(String),
}

/// Carries response envelopes from the host back to the script runtime
pub trait ResponseTransport: Send + Sync {
    /// Post one serialized [`ResponseEnvelope`]
    fn post_response(&self, envelope_json: String) -> Result<(), HostError>;
}

/// Hook receiving responses for fire-and-forget calls
pub type RestoredResultHook = Arc<dyn Fn(ResponseEnvelope) + Send + Sync>;

/// Rendezvous between a blocked caller and the completing plugin thread
///
/// The outcome is written exactly once, then the waiter is signaled. A slot
/// whose waiter timed out is abandoned; later signals land but are never read.
pub struct SyncCallSlot {
    signaled: AtomicBool,
    outcome: Mutex<Option<SlotOutcome>>,
    ready: Condvar,
}

impl SyncCallSlot {
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            outcome: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Store the outcome and wake the waiter. Returns false if already signaled.
    pub fn signal(&self, outcome: SlotOutcome) -> bool {
        if self.signaled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    /// Block until signaled or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Option<SlotOutcome> {
        let slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

impl Default for SyncCallSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch correlator between the script runtime and the plugin registry
#[derive(Clone)]
pub struct MessageHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    registry: PluginRegistry,
    runtime: Handle,
    transport: RwLock<Option<Arc<dyn ResponseTransport>>>,
    restored_hook: RwLock<Option<RestoredResultHook>>,
    slots: Mutex<HashMap<CallId, Arc<SyncCallSlot>>>,
    sync_counter: AtomicU64,
    sync_timeout: Duration,
}

impl MessageHandler {
    /// Create a handler that runs plugin methods on `runtime`'s blocking pool
    pub fn new(registry: PluginRegistry, runtime: Handle) -> Self {
        Self::with_sync_timeout(registry, runtime, DEFAULT_SYNC_TIMEOUT)
    }

    /// Create a handler with a custom default sync timeout
    pub fn with_sync_timeout(registry: PluginRegistry, runtime: Handle, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                registry,
                runtime,
                transport: RwLock::new(None),
                restored_hook: RwLock::new(None),
                slots: Mutex::new(HashMap::new()),
                sync_counter: AtomicU64::new(0),
                sync_timeout: timeout,
            }),
        }
    }

    /// Attach the transport carrying async responses to the script runtime
    pub fn set_transport(&self, transport: Arc<dyn ResponseTransport>) {
        *self
            .inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    /// Attach the hook receiving fire-and-forget responses
    pub fn set_restored_result_hook(&self, hook: RestoredResultHook) {
        *self
            .inner
            .restored_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// Entry point for messages posted by the script runtime
    pub fn post_message(&self, json: &str) {
        let message: Value = match serde_json::from_str(json) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Dropping unparseable message");
                return;
            }
        };

        match MessageType::of(&message) {
            MessageType::JsError => {
                tracing::error!(message = %json, "JavaScript error");
            }
            MessageType::Cordova => {
                tracing::warn!("Legacy cordova calls are not supported, dropping message");
            }
            MessageType::PluginCall => {
                let callback_id = message
                    .get("callbackId")
                    .and_then(Value::as_str)
                    .map(CallId::new);
                match serde_json::from_value::<CallEnvelope>(message) {
                    Ok(envelope) => self.dispatch(envelope),
                    Err(e) => self.reject_malformed(callback_id, e),
                }
            }
        }
    }

    fn dispatch(&self, envelope: CallEnvelope) {
        tracing::trace!(
            callback_id = %envelope.callback_id,
            plugin = %envelope.plugin_id,
            method = %envelope.method_name,
            "Dispatching call"
        );
        let call = PluginCall::new(
            envelope.callback_id,
            envelope.plugin_id,
            envelope.method_name,
            envelope.options,
            self.inner.clone(),
        );
        self.spawn(call);
    }

    fn reject_malformed(&self, callback_id: Option<CallId>, error: serde_json::Error) {
        tracing::error!(error = %error, "Malformed call envelope");
        let Some(callback_id) = callback_id else {
            return;
        };
        let call = PluginCall::new(callback_id, "", "", Value::Null, self.inner.clone());
        call.reject_kind(
            ErrorKind::MalformedPayload,
            format!("Malformed call envelope: {}", error),
        );
    }

    fn spawn(&self, call: PluginCall) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn_blocking(move || inner.execute(call));
    }

    /// Blocking call primitive: returns a serialized [`SyncReply`]
    pub fn call_sync(&self, plugin_id: &str, method_name: &str, options_json: &str) -> String {
        self.call_sync_with_timeout(plugin_id, method_name, options_json, self.inner.sync_timeout)
    }

    /// Blocking call primitive with an explicit timeout
    pub fn call_sync_with_timeout(
        &self,
        plugin_id: &str,
        method_name: &str,
        options_json: &str,
        timeout: Duration,
    ) -> String {
        tracing::trace!(plugin = %plugin_id, method = %method_name, "Sync call");

        let options: Value = match serde_json::from_str(options_json) {
            Ok(options) => options,
            Err(e) => {
                tracing::error!(error = %e, "Sync call error: malformed options");
                return SyncReply::err(ErrorPayload::of_kind(
                    ErrorKind::MalformedPayload,
                    format!("Malformed options: {}", e),
                ))
                .to_json();
            }
        };

        let n = self.inner.sync_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let callback_id = CallId::sync(n);
        let slot = Arc::new(SyncCallSlot::new());
        self.inner.lock_slots().insert(callback_id.clone(), slot.clone());

        let call = PluginCall::new(
            callback_id.clone(),
            plugin_id,
            method_name,
            options,
            self.inner.clone(),
        );
        self.spawn(call);

        let outcome = slot.wait(timeout);
        self.inner.lock_slots().remove(&callback_id);

        let reply = match outcome {
            Some(Ok(data)) => SyncReply::ok(data),
            Some(Err(error)) => SyncReply::err(error),
            None => {
                tracing::warn!(
                    plugin = %plugin_id,
                    method = %method_name,
                    callback_id = %callback_id,
                    "Sync call timed out"
                );
                SyncReply::err(ErrorPayload::of_kind(
                    ErrorKind::Timeout,
                    format!("Sync call timeout after {} seconds", timeout.as_secs_f64()),
                ))
            }
        };
        reply.to_json()
    }

    /// Whether the sync primitive can be used
    pub fn is_sync_available(&self) -> bool {
        true
    }

    /// Version of the sync primitive
    pub fn sync_version(&self) -> &'static str {
        SYNC_VERSION
    }

    /// Number of sync calls currently waiting
    pub fn pending_sync_calls(&self) -> usize {
        self.inner.lock_slots().len()
    }
}

impl HandlerInner {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<CallId, Arc<SyncCallSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the target and run it; every failure becomes an error response
    fn execute(&self, call: PluginCall) {
        let Some(plugin) = self.registry.get(call.plugin_id()) else {
            let message = format!("\"{}\" plugin is not implemented", call.plugin_id());
            call.reject_kind(ErrorKind::PluginNotFound, message);
            return;
        };
        if !plugin.has_method(call.method_name()) {
            let message = format!(
                "No method \"{}\" found for plugin \"{}\"",
                call.method_name(),
                call.plugin_id()
            );
            call.reject_kind(ErrorKind::MethodNotFound, message);
            return;
        }

        let guard = call.clone();
        if catch_unwind(AssertUnwindSafe(|| plugin.invoke(call))).is_err() {
            tracing::error!(
                plugin = %guard.plugin_id(),
                method = %guard.method_name(),
                "Plugin method panicked"
            );
            if !guard.is_completed() {
                guard.reject(format!(
                    "Plugin \"{}\" failed while executing \"{}\"",
                    guard.plugin_id(),
                    guard.method_name()
                ));
            }
        }
    }

    fn complete_sync(&self, callback_id: &CallId, outcome: SlotOutcome) {
        let slot = self.lock_slots().get(callback_id).cloned();
        match slot {
            Some(slot) => {
                if !slot.signal(outcome) {
                    tracing::warn!(callback_id = %callback_id, "Sync slot already signaled");
                }
            }
            None => {
                tracing::debug!(callback_id = %callback_id, "Late sync response ignored");
            }
        }
    }
}

impl ResponseSink for HandlerInner {
    fn send_response(&self, call: &PluginCall, result: Result<Option<Value>, ErrorPayload>) {
        if call.callback_id().is_sync() {
            self.complete_sync(call.callback_id(), result);
            return;
        }

        let envelope = match result {
            Ok(data) => ResponseEnvelope::success(
                call.callback_id().clone(),
                call.plugin_id(),
                call.method_name(),
                data,
            ),
            Err(error) => {
                tracing::debug!(
                    plugin = %call.plugin_id(),
                    method = %call.method_name(),
                    error = %error.message,
                    "Sending plugin error"
                );
                ResponseEnvelope::failure(
                    call.callback_id().clone(),
                    call.plugin_id(),
                    call.method_name(),
                    error,
                )
            }
        }
        .save(call.is_kept_alive());

        if call.callback_id().is_sentinel() {
            let hook = self
                .restored_hook
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match hook {
                Some(hook) => hook(envelope),
                None => tracing::debug!(
                    plugin = %call.plugin_id(),
                    method = %call.method_name(),
                    "Dropping response for untracked call"
                ),
            }
            return;
        }

        let transport = self
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let result = match (transport, serde_json::to_string(&envelope)) {
            (Some(transport), Ok(json)) => transport.post_response(json),
            (None, _) => Err(HostError::TransportUnavailable),
            (_, Err(e)) => Err(HostError::Transport(e.to_string())),
        };
        if let Err(e) = result {
            tracing::error!(callback_id = %call.callback_id(), error = %e, "Failed to post response");
        }
    }
}
