//! Asynchronous invocation channel
//!
//! Calls are posted as envelopes and correlated to their responses purely by
//! identifier, so in-flight calls may complete in any order.

use super::{Channel, Outcome};
use crate::call::{Call, CallMode, IdGenerator, ResponseHandler};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{BridgeError, TransportError};
use crate::registry::{CallbackRegistry, PendingCallback};
use callbridge_api::{CallId, ResponseEnvelope};
use std::sync::Arc;

/// Carries serialized call envelopes to the host
pub trait MessageTransport: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    /// Post one serialized [`callbridge_api::CallEnvelope`]
    fn post_message(&self, envelope_json: String) -> Result<(), TransportError>;
}

/// Message-passing request/response channel
pub struct AsyncChannel {
    ids: IdGenerator,
    registry: CallbackRegistry,
    transport: Option<Arc<dyn MessageTransport>>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl AsyncChannel {
    pub fn new(
        registry: CallbackRegistry,
        transport: Option<Arc<dyn MessageTransport>>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self::with_ids(IdGenerator::new(), registry, transport, diagnostics)
    }

    /// Create with an explicit identifier source
    pub fn with_ids(
        ids: IdGenerator,
        registry: CallbackRegistry,
        transport: Option<Arc<dyn MessageTransport>>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            ids,
            registry,
            transport,
            diagnostics,
        }
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Post `call`; a handler is registered before transmitting
    pub fn send_with(
        &self,
        mut call: Call,
        handler: Option<ResponseHandler>,
        persistent: bool,
    ) -> Result<CallId, BridgeError> {
        let transport = self
            .transport
            .as_ref()
            .filter(|t| t.is_available())
            .ok_or_else(|| BridgeError::unavailable("Async channel not available"))?;

        call.mode = CallMode::Async;
        call.id = match &handler {
            Some(_) => self.ids.next_id(),
            None => CallId::sentinel(),
        };

        let json = serde_json::to_string(&call.envelope())
            .map_err(|e| BridgeError::malformed(format!("Failed to serialize call: {}", e)))?;

        // Register first: the response may arrive before post_message returns
        if let Some(handler) = handler {
            let callback = if persistent {
                PendingCallback::persistent(call.id.clone(), handler)
            } else {
                PendingCallback::one_shot(call.id.clone(), handler)
            };
            self.registry.put(callback);
        }

        tracing::debug!(
            callback_id = %call.id,
            plugin = %call.plugin_id,
            method = %call.method_name,
            mode = ?call.mode,
            queued_ms = call.age().num_milliseconds(),
            "Posting call"
        );

        if let Err(e) = transport.post_message(json) {
            if !call.id.is_sentinel() {
                self.registry.remove(&call.id);
            }
            return Err(e.into());
        }
        Ok(call.id)
    }

    /// Deliver a response envelope to its pending callback
    pub fn resolve_response(&self, envelope: ResponseEnvelope) {
        let drop_entry = envelope.save == Some(false);
        match self.registry.take_for_response(&envelope.callback_id, drop_entry) {
            Some(handler) => {
                let result = envelope.outcome().map_err(BridgeError::from);
                handler.call(result);
            }
            None => match envelope.outcome() {
                Err(error) => {
                    self.diagnostics.record(Diagnostic::OrphanResponse {
                        callback_id: envelope.callback_id,
                        plugin_id: envelope.plugin_id,
                        method_name: envelope.method_name,
                        error,
                    });
                }
                Ok(_) => {
                    tracing::debug!(
                        callback_id = %envelope.callback_id,
                        "Response for unknown callback ignored"
                    );
                }
            },
        }
    }
}

impl Channel for AsyncChannel {
    fn name(&self) -> &'static str {
        "async"
    }

    fn is_available(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_available())
    }

    fn send(&self, call: Call, handler: Option<ResponseHandler>) -> Result<Outcome, BridgeError> {
        self.send_with(call, handler, false).map(Outcome::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemoryDiagnostics;
    use crate::error::CallResult;
    use callbridge_api::{CallEnvelope, ErrorKind, ErrorPayload};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        posted: Mutex<Vec<CallEnvelope>>,
        fail: bool,
    }

    impl MessageTransport for RecordingTransport {
        fn post_message(&self, envelope_json: String) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Unavailable);
            }
            self.posted
                .lock()
                .unwrap()
                .push(serde_json::from_str(&envelope_json).unwrap());
            Ok(())
        }
    }

    struct Fixture {
        channel: AsyncChannel,
        transport: Arc<RecordingTransport>,
        diagnostics: Arc<MemoryDiagnostics>,
    }

    fn fixture(fail: bool) -> Fixture {
        let transport = Arc::new(RecordingTransport {
            fail,
            ..Default::default()
        });
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let channel = AsyncChannel::with_ids(
            IdGenerator::starting_at(500),
            CallbackRegistry::new(),
            Some(transport.clone()),
            diagnostics.clone(),
        );
        Fixture {
            channel,
            transport,
            diagnostics,
        }
    }

    fn recorder() -> (ResponseHandler, Arc<Mutex<Vec<CallResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let handler = ResponseHandler::new(move |r| sink.lock().unwrap().push(r));
        (handler, results)
    }

    fn response(id: &CallId, success: bool) -> ResponseEnvelope {
        if success {
            ResponseEnvelope::success(id.clone(), "Storage", "get", Some(json!(id.as_str())))
        } else {
            ResponseEnvelope::failure(id.clone(), "Storage", "get", ErrorPayload::new("nope"))
        }
    }

    #[test]
    fn test_registers_before_posting() {
        let f = fixture(false);
        let (handler, _) = recorder();
        let id = f
            .channel
            .send_with(Call::new("Storage", "get", json!({})), Some(handler), false)
            .unwrap();

        assert_eq!(id, CallId::from(500));
        assert!(f.channel.registry().contains(&id));
        assert_eq!(f.transport.posted.lock().unwrap()[0].callback_id, id);
    }

    #[test]
    fn test_fire_and_forget_uses_sentinel() {
        let f = fixture(false);
        let id = f
            .channel
            .send_with(Call::new("App", "exit", json!({})), None, false)
            .unwrap();
        assert!(id.is_sentinel());
        assert!(f.channel.registry().is_empty());
    }

    #[test]
    fn test_out_of_order_responses_correlate_by_id() {
        let f = fixture(false);
        let (h1, r1) = recorder();
        let (h2, r2) = recorder();
        let id1 = f.channel.send_with(Call::new("Storage", "get", json!(1)), Some(h1), false).unwrap();
        let id2 = f.channel.send_with(Call::new("Storage", "get", json!(2)), Some(h2), false).unwrap();

        f.channel.resolve_response(response(&id2, true));
        f.channel.resolve_response(response(&id1, false));

        assert_eq!(r1.lock().unwrap()[0].as_ref().unwrap_err().message, "nope");
        assert_eq!(r2.lock().unwrap()[0].as_ref().unwrap(), &json!(id2.as_str()));
        assert!(f.channel.registry().is_empty());
    }

    #[test]
    fn test_persistent_entries_and_save_false() {
        let f = fixture(false);
        let (handler, results) = recorder();
        let id = f
            .channel
            .send_with(Call::new("Network", "addListener", json!({})), Some(handler), true)
            .unwrap();

        f.channel.resolve_response(response(&id, true).save(true));
        f.channel.resolve_response(response(&id, true).save(true));
        assert!(f.channel.registry().contains(&id));

        f.channel.resolve_response(response(&id, true).save(false));
        assert!(!f.channel.registry().contains(&id));
        assert_eq!(results.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_orphan_error_goes_to_diagnostics() {
        let f = fixture(false);
        f.channel.resolve_response(response(&CallId::from(9), false));
        f.channel.resolve_response(response(&CallId::from(10), true));

        let events = f.diagnostics.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Diagnostic::OrphanResponse { callback_id, .. } if callback_id == &CallId::from(9)
        ));
    }

    #[test]
    fn test_orphan_failure_without_error_body_is_diagnosed() {
        let f = fixture(false);
        let envelope: ResponseEnvelope = serde_json::from_str(
            r#"{"callbackId":"42","pluginId":"Storage","methodName":"get","success":false}"#,
        )
        .unwrap();
        f.channel.resolve_response(envelope);

        let events = f.diagnostics.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Diagnostic::OrphanResponse { error, .. } => {
                assert_eq!(error.message, "Unknown error");
            }
            other => panic!("unexpected diagnostic: {:?}", other),
        }
    }

    #[test]
    fn test_transport_failure_unregisters() {
        let f = fixture(true);
        let (handler, _) = recorder();
        let err = f
            .channel
            .send_with(Call::new("Storage", "get", json!({})), Some(handler), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportUnavailable);
        assert!(f.channel.registry().is_empty());
    }
}
