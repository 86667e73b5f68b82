//! Bridge instance
//!
//! [`Bridge`] owns the router, both channels, the callback registry and the
//! result cache. It is cheap to clone; clones share one instance.

use crate::cache::ResultCache;
use crate::call::ResponseHandler;
use crate::channel::{AsyncChannel, MessageTransport, SyncChannel, SyncTransport};
use crate::config::{load_config, BridgeConfig, ConfigProvider};
use crate::diagnostics::{Diagnostic, DiagnosticSink, TracingDiagnostics};
use crate::error::{BridgeError, CallResult};
use crate::registry::CallbackRegistry;
use crate::router::CallRouter;
use callbridge_api::{CallId, ResponseEnvelope};
use serde_json::Value;
use std::sync::Arc;

/// Builder for [`Bridge`]
#[derive(Default)]
pub struct BridgeBuilder {
    config: Option<BridgeConfig>,
    providers: Vec<Box<dyn ConfigProvider>>,
    message_transport: Option<Arc<dyn MessageTransport>>,
    sync_transport: Option<Arc<dyn SyncTransport>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl BridgeBuilder {
    /// Use `config` directly; providers are ignored
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Append a config source, tried in insertion order
    pub fn provider(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn message_transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.message_transport = Some(transport);
        self
    }

    pub fn sync_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.sync_transport = Some(transport);
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn build(self) -> Bridge {
        let config = match self.config {
            Some(config) => config,
            None => load_config(&self.providers).config,
        };
        let diagnostics = self
            .diagnostics
            .unwrap_or_else(|| Arc::new(TracingDiagnostics));

        let sync = SyncChannel::new(self.sync_transport, config.sync_timeout_duration());
        let async_channel = AsyncChannel::new(
            CallbackRegistry::new(),
            self.message_transport,
            diagnostics.clone(),
        );
        let cache = ResultCache::new(config.cache_max_entries);
        let router = CallRouter::new(config, cache, sync, async_channel, diagnostics.clone());

        Bridge {
            inner: Arc::new(BridgeInner {
                router,
                diagnostics,
            }),
        }
    }
}

struct BridgeInner {
    router: CallRouter,
    diagnostics: Arc<dyn DiagnosticSink>,
}

/// Script-side entry point for plugin calls
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Route a call; see [`CallRouter::route`]
    pub fn route(
        &self,
        plugin_id: &str,
        method_name: &str,
        options: Value,
        handler: Option<ResponseHandler>,
    ) -> CallId {
        self.inner
            .router
            .route(plugin_id, method_name, options, handler)
    }

    /// Route a call and await its single result
    pub async fn call(&self, plugin_id: &str, method_name: &str, options: Value) -> CallResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handler = ResponseHandler::once(move |result| {
            let _ = tx.send(result);
        });
        self.route(plugin_id, method_name, options, Some(handler));
        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::unavailable(
                "Bridge was reset before the call completed",
            ))
        })
    }

    /// Register a persistent handler; it stays until the host responds with
    /// `save: false` or [`Bridge::remove_listener`] is called.
    ///
    /// `eventName` is added to object options unless already present;
    /// any other options value is replaced by `{"eventName": ..}`.
    pub fn add_listener(
        &self,
        plugin_id: &str,
        event_name: &str,
        options: Value,
        handler: ResponseHandler,
    ) -> CallId {
        let options = match options {
            Value::Object(mut map) => {
                map.entry("eventName")
                    .or_insert_with(|| Value::String(event_name.to_string()));
                Value::Object(map)
            }
            // Non-object options carry nothing the host can merge the event name into
            _ => serde_json::json!({ "eventName": event_name }),
        };
        self.inner
            .router
            .route_persistent(plugin_id, "addListener", options, handler)
    }

    /// Drop a persistent handler; later responses for `id` become orphans
    pub fn remove_listener(&self, id: &CallId) -> bool {
        self.inner.router.async_channel().registry().remove(id).is_some()
    }

    /// Deliver a parsed response envelope from the host
    pub fn resolve_response(&self, envelope: ResponseEnvelope) {
        self.inner.router.async_channel().resolve_response(envelope);
    }

    /// Deliver a raw response envelope from the host
    pub fn resolve_response_json(&self, json: &str) {
        match serde_json::from_str::<ResponseEnvelope>(json) {
            Ok(envelope) => self.resolve_response(envelope),
            Err(e) => self.inner.diagnostics.record(Diagnostic::MalformedResponse {
                error: e.to_string(),
            }),
        }
    }

    /// Forget every pending callback and cached result (runtime reload)
    pub fn reset(&self) {
        let pending = self.registry().len();
        self.registry().clear();
        self.cache().clear();
        tracing::info!(pending = pending, "Bridge reset");
    }

    /// Swap the active config; cached results are dropped
    pub fn apply_config(&self, config: BridgeConfig) {
        tracing::info!(digest = %config.digest(), "Applying bridge config");
        self.inner.router.set_config(config);
    }

    pub fn config(&self) -> Arc<BridgeConfig> {
        self.inner.router.config()
    }

    pub fn cache(&self) -> &ResultCache {
        self.inner.router.cache()
    }

    pub fn registry(&self) -> &CallbackRegistry {
        self.inner.router.async_channel().registry()
    }
}
