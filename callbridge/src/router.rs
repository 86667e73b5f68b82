//! Call router
//!
//! Every call passes through [`CallRouter::route`]:
//!
//! 1. write-classified methods invalidate the plugin's cache *before* dispatch
//! 2. a fresh cache entry answers the call without dispatching
//! 3. sync-eligible calls try the sync channel; a channel failure falls back
//!    to async exactly once
//! 4. everything else goes over the async channel
//!
//! Handlers of cache-eligible calls are wrapped so successful results are
//! stored before the caller sees them.

use crate::cache::{cache_key, plugin_prefix, ResultCache};
use crate::call::{Call, ResponseHandler};
use crate::channel::{AsyncChannel, Channel, Outcome, SyncChannel};
use crate::config::BridgeConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::BridgeError;
use callbridge_api::CallId;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Top-level call entry point
pub struct CallRouter {
    config: RwLock<Arc<BridgeConfig>>,
    cache: ResultCache,
    sync: SyncChannel,
    async_channel: AsyncChannel,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl CallRouter {
    pub fn new(
        config: BridgeConfig,
        cache: ResultCache,
        sync: SyncChannel,
        async_channel: AsyncChannel,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        cache.set_max_entries(config.cache_max_entries);
        sync.set_timeout(config.sync_timeout_duration());
        Self {
            config: RwLock::new(Arc::new(config)),
            cache,
            sync,
            async_channel,
            diagnostics,
        }
    }

    /// Snapshot of the active config
    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active config; cached results are dropped
    pub fn set_config(&self, config: BridgeConfig) {
        self.cache.clear();
        self.cache.set_max_entries(config.cache_max_entries);
        self.sync.set_timeout(config.sync_timeout_duration());
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn async_channel(&self) -> &AsyncChannel {
        &self.async_channel
    }

    pub fn sync_channel(&self) -> &SyncChannel {
        &self.sync
    }

    /// Route one call. Returns the sentinel when no response is tracked.
    pub fn route(
        &self,
        plugin_id: &str,
        method_name: &str,
        options: Value,
        handler: Option<ResponseHandler>,
    ) -> CallId {
        let config = self.config();

        let is_write = config.is_write_method(plugin_id, method_name);
        if is_write {
            self.cache.invalidate(&plugin_prefix(plugin_id));
        }

        let ttl = config.cache_ttl(plugin_id, method_name);
        let key = ttl.map(|_| cache_key(plugin_id, method_name, &options));

        if let (Some(key), Some(handler)) = (&key, &handler) {
            if let Some(data) = self.cache.get(key) {
                tracing::debug!(plugin = %plugin_id, method = %method_name, "Cache hit");
                handler.call(Ok(data));
                return CallId::sentinel();
            }
        }

        let handler = handler.map(|h| self.wrap_handler(h, plugin_id, key.zip(ttl), is_write));
        let call = Call::new(plugin_id, method_name, options);

        if let Some(handler) = &handler {
            if config.sync_enabled
                && config.is_sync_method(plugin_id, method_name)
                && self.sync.is_available()
            {
                match self.sync.send(call.clone(), None) {
                    Ok(Outcome::Completed(result)) => {
                        handler.call(result);
                        return CallId::sentinel();
                    }
                    Ok(Outcome::Pending(id)) => return id,
                    Err(error) => {
                        self.diagnostics.record(Diagnostic::SyncFallback {
                            plugin_id: plugin_id.to_string(),
                            method_name: method_name.to_string(),
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }

        match self.async_channel.send(call, handler.clone()) {
            Ok(Outcome::Pending(id)) => id,
            Ok(Outcome::Completed(result)) => {
                if let Some(handler) = handler {
                    handler.call(result);
                }
                CallId::sentinel()
            }
            Err(error) => {
                self.reject(plugin_id, method_name, handler, error);
                CallId::sentinel()
            }
        }
    }

    /// Register a persistent (listener-style) call over the async channel
    pub fn route_persistent(
        &self,
        plugin_id: &str,
        method_name: &str,
        options: Value,
        handler: ResponseHandler,
    ) -> CallId {
        let call = Call::new(plugin_id, method_name, options);
        match self
            .async_channel
            .send_with(call, Some(handler.clone()), true)
        {
            Ok(id) => id,
            Err(error) => {
                self.reject(plugin_id, method_name, Some(handler), error);
                CallId::sentinel()
            }
        }
    }

    fn reject(
        &self,
        plugin_id: &str,
        method_name: &str,
        handler: Option<ResponseHandler>,
        error: BridgeError,
    ) {
        match handler {
            Some(handler) => handler.call(Err(error)),
            None => self.diagnostics.record(Diagnostic::UnhandledFailure {
                plugin_id: plugin_id.to_string(),
                method_name: method_name.to_string(),
                error,
            }),
        }
    }

    fn wrap_handler(
        &self,
        handler: ResponseHandler,
        plugin_id: &str,
        cache_entry: Option<(String, Duration)>,
        is_write: bool,
    ) -> ResponseHandler {
        if cache_entry.is_none() && !is_write {
            return handler;
        }
        let cache = self.cache.clone();
        let prefix = plugin_prefix(plugin_id);
        ResponseHandler::new(move |result| {
            if let Ok(data) = &result {
                if is_write {
                    cache.invalidate(&prefix);
                }
                if let Some((key, ttl)) = &cache_entry {
                    cache.put(key.clone(), data.clone(), *ttl);
                }
            }
            handler.call(result);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::IdGenerator;
    use crate::channel::{MessageTransport, SyncTransport};
    use crate::diagnostics::MemoryDiagnostics;
    use crate::error::{CallResult, TransportError};
    use crate::registry::CallbackRegistry;
    use callbridge_api::{CallEnvelope, ErrorKind, ErrorPayload, ResponseEnvelope, SyncReply};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Posted {
        envelopes: Mutex<Vec<CallEnvelope>>,
    }

    impl MessageTransport for Posted {
        fn post_message(&self, envelope_json: String) -> Result<(), TransportError> {
            self.envelopes
                .lock()
                .unwrap()
                .push(serde_json::from_str(&envelope_json).unwrap());
            Ok(())
        }
    }

    /// Sync primitive that answers from a closure and counts calls
    struct ScriptedSync {
        calls: AtomicUsize,
        reply: Box<dyn Fn(&str) -> Result<String, TransportError> + Send + Sync>,
    }

    impl SyncTransport for ScriptedSync {
        fn is_available(&self) -> bool {
            true
        }

        fn call_sync(
            &self,
            _plugin_id: &str,
            _method_name: &str,
            options_json: &str,
            _timeout: Duration,
        ) -> Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)(options_json)
        }
    }

    struct Fixture {
        router: CallRouter,
        posted: Arc<Posted>,
        sync: Arc<ScriptedSync>,
        diagnostics: Arc<MemoryDiagnostics>,
    }

    fn fixture(
        config: BridgeConfig,
        reply: impl Fn(&str) -> Result<String, TransportError> + Send + Sync + 'static,
    ) -> Fixture {
        let posted = Arc::new(Posted::default());
        let sync = Arc::new(ScriptedSync {
            calls: AtomicUsize::new(0),
            reply: Box::new(reply),
        });
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let router = CallRouter::new(
            config,
            ResultCache::default(),
            SyncChannel::new(Some(sync.clone()), Duration::from_secs(1)),
            AsyncChannel::with_ids(
                IdGenerator::starting_at(1),
                CallbackRegistry::new(),
                Some(posted.clone()),
                diagnostics.clone(),
            ),
            diagnostics.clone(),
        );
        Fixture {
            router,
            posted,
            sync,
            diagnostics,
        }
    }

    fn echo_sync(options_json: &str) -> Result<String, TransportError> {
        Ok(SyncReply::ok(Some(serde_json::from_str(options_json).unwrap())).to_json())
    }

    fn recorder() -> (ResponseHandler, Arc<Mutex<Vec<CallResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        (
            ResponseHandler::new(move |r| sink.lock().unwrap().push(r)),
            results,
        )
    }

    fn respond(f: &Fixture, index: usize, data: Value) {
        let envelope = f.posted.envelopes.lock().unwrap()[index].clone();
        f.router
            .async_channel()
            .resolve_response(ResponseEnvelope::success(
                envelope.callback_id,
                envelope.plugin_id,
                envelope.method_name,
                Some(data),
            ));
    }

    #[test]
    fn test_async_default_path() {
        let f = fixture(BridgeConfig::default(), echo_sync);
        let (handler, results) = recorder();
        let id = f.router.route("Camera", "pick", json!({}), Some(handler));

        assert!(!id.is_sentinel());
        assert_eq!(f.sync.calls.load(Ordering::SeqCst), 0);
        respond(&f, 0, json!("photo"));
        assert_eq!(results.lock().unwrap()[0].as_ref().unwrap(), &json!("photo"));
    }

    #[test]
    fn test_cache_hit_skips_dispatch() {
        let config = BridgeConfig::default().cache_method("Storage", "get", 10_000);
        let f = fixture(config, echo_sync);

        let (first, first_results) = recorder();
        f.router.route("Storage", "get", json!({"key": "token"}), Some(first));
        respond(&f, 0, json!("abc"));

        let (second, second_results) = recorder();
        let id = f.router.route("Storage", "get", json!({"key": "token"}), Some(second));

        assert!(id.is_sentinel());
        assert_eq!(f.posted.envelopes.lock().unwrap().len(), 1);
        assert_eq!(
            first_results.lock().unwrap()[0],
            second_results.lock().unwrap()[0]
        );
    }

    #[test]
    fn test_cache_is_keyed_by_arguments() {
        let config = BridgeConfig::default().cache_method("Storage", "get", 10_000);
        let f = fixture(config, echo_sync);

        let (handler, _) = recorder();
        f.router.route("Storage", "get", json!({"key": "a"}), Some(handler.clone()));
        respond(&f, 0, json!(1));
        f.router.route("Storage", "get", json!({"key": "b"}), Some(handler));

        assert_eq!(f.posted.envelopes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let config = BridgeConfig::default().cache_method("Storage", "get", 10_000);
        let f = fixture(config, echo_sync);

        let (handler, _) = recorder();
        f.router.route("Storage", "get", json!({}), Some(handler.clone()));
        let envelope = f.posted.envelopes.lock().unwrap()[0].clone();
        f.router.async_channel().resolve_response(ResponseEnvelope::failure(
            envelope.callback_id,
            "Storage",
            "get",
            ErrorPayload::new("locked"),
        ));

        assert!(f.router.cache().is_empty());
    }

    #[test]
    fn test_write_invalidates_before_and_after() {
        let config = BridgeConfig::default()
            .cache_method("Preferences", "get", 10_000)
            .write_method("Preferences", "set");
        let f = fixture(config, echo_sync);

        let (handler, _) = recorder();
        f.router.route("Preferences", "get", json!({"key": "token"}), Some(handler.clone()));
        respond(&f, 0, json!("old"));
        assert_eq!(f.router.cache().len(), 1);

        f.router.route(
            "Preferences",
            "set",
            json!({"key": "token", "value": "x"}),
            Some(handler.clone()),
        );
        assert!(f.router.cache().is_empty());

        // A read completing while the write is in flight is cleared by the write's success
        f.router.route("Preferences", "get", json!({"key": "token"}), Some(handler));
        respond(&f, 2, json!("racing"));
        assert_eq!(f.router.cache().len(), 1);
        respond(&f, 1, json!({}));
        assert!(f.router.cache().is_empty());
    }

    #[test]
    fn test_sync_path_and_cache() {
        let config = BridgeConfig::default()
            .sync_method("Device", "info")
            .cache_method("Device", "info", 10_000);
        let f = fixture(config, echo_sync);

        let (handler, results) = recorder();
        let id = f.router.route("Device", "info", json!({"v": 1}), Some(handler.clone()));
        assert!(id.is_sentinel());
        f.router.route("Device", "info", json!({"v": 1}), Some(handler));

        assert_eq!(f.sync.calls.load(Ordering::SeqCst), 1);
        assert!(f.posted.envelopes.lock().unwrap().is_empty());
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].as_ref().unwrap(), &json!({"v": 1}));
    }

    #[test]
    fn test_sync_requires_handler_and_enable_flag() {
        let config = BridgeConfig::default().sync_all("Device");
        let f = fixture(config.clone(), echo_sync);
        f.router.route("Device", "info", json!({}), None);
        assert_eq!(f.sync.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.posted.envelopes.lock().unwrap().len(), 1);

        let f = fixture(config.sync_enabled(false), echo_sync);
        let (handler, _) = recorder();
        f.router.route("Device", "info", json!({}), Some(handler));
        assert_eq!(f.sync.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sync_channel_failure_falls_back_once() {
        let config = BridgeConfig::default().sync_all("Device");
        let f = fixture(config, |_| Err(TransportError::Send("gone".to_string())));

        let (handler, results) = recorder();
        let id = f.router.route("Device", "info", json!({}), Some(handler));

        assert!(!id.is_sentinel());
        assert_eq!(f.sync.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.posted.envelopes.lock().unwrap().len(), 1);
        assert!(matches!(
            f.diagnostics.events()[0],
            Diagnostic::SyncFallback { .. }
        ));

        respond(&f, 0, json!("via async"));
        assert_eq!(results.lock().unwrap()[0].as_ref().unwrap(), &json!("via async"));
    }

    #[test]
    fn test_malformed_sync_reply_falls_back() {
        let config = BridgeConfig::default().sync_all("Device");
        let f = fixture(config, |_| Ok("not json".to_string()));
        let (handler, _) = recorder();
        f.router.route("Device", "info", json!({}), Some(handler));
        assert_eq!(f.posted.envelopes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sync_plugin_error_is_surfaced() {
        let config = BridgeConfig::default().sync_all("Device");
        let f = fixture(config, |_| {
            Ok(SyncReply::err(ErrorPayload::new("battery unavailable")).to_json())
        });

        let (handler, results) = recorder();
        f.router.route("Device", "battery", json!({}), Some(handler));

        assert!(f.posted.envelopes.lock().unwrap().is_empty());
        let results = results.lock().unwrap();
        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Plugin);
        assert_eq!(err.message, "battery unavailable");
    }

    #[test]
    fn test_set_config_clears_cache() {
        let config = BridgeConfig::default().cache_method("Storage", "get", 10_000);
        let f = fixture(config.clone(), echo_sync);
        let (handler, _) = recorder();
        f.router.route("Storage", "get", json!({}), Some(handler));
        respond(&f, 0, json!(1));
        assert_eq!(f.router.cache().len(), 1);

        f.router.set_config(config.sync_timeout(Duration::from_millis(5)));
        assert!(f.router.cache().is_empty());
        assert_eq!(f.router.sync_channel().timeout(), Duration::from_millis(5));
    }

    #[test]
    fn test_async_failure_without_handler_is_diagnosed() {
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let router = CallRouter::new(
            BridgeConfig::default(),
            ResultCache::default(),
            SyncChannel::new(None, Duration::from_secs(1)),
            AsyncChannel::new(CallbackRegistry::new(), None, diagnostics.clone()),
            diagnostics.clone(),
        );

        router.route("App", "exit", json!({}), None);
        assert!(matches!(
            &diagnostics.events()[0],
            Diagnostic::UnhandledFailure { error, .. } if error.kind == ErrorKind::TransportUnavailable
        ));

        let (handler, results) = recorder();
        router.route("App", "exit", json!({}), Some(handler));
        assert_eq!(
            results.lock().unwrap()[0].as_ref().unwrap_err().kind,
            ErrorKind::TransportUnavailable
        );
    }
}
