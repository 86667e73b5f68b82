//! Plugin trait and the per-invocation call handle
//!
//! A [`PluginCall`] is handed to the plugin for every invocation. The plugin
//! completes it exactly once (or several times when kept alive) from any
//! thread; the completion is routed back by the [`ResponseSink`].

use callbridge_api::{CallId, ErrorKind, ErrorPayload};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives plugin completions
pub trait ResponseSink: Send + Sync {
    /// Deliver one completion of `call`
    fn send_response(&self, call: &PluginCall, result: Result<Option<Value>, ErrorPayload>);
}

/// A native operation exposed to the script runtime
pub trait Plugin: Send + Sync {
    /// Name used for routing (the `pluginId` of a call)
    fn name(&self) -> &str;

    /// Whether the plugin exposes `method`
    fn has_method(&self, method: &str) -> bool;

    /// Names of all exposed methods
    fn methods(&self) -> Vec<String>;

    /// Execute `call.method_name()`. Completion may happen later on another thread.
    fn invoke(&self, call: PluginCall);
}

/// Handle to one in-flight plugin invocation
#[derive(Clone)]
pub struct PluginCall {
    inner: Arc<CallInner>,
}

struct CallInner {
    callback_id: CallId,
    plugin_id: String,
    method_name: String,
    options: Value,
    keep_alive: AtomicBool,
    completed: AtomicBool,
    sink: Arc<dyn ResponseSink>,
}

impl PluginCall {
    /// Create a new call routed to `sink`
    pub fn new(
        callback_id: CallId,
        plugin_id: impl Into<String>,
        method_name: impl Into<String>,
        options: Value,
        sink: Arc<dyn ResponseSink>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                callback_id,
                plugin_id: plugin_id.into(),
                method_name: method_name.into(),
                options,
                keep_alive: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                sink,
            }),
        }
    }

    pub fn callback_id(&self) -> &CallId {
        &self.inner.callback_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn method_name(&self) -> &str {
        &self.inner.method_name
    }

    /// Call arguments
    pub fn options(&self) -> &Value {
        &self.inner.options
    }

    /// String argument `key`, if present
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inner.options.get(key).and_then(Value::as_str)
    }

    /// Keep the call alive so it can be completed more than once (listeners)
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.inner.keep_alive.store(keep_alive, Ordering::Release);
    }

    pub fn is_kept_alive(&self) -> bool {
        self.inner.keep_alive.load(Ordering::Acquire)
    }

    /// Whether a one-shot completion has already been delivered
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Complete successfully with `data`
    pub fn resolve(&self, data: Value) {
        self.complete(Ok(Some(data)));
    }

    /// Complete successfully without data
    pub fn resolve_empty(&self) {
        self.complete(Ok(None));
    }

    /// Complete with a plugin error message
    pub fn reject(&self, message: impl Into<String>) {
        self.complete(Err(ErrorPayload::new(message)));
    }

    /// Complete with a structured error
    pub fn reject_with(&self, error: ErrorPayload) {
        self.complete(Err(error));
    }

    /// Complete with a bridge error kind
    pub fn reject_kind(&self, kind: ErrorKind, message: impl Into<String>) {
        self.complete(Err(ErrorPayload::of_kind(kind, message)));
    }

    /// Release a kept-alive call; later completions are ignored
    pub fn release(&self) {
        self.inner.keep_alive.store(false, Ordering::Release);
        self.inner.completed.store(true, Ordering::Release);
    }

    fn complete(&self, result: Result<Option<Value>, ErrorPayload>) {
        if !self.is_kept_alive() && self.inner.completed.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                plugin = %self.inner.plugin_id,
                method = %self.inner.method_name,
                callback_id = %self.inner.callback_id,
                "Plugin call completed more than once, ignoring"
            );
            return;
        }
        self.inner.sink.send_response(self, result);
    }
}

impl std::fmt::Debug for PluginCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCall")
            .field("callback_id", &self.inner.callback_id)
            .field("plugin_id", &self.inner.plugin_id)
            .field("method_name", &self.inner.method_name)
            .finish_non_exhaustive()
    }
}

type MethodFn = Arc<dyn Fn(PluginCall) + Send + Sync>;

/// A plugin assembled from closures, one per method
///
/// # Example
///
/// ```rust
/// use callbridge_host::FnPlugin;
///
/// let echo = FnPlugin::new("Echo").method("echo", |call| {
///     let options = call.options().clone();
///     call.resolve(options);
/// });
/// ```
#[derive(Clone)]
pub struct FnPlugin {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl FnPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(PluginCall) + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }
}

impl Plugin for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn invoke(&self, call: PluginCall) {
        match self.methods.get(call.method_name()) {
            Some(f) => f(call),
            None => {
                let message = format!(
                    "Method \"{}\" not found on plugin \"{}\"",
                    call.method_name(),
                    self.name
                );
                call.reject_kind(ErrorKind::MethodNotFound, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        responses: Mutex<Vec<Result<Option<Value>, ErrorPayload>>>,
    }

    impl ResponseSink for RecordingSink {
        fn send_response(&self, _call: &PluginCall, result: Result<Option<Value>, ErrorPayload>) {
            self.responses.lock().unwrap().push(result);
        }
    }

    fn call(sink: Arc<RecordingSink>) -> PluginCall {
        PluginCall::new(CallId::from(1), "Echo", "echo", json!({"v": 1}), sink)
    }

    #[test]
    fn test_one_shot_call_completes_once() {
        let sink = Arc::new(RecordingSink::default());
        let call = call(sink.clone());

        call.resolve(json!(1));
        call.resolve(json!(2));
        call.reject("late");

        let responses = sink.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0], Ok(Some(json!(1))));
    }

    #[test]
    fn test_kept_alive_call_completes_many_times() {
        let sink = Arc::new(RecordingSink::default());
        let call = call(sink.clone());
        call.set_keep_alive(true);

        call.resolve(json!(1));
        call.resolve(json!(2));
        call.release();
        call.resolve(json!(3));

        assert_eq!(sink.responses.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_fn_plugin_dispatch() {
        let plugin = FnPlugin::new("Echo").method("echo", |call| {
            let options = call.options().clone();
            call.resolve(options);
        });
        assert!(plugin.has_method("echo"));
        assert!(!plugin.has_method("missing"));

        let sink = Arc::new(RecordingSink::default());
        plugin.invoke(call(sink.clone()));

        let missing = PluginCall::new(CallId::from(2), "Echo", "missing", json!({}), sink.clone());
        plugin.invoke(missing);

        let responses = sink.responses.lock().unwrap();
        assert_eq!(responses[0], Ok(Some(json!({"v": 1}))));
        assert_eq!(
            responses[1].as_ref().unwrap_err().kind(),
            ErrorKind::MethodNotFound
        );
    }
}
