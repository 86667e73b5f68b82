//! callbridge-api: Shared wire types for the callbridge call bridge
//!
//! This crate defines the protocol between the script runtime and the host.
//! Every envelope is JSON-shaped and travels as a UTF-8 string.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// API version for wasm plugin compatibility checking
pub const API_VERSION: u32 = 1;

/// Version reported by the host's synchronous call primitive
pub const SYNC_VERSION: &str = "1.0.0";

/// Prefix reserved for identifiers of synchronous calls
pub const SYNC_CALL_PREFIX: &str = "sync_";

/// Message type tag for script-side error reports
pub const JS_ERROR_TYPE: &str = "js.error";

/// Message type tag for legacy cordova calls
pub const CORDOVA_TYPE: &str = "cordova";

/// Identifier correlating a call with its response
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Reserved value meaning "no response will be tracked"
    pub const SENTINEL: &'static str = "-1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The fire-and-forget identifier
    pub fn sentinel() -> Self {
        Self(Self::SENTINEL.to_string())
    }

    /// Identifier for the `n`-th synchronous call of a dispatcher
    pub fn sync(n: u64) -> Self {
        Self(format!("{}{}", SYNC_CALL_PREFIX, n))
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == Self::SENTINEL
    }

    /// Whether this identifier belongs to the synchronous identifier space
    pub fn is_sync(&self) -> bool {
        self.0.starts_with(SYNC_CALL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for CallId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Classification of bridge failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Synchronous wait exceeded its budget
    Timeout,
    /// Host has no plugin registered under the requested name
    PluginNotFound,
    /// Plugin exists but does not expose the requested method
    MethodNotFound,
    /// Argument or response JSON could not be parsed
    MalformedPayload,
    /// Neither channel could carry the call
    TransportUnavailable,
    /// Error reported by the plugin itself
    Plugin,
}

impl ErrorKind {
    /// Wire code carried in [`ErrorPayload::code`]
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::TransportUnavailable => "TRANSPORT_UNAVAILABLE",
            Self::Plugin => "PLUGIN_ERROR",
        }
    }

    /// Parse a wire code; unknown codes are plugin-defined
    pub fn from_code(code: &str) -> Self {
        match code {
            "TIMEOUT" => Self::Timeout,
            "PLUGIN_NOT_FOUND" => Self::PluginNotFound,
            "METHOD_NOT_FOUND" => Self::MethodNotFound,
            "MALFORMED_PAYLOAD" => Self::MalformedPayload,
            "TRANSPORT_UNAVAILABLE" => Self::TransportUnavailable,
            _ => Self::Plugin,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Structured error crossing the host/script boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable message
    #[serde(default = "unknown_error")]
    pub message: String,

    /// Error code (bridge kinds use [`ErrorKind::as_code`], plugins may use their own)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Extra data attached by the plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn unknown_error() -> String {
    "Unknown error".to_string()
}

impl ErrorPayload {
    /// Create an error without a code
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            data: None,
        }
    }

    /// Create an error classified as a bridge error kind
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(kind.as_code().to_string()),
            data: None,
        }
    }

    /// Set the error code
    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach extra data
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Bridge classification of this error
    pub fn kind(&self) -> ErrorKind {
        self.code
            .as_deref()
            .map(ErrorKind::from_code)
            .unwrap_or(ErrorKind::Plugin)
    }
}

/// Type of a message posted from the script runtime to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A plugin method invocation
    PluginCall,
    /// An error report from the script runtime
    JsError,
    /// A legacy cordova invocation
    Cordova,
}

impl MessageType {
    /// Classify a posted message by its `type` field
    pub fn of(message: &Value) -> Self {
        match message.get("type").and_then(Value::as_str) {
            Some(JS_ERROR_TYPE) => Self::JsError,
            Some(CORDOVA_TYPE) => Self::Cordova,
            _ => Self::PluginCall,
        }
    }
}

/// Outbound call envelope (script -> host)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    pub callback_id: CallId,
    pub plugin_id: String,
    pub method_name: String,
    #[serde(default = "empty_object")]
    pub options: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl CallEnvelope {
    pub fn new(
        callback_id: CallId,
        plugin_id: impl Into<String>,
        method_name: impl Into<String>,
        options: Value,
    ) -> Self {
        Self {
            callback_id,
            plugin_id: plugin_id.into(),
            method_name: method_name.into(),
            options,
        }
    }
}

/// Inbound response envelope (host -> script)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub callback_id: CallId,
    pub plugin_id: String,
    pub method_name: String,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,

    /// `Some(false)` drops the registry entry even for persistent callbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<bool>,
}

impl ResponseEnvelope {
    /// Create a success response
    pub fn success(
        callback_id: CallId,
        plugin_id: impl Into<String>,
        method_name: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            callback_id,
            plugin_id: plugin_id.into(),
            method_name: method_name.into(),
            success: true,
            data,
            error: None,
            save: None,
        }
    }

    /// Create a failure response
    pub fn failure(
        callback_id: CallId,
        plugin_id: impl Into<String>,
        method_name: impl Into<String>,
        error: ErrorPayload,
    ) -> Self {
        Self {
            callback_id,
            plugin_id: plugin_id.into(),
            method_name: method_name.into(),
            success: false,
            data: None,
            error: Some(error),
            save: None,
        }
    }

    /// Set the `save` flag
    pub fn save(mut self, save: bool) -> Self {
        self.save = Some(save);
        self
    }

    /// Outcome carried by this envelope
    pub fn outcome(&self) -> Result<Value, ErrorPayload> {
        if self.success {
            Ok(self.data.clone().unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .clone()
                .unwrap_or_else(|| ErrorPayload::new(unknown_error())))
        }
    }
}

/// Reply returned by the host's synchronous call primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReply {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl SyncReply {
    /// Create a success reply; missing data becomes an empty object
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.unwrap_or_else(empty_object)),
            error: None,
        }
    }

    /// Create a failure reply
    pub fn err(error: ErrorPayload) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Serialize to the JSON string handed back to the calling thread
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"success":false,"error":{"message":"Unknown error"}}"#.to_string()
        })
    }

    /// Error takes precedence over data
    pub fn into_result(self) -> Result<Value, ErrorPayload> {
        match (self.success, self.error) {
            (_, Some(error)) => Err(error),
            (false, None) => Err(ErrorPayload::new(unknown_error())),
            (true, None) => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Manifest exported by a wasm plugin's `plugin_manifest()` function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Plugin name used for routing
    pub name: String,

    /// Methods the plugin exposes
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Input passed to a wasm plugin's `plugin_invoke()` function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub method: String,
    #[serde(default = "empty_object")]
    pub options: Value,
}
