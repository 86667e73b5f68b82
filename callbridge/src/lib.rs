//! # callbridge: script-to-host call bridge
//!
//! Routes plugin calls from a script runtime to a native host and delivers
//! the results back to per-call response handlers.
//!
//! ## Core Principles
//!
//! - **Caller-agnostic routing**: the same call may complete from cache, over
//!   the blocking sync channel, or over the message-passing async channel
//! - **Identifier correlation**: async responses may arrive in any order
//! - **Exactly once**: a one-shot handler runs at most once; persistent
//!   handlers stay registered until the host says otherwise
//! - **Never crash on the host's behalf**: malformed or orphan responses are
//!   reported to a [`DiagnosticSink`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use callbridge::{Bridge, BridgeConfig, FileProvider, OverrideProvider};
//!
//! let bridge = Bridge::builder()
//!     .provider(FileProvider::default_for_app("my-app"))
//!     .provider(OverrideProvider::new(Some(
//!         BridgeConfig::default()
//!             .cache_method("Device", "getInfo", 60_000)
//!             .sync_method("Device", "getInfo"),
//!     )))
//!     .message_transport(host_messages)
//!     .sync_transport(host_sync)
//!     .build();
//!
//! let info = bridge.call("Device", "getInfo", serde_json::json!({})).await?;
//!
//! // Responses posted back by the host
//! bridge.resolve_response_json(&response_json);
//! ```

pub mod bridge;
pub mod cache;
pub mod call;
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod registry;
pub mod router;
pub mod tracing_support;
pub mod watcher;

// Re-export tracing itself (required for #[instrument] macro)
#[cfg(feature = "tracing")]
pub use tracing_support::tracing;

#[cfg(feature = "tracing")]
pub use tracing_support::{
    debug, error, info, init_subscriber, init_subscriber_with_config, instrument, trace, warn,
    TracingConfig, TracingFormat,
};

pub use bridge::{Bridge, BridgeBuilder};
pub use cache::{ResultCache, DEFAULT_MAX_ENTRIES};
pub use call::{Call, CallMode, IdGenerator, ResponseHandler};
pub use channel::{
    AsyncChannel, Channel, MessageTransport, Outcome, SyncChannel, SyncFailure, SyncTransport,
};
pub use config::{
    load_config, BridgeConfig, ConfigError, ConfigProvider, FileProvider, InjectedProvider,
    LoadedConfig, OverrideProvider, SyncMethods, CONFIG_FILE_NAME,
};
pub use diagnostics::{Diagnostic, DiagnosticSink, MemoryDiagnostics, TracingDiagnostics};
pub use error::{BridgeError, CallResult, TransportError};
pub use registry::{CallbackRegistry, PendingCallback};
pub use router::CallRouter;
pub use watcher::{ConfigWatcher, WatcherConfig, WatcherError};

pub use callbridge_api::{
    CallEnvelope, CallId, ErrorKind, ErrorPayload, ResponseEnvelope, SyncReply,
};
