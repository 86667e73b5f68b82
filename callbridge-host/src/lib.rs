//! callbridge-host: Host-side dispatch for the callbridge call bridge
//!
//! This crate receives calls from the script runtime, runs the target plugin
//! method and correlates exactly one response back to each tracked call.

pub mod dispatch;
pub mod loader;
pub mod plugin;
pub mod registry;

pub use callbridge_api::{CallId, ErrorKind, ErrorPayload, PluginManifest, SyncReply};
pub use dispatch::{
    HostError, MessageHandler, ResponseTransport, RestoredResultHook, SyncCallSlot,
    DEFAULT_SYNC_TIMEOUT,
};
pub use loader::{LoaderError, PluginInstance, WasmPlugin, WasmPluginLoader};
pub use plugin::{FnPlugin, Plugin, PluginCall, ResponseSink};
pub use registry::PluginRegistry;
