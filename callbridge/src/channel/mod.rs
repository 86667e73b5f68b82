//! Invocation channels
//!
//! Both channels implement [`Channel`]; the router picks one per call from
//! configuration and availability, never from the caller.
//!
//! - [`SyncChannel`]: blocks the calling thread until the host returns
//! - [`AsyncChannel`]: posts an envelope and resolves later by identifier

mod async_channel;
mod sync_channel;

pub use async_channel::{AsyncChannel, MessageTransport};
pub use sync_channel::{SyncChannel, SyncFailure, SyncTransport};

use crate::call::{Call, ResponseHandler};
use crate::error::{BridgeError, CallResult};
use callbridge_api::CallId;

/// What a channel did with a call
#[derive(Debug)]
pub enum Outcome {
    /// The result is already known
    Completed(CallResult),
    /// The result will be delivered to the registered handler
    Pending(CallId),
}

/// A strategy for carrying a call to the host
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the channel can carry calls right now
    fn is_available(&self) -> bool;

    /// Carry `call`. `Err` means the channel itself failed.
    fn send(&self, call: Call, handler: Option<ResponseHandler>) -> Result<Outcome, BridgeError>;
}
