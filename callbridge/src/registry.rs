//! Callback registry for outstanding asynchronous calls
//!
//! Responses may arrive on a host thread, so the table is behind a mutex.
//! Handlers are always invoked after the lock is released so a handler can
//! route new calls without deadlocking.

use crate::call::ResponseHandler;
use callbridge_api::CallId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A registered response handler awaiting its response
#[derive(Debug, Clone)]
pub struct PendingCallback {
    pub id: CallId,
    pub handler: ResponseHandler,
    /// Listener-style entries survive multiple responses
    pub persistent: bool,
}

impl PendingCallback {
    /// Entry removed after its first response
    pub fn one_shot(id: CallId, handler: ResponseHandler) -> Self {
        Self {
            id,
            handler,
            persistent: false,
        }
    }

    /// Entry kept until explicitly removed
    pub fn persistent(id: CallId, handler: ResponseHandler) -> Self {
        Self {
            id,
            handler,
            persistent: true,
        }
    }
}

/// Thread-safe table of pending callbacks keyed by identifier
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    inner: Arc<Mutex<HashMap<CallId, PendingCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CallId, PendingCallback>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback. A live duplicate is an invariant violation.
    pub fn put(&self, callback: PendingCallback) {
        let id = callback.id.clone();
        if self.lock().insert(id.clone(), callback).is_some() {
            tracing::error!(callback_id = %id, "Duplicate callback identifier, overwriting");
            debug_assert!(false, "duplicate callback identifier {}", id);
        }
    }

    pub fn get(&self, id: &CallId) -> Option<PendingCallback> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &CallId) -> Option<PendingCallback> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.lock().contains_key(id)
    }

    /// Handler for an arriving response.
    ///
    /// One-shot entries are removed; persistent entries stay unless `drop_entry`.
    pub fn take_for_response(&self, id: &CallId, drop_entry: bool) -> Option<ResponseHandler> {
        let mut callbacks = self.lock();
        let persistent = callbacks.get(id)?.persistent;
        if persistent && !drop_entry {
            callbacks.get(id).map(|c| c.handler.clone())
        } else {
            callbacks.remove(id).map(|c| c.handler)
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry (runtime teardown)
    pub fn clear(&self) {
        self.lock().clear();
    }
}
