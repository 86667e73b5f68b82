//! Wasm plugin loader using wasmtime
//!
//! Loads plugins compiled to wasm and exposes them through the [`Plugin`]
//! trait. Guest ABI:
//!
//! - `memory`: exported linear memory
//! - `plugin_alloc(len) -> ptr` / `plugin_dealloc(ptr, len)`
//! - `plugin_manifest() -> i64`: packed ptr/len of the manifest JSON
//! - `plugin_invoke(ptr, len) -> i64`: takes an invoke request JSON,
//!   returns packed ptr/len of a sync-reply-shaped JSON

use crate::plugin::{Plugin, PluginCall};
use callbridge_api::{InvokeRequest, PluginManifest, SyncReply, API_VERSION};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use wasmtime::*;

/// Fuel granted to every guest call
const FUEL_PER_CALL: u64 = 10_000_000;

/// Errors that can occur during plugin loading
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Malformed guest payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// Wasm plugin loader with a shared wasmtime engine
pub struct WasmPluginLoader {
    engine: Engine,
}

/// A loaded wasm plugin
pub struct WasmPlugin {
    manifest: PluginManifest,
    instance: Mutex<PluginInstance>,
}

/// Guest instance that can run invocations
pub struct PluginInstance {
    store: Store<()>,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    invoke_fn: TypedFunc<(i32, i32), i64>,
}

/// Unpack ptr and len from a packed i64
#[inline]
fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

fn call_error(function: &'static str, e: anyhow::Error) -> LoaderError {
    if e.to_string().contains("fuel") {
        LoaderError::FuelExhausted
    } else {
        LoaderError::FunctionCall {
            function,
            source: e,
        }
    }
}

impl WasmPluginLoader {
    /// Create a new loader
    pub fn new() -> Result<Self, LoaderError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine })
    }

    /// Load a plugin from wasm bytes (binary or text format)
    pub fn load(&self, wasm_bytes: &[u8]) -> Result<WasmPlugin, LoaderError> {
        let module =
            Module::new(&self.engine, wasm_bytes).map_err(LoaderError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(FUEL_PER_CALL)
            .map_err(LoaderError::EngineCreation)?;

        // No host imports: plugins are pure request/response
        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LoaderError::FunctionNotFound("memory".to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, "plugin_alloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_alloc".to_string()))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "plugin_dealloc")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_dealloc".to_string()))?;

        let invoke_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, "plugin_invoke")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_invoke".to_string()))?;

        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, "plugin_manifest")
            .map_err(|_| LoaderError::FunctionNotFound("plugin_manifest".to_string()))?;

        let packed = manifest_fn
            .call(&mut store, ())
            .map_err(|e| call_error("plugin_manifest", e))?;
        let (ptr, len) = unpack_ptr_len(packed);

        let manifest_bytes = read_memory(&store, &memory, ptr, len)?;
        let manifest: PluginManifest =
            serde_json::from_slice(&manifest_bytes).map_err(LoaderError::MalformedPayload)?;

        if manifest.api_version != API_VERSION {
            return Err(LoaderError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }

        dealloc_fn
            .call(&mut store, (ptr, len))
            .map_err(|e| call_error("plugin_dealloc", e))?;

        tracing::debug!(plugin = %manifest.name, methods = ?manifest.methods, "Wasm module instantiated");

        Ok(WasmPlugin {
            manifest,
            instance: Mutex::new(PluginInstance {
                store,
                memory,
                alloc_fn,
                dealloc_fn,
                invoke_fn,
            }),
        })
    }
}

impl Default for WasmPluginLoader {
    fn default() -> Self {
        Self::new().expect("Failed to create WasmPluginLoader")
    }
}

/// Copy a guest buffer out of linear memory; `ptr` and `len` are untrusted
fn read_memory(
    store: &Store<()>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, LoaderError> {
    let data = memory.data(store);
    let out_of_bounds = || {
        LoaderError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data.len()
        ))
    };
    let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
    let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(out_of_bounds)?;
    Ok(data[start..end].to_vec())
}

impl PluginInstance {
    /// Run one invocation inside the guest
    pub fn invoke(&mut self, request: &InvokeRequest) -> Result<SyncReply, LoaderError> {
        let request_bytes = serde_json::to_vec(request).map_err(LoaderError::MalformedPayload)?;

        let request_len = request_bytes.len() as i32;
        let request_ptr = self
            .alloc_fn
            .call(&mut self.store, request_len)
            .map_err(|e| call_error("plugin_alloc", e))?;

        self.memory
            .write(&mut self.store, request_ptr as usize, &request_bytes)
            .map_err(|e| LoaderError::MemoryAccess(format!("Failed to write request: {}", e)))?;

        // Reset fuel for every invocation
        self.store
            .set_fuel(FUEL_PER_CALL)
            .map_err(LoaderError::EngineCreation)?;

        let packed = self
            .invoke_fn
            .call(&mut self.store, (request_ptr, request_len))
            .map_err(|e| call_error("plugin_invoke", e))?;
        let (reply_ptr, reply_len) = unpack_ptr_len(packed);

        let reply_bytes = read_memory(&self.store, &self.memory, reply_ptr, reply_len)?;
        let reply: SyncReply =
            serde_json::from_slice(&reply_bytes).map_err(LoaderError::MalformedPayload)?;

        self.dealloc_fn
            .call(&mut self.store, (request_ptr, request_len))
            .ok();
        self.dealloc_fn
            .call(&mut self.store, (reply_ptr, reply_len))
            .ok();

        Ok(reply)
    }
}

impl WasmPlugin {
    /// Manifest declared by the guest
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

impl Plugin for WasmPlugin {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn has_method(&self, method: &str) -> bool {
        self.manifest.methods.iter().any(|m| m == method)
    }

    fn methods(&self) -> Vec<String> {
        self.manifest.methods.clone()
    }

    fn invoke(&self, call: PluginCall) {
        let request = InvokeRequest {
            method: call.method_name().to_string(),
            options: call.options().clone(),
        };
        let result = {
            let mut instance = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
            instance.invoke(&request)
        };

        match result {
            Ok(reply) => match reply.into_result() {
                Ok(data) => call.resolve(data),
                Err(error) => call.reject_with(error),
            },
            Err(e) => call.reject(format!("Plugin execution error: {}", e)),
        }
    }
}
