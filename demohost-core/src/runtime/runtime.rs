//! Engine construction.

use wasmtime::{Config, Engine};

use crate::loader::LoadError;

/// Create a Wasmtime engine with a broad set of WebAssembly features enabled.
pub fn new_engine() -> Result<Engine, LoadError> {
    let mut cfg = Config::new();

    cfg.wasm_multi_value(true);
    cfg.wasm_bulk_memory(true);
    cfg.wasm_reference_types(true);
    cfg.wasm_simd(true);
    cfg.wasm_multi_memory(true);
    cfg.wasm_tail_call(true);

    Engine::new(&cfg).map_err(|e| LoadError::Engine(format!("{e:#}")))
}
