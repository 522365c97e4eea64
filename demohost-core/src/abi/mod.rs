//! demohost ABI module
//!
//! This module defines the contract between:
//! - **Host**: `demohost-core` (this crate)
//! - **Guest**: the single loaded WASM module that implements every demo
//!
//! ## High-level model (buffer-based)
//! Each demo asks the guest to allocate an RGBA8 framebuffer in *guest linear memory*
//! and gets back its offset. The guest rewrites that buffer on every render call; the
//! host reads it straight out of linear memory after the call returns.
//!
//! ## Imports (guest -> host)
//! Imported from module `"env"`:
//! - `atan2f(y: f32, x: f32) -> f32`
//! - `cosf(x: f32) -> f32`
//! - `sinf(x: f32) -> f32`
//! - `sqrtf(x: f32) -> f32`
//! - `logWasm(ptr: u32, len: u32)`: UTF-8 text in guest memory
//!
//! Any other function import under `"env"` is bound to a diagnostic stub (see
//! `crate::env`).
//!
//! ## Exports (host -> guest) required
//! - `memory`
//! - `<demo>_init(width: u32, height: u32) -> u32`
//!     - Returns the framebuffer pointer (guest offset), or 0 on failure.
//! - `<demo>_render(dt_ms: f64)`

use wasmtime::{Instance, Store, TypedFunc};

use crate::loader::LoadError;

/// Import module name used by the guest.
pub const IMPORT_MODULE: &str = "env";

/// Name of the exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: u64 = 4;

/// Largest linear memory a wasm32 guest can address (4 GiB).
pub const MAX_BUFFER_BYTES: u64 = 1 << 32;

/// Byte length of a `width` x `height` RGBA8 buffer.
///
/// `None` if the buffer could not fit in a wasm32 guest's memory.
pub fn rgba_len(width: u32, height: u32) -> Option<u64> {
    (width as u64)
        .checked_mul(height as u64)?
        .checked_mul(BYTES_PER_PIXEL)
        .filter(|&len| len <= MAX_BUFFER_BYTES)
}

/// Host import names provided to the guest under [`IMPORT_MODULE`].
pub mod host_imports {
    pub const ATAN2F: &str = "atan2f";
    pub const COSF: &str = "cosf";
    pub const SINF: &str = "sinf";
    pub const SQRTF: &str = "sqrtf";
    pub const LOG_WASM: &str = "logWasm";
}

/// Guest export name for a demo's init entrypoint.
pub fn init_export(demo: &str) -> String {
    format!("{demo}_init")
}

/// Guest export name for a demo's render entrypoint.
pub fn render_export(demo: &str) -> String {
    format!("{demo}_render")
}

/// The set of demos the host expects the guest to implement.
///
/// Order matters: entrypoints are resolved (and later rendered) in this order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExportContract {
    demos: Vec<String>,
}

impl ExportContract {
    pub fn new<I, S>(demos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            demos: demos.into_iter().map(Into::into).collect(),
        }
    }

    pub fn demos(&self) -> &[String] {
        &self.demos
    }

    /// Validate `memory` and resolve every demo's entrypoints, in contract order.
    pub fn resolve(
        &self,
        instance: &Instance,
        store: &mut Store<()>,
    ) -> Result<Vec<DemoEntrypoints>, LoadError> {
        if instance.get_memory(&mut *store, MEMORY_EXPORT).is_none() {
            return Err(LoadError::MissingExport {
                name: MEMORY_EXPORT.to_string(),
            });
        }

        self.demos
            .iter()
            .map(|demo| DemoEntrypoints::resolve(instance, store, demo))
            .collect()
    }
}

/// A demo's entrypoints as typed Wasmtime functions.
///
/// Resolved once after instantiation and called every tick.
#[derive(Clone)]
pub struct DemoEntrypoints {
    pub demo: String,
    pub init: TypedFunc<(u32, u32), u32>,
    pub render: TypedFunc<f64, ()>,
}

impl DemoEntrypoints {
    /// Resolve `<demo>_init` and `<demo>_render` from an instance.
    pub fn resolve(
        instance: &Instance,
        store: &mut Store<()>,
        demo: &str,
    ) -> Result<Self, LoadError> {
        let init = typed_export::<(u32, u32), u32>(instance, store, &init_export(demo))?;
        let render = typed_export::<f64, ()>(instance, store, &render_export(demo))?;

        Ok(Self {
            demo: demo.to_string(),
            init,
            render,
        })
    }
}

impl std::fmt::Debug for DemoEntrypoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoEntrypoints")
            .field("demo", &self.demo)
            .finish_non_exhaustive()
    }
}

fn typed_export<Params, Results>(
    instance: &Instance,
    store: &mut Store<()>,
    name: &str,
) -> Result<TypedFunc<Params, Results>, LoadError>
where
    Params: wasmtime::WasmParams,
    Results: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| LoadError::MissingExport {
            name: name.to_string(),
        })?;

    func.typed::<Params, Results>(&*store)
        .map_err(|e| LoadError::ExportSignature {
            name: name.to_string(),
            reason: format!("{e:#}"),
        })
}
