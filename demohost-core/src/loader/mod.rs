//! Loader for demohost-core.
//!
//! Responsibilities:
//! - Fetch the module bytes (file or in-memory).
//! - Detect whether the bytes are a `.wasm` binary or `.wat` text; convert WAT to WASM.
//! - Compile on a blocking worker, link against the resolved import environment, and
//!   instantiate.
//! - Validate the export contract (`memory` + every demo's init/render).
//!
//! A load either yields a complete [`LoadedModule`] or fails as a unit.

use std::path::PathBuf;

use wasmtime::{Engine, Instance, Linker, Module, Store};

use crate::abi::{DemoEntrypoints, ExportContract, MEMORY_EXPORT};
use crate::env::EnvironmentResolver;
use crate::memory::MemoryBridge;
use crate::runtime::new_engine;

/// Errors that abort a module load.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to create wasm engine: {0}")]
    Engine(String),
    #[error("failed to fetch module from {path}: {source}")]
    Fetch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The input was empty or otherwise not recognized as WASM/WAT.
    #[error("unrecognized module format (expected wasm or wat)")]
    UnrecognizedFormat,
    #[error("failed to parse WAT: {0}")]
    WatParse(#[from] wat::Error),
    #[error("failed to compile WASM module: {0}")]
    Compile(String),
    #[error("compile worker failed: {0}")]
    Join(String),
    #[error("unsupported import {module}::{name}: {reason}")]
    UnsupportedImport {
        module: String,
        name: String,
        reason: String,
    },
    #[error("failed to define import `{name}`: {reason}")]
    Link { name: String, reason: String },
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),
    #[error("module is missing required export `{name}`")]
    MissingExport { name: String },
    #[error("export `{name}` has the wrong signature: {reason}")]
    ExportSignature { name: String, reason: String },
}

/// What kind of module the loader inferred from the bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DetectedFormat {
    Wasm,
    Wat,
}

/// Result of normalizing (detecting + possibly converting) the input.
#[derive(Clone, Debug)]
pub struct Detected {
    pub format: DetectedFormat,
    /// Always valid WASM bytes (for WASM/WAT inputs).
    pub wasm_bytes: Vec<u8>,
}

/// Detect format and normalize to WASM bytes.
pub fn normalize_to_wasm(bytes: Vec<u8>) -> Result<Detected, LoadError> {
    let format = detect_format(&bytes).ok_or(LoadError::UnrecognizedFormat)?;

    match format {
        DetectedFormat::Wasm => Ok(Detected {
            format,
            wasm_bytes: bytes,
        }),
        DetectedFormat::Wat => Ok(Detected {
            format,
            wasm_bytes: wat::parse_bytes(&bytes)?.into_owned(),
        }),
    }
}

/// Best-effort detection.
///
/// Rules:
/// - If the first 4 bytes are `\0asm`, treat as WASM.
/// - Else, after stripping UTF-8 BOM / leading whitespace, if the first non-ws byte is `(`,
///   treat as WAT (common WAT starts with `(module ...)`).
pub fn detect_format(bytes: &[u8]) -> Option<DetectedFormat> {
    if is_wasm_magic(bytes) {
        return Some(DetectedFormat::Wasm);
    }

    let i = skip_bom_and_leading_ws(bytes);
    if i < bytes.len() && bytes[i] == b'(' {
        return Some(DetectedFormat::Wat);
    }

    None
}

fn is_wasm_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == *b"\0asm"
}

fn skip_bom_and_leading_ws(bytes: &[u8]) -> usize {
    let mut i = 0;

    // UTF-8 BOM: EF BB BF
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        i = 3;
    }

    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            _ => break,
        }
    }

    i
}

/// Where module bytes come from.
#[derive(Clone, Debug)]
pub enum ModuleSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

impl ModuleSource {
    async fn fetch(self) -> Result<Vec<u8>, LoadError> {
        match self {
            ModuleSource::File(path) => tokio::fs::read(&path)
                .await
                .map_err(|source| LoadError::Fetch { path, source }),
            ModuleSource::Bytes(bytes) => Ok(bytes),
        }
    }
}

/// A live instance together with its store, memory and demo entrypoints.
pub struct LoadedModule {
    pub store: Store<()>,
    pub instance: Instance,
    pub memory: MemoryBridge,
    /// One entry per demo, in export-contract order.
    pub entrypoints: Vec<DemoEntrypoints>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("memory", &self.memory)
            .field("entrypoints", &self.entrypoints)
            .finish_non_exhaustive()
    }
}

/// Fetches, compiles and instantiates the demos module.
#[derive(Clone)]
pub struct ModuleLoader {
    engine: Engine,
    resolver: EnvironmentResolver,
}

impl ModuleLoader {
    pub fn new(resolver: EnvironmentResolver) -> Result<Self, LoadError> {
        Ok(Self::with_engine(new_engine()?, resolver))
    }

    pub fn with_engine(engine: Engine, resolver: EnvironmentResolver) -> Self {
        Self { engine, resolver }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn resolver(&self) -> &EnvironmentResolver {
        &self.resolver
    }

    /// Load: fetch -> detect -> (optional) wat->wasm -> compile -> link -> instantiate.
    pub async fn load(
        &self,
        source: ModuleSource,
        contract: &ExportContract,
    ) -> Result<LoadedModule, LoadError> {
        let bytes = source.fetch().await?;
        tracing::debug!(bytes = bytes.len(), "fetched module");

        let engine = self.engine.clone();
        let module = tokio::task::spawn_blocking(move || compile(&engine, bytes))
            .await
            .map_err(|e| LoadError::Join(e.to_string()))??;

        self.instantiate(&module, contract)
    }

    /// Link and instantiate an already compiled module.
    pub fn instantiate(
        &self,
        module: &Module,
        contract: &ExportContract,
    ) -> Result<LoadedModule, LoadError> {
        let mut linker = Linker::new(&self.engine);
        // A guest may import the same name more than once.
        linker.allow_shadowing(true);
        self.resolver.link(&mut linker, module)?;

        let mut store = Store::new(&self.engine, ());
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| LoadError::Instantiate(format!("{e:#}")))?;

        let entrypoints = contract.resolve(&instance, &mut store)?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| LoadError::MissingExport {
                name: MEMORY_EXPORT.to_string(),
            })?;
        let memory = MemoryBridge::new(memory, &store);

        tracing::info!(
            demos = entrypoints.len(),
            memory_bytes = memory.size(&store),
            "module instantiated"
        );

        Ok(LoadedModule {
            store,
            instance,
            memory,
            entrypoints,
        })
    }
}

/// Compile WASM or WAT bytes into a module.
pub fn compile(engine: &Engine, bytes: Vec<u8>) -> Result<Module, LoadError> {
    let Detected { format, wasm_bytes } = normalize_to_wasm(bytes)?;
    tracing::debug!(?format, "compiling module");
    Module::new(engine, &wasm_bytes).map_err(|e| LoadError::Compile(format!("{e:#}")))
}
