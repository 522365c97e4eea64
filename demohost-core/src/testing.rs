//! Shared fixtures for unit tests.

use std::io;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use crate::abi::ExportContract;
use crate::env::{EnvironmentResolver, ImportNamespace};
use crate::loader::{LoadedModule, ModuleLoader, compile};
use crate::memory::PixelView;
use crate::runtime::libm_namespace;
use crate::surface::{Surface, SurfaceError};

pub(crate) fn nz(v: u32) -> NonZeroU32 {
    NonZeroU32::new(v).unwrap()
}

pub(crate) fn load_wat_with(
    wat: &str,
    contract: &ExportContract,
    namespaces: Vec<ImportNamespace>,
) -> LoadedModule {
    let loader = ModuleLoader::new(EnvironmentResolver::new(namespaces)).unwrap();
    let module = compile(loader.engine(), wat.as_bytes().to_vec()).unwrap();
    loader.instantiate(&module, contract).unwrap()
}

pub(crate) fn load_wat(wat: &str, contract: &ExportContract) -> LoadedModule {
    load_wat_with(wat, contract, vec![libm_namespace()])
}

/// `env.trace(i32)` appends its argument to `log`.
pub(crate) fn trace_namespace(log: Arc<Mutex<Vec<i32>>>) -> ImportNamespace {
    let mut ns = ImportNamespace::new("trace");
    ns.define("trace", move |linker, module, name| {
        let log = log.clone();
        linker.func_wrap(module, name, move |id: i32| {
            log.lock().unwrap().push(id);
        })?;
        Ok(())
    });
    ns
}

/// A guest implementing one demo per `(name, init_pointer)`.
///
/// `<name>_render` calls `env.trace(index)` and stores `dt` (truncated) as the first
/// pixel word of its buffer.
pub(crate) fn demo_wat(pages: u32, demos: &[(&str, u32)]) -> String {
    let mut funcs = String::new();
    for (index, (name, ptr)) in demos.iter().enumerate() {
        funcs.push_str(&format!(
            r#"
            (func (export "{name}_init") (param i32 i32) (result i32) (i32.const {ptr}))
            (func (export "{name}_render") (param $dt f64)
                (call $trace (i32.const {index}))
                (i32.store (i32.const {ptr}) (i32.trunc_sat_f64_u (local.get $dt))))"#
        ));
    }
    format!(
        r#"(module
            (import "env" "trace" (func $trace (param i32)))
            (memory (export "memory") {pages}){funcs})"#
    )
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Presented {
    pub channel: String,
    pub width: u32,
    pub height: u32,
    pub first_word: u32,
    pub generation: u64,
}

/// Surface that records every presented frame into a shared log.
pub(crate) struct RecordingSurface {
    pub channel: String,
    pub width: u32,
    pub height: u32,
    pub log: Arc<Mutex<Vec<Presented>>>,
}

impl Surface for RecordingSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn present(&mut self, frame: &PixelView<'_>) -> Result<(), SurfaceError> {
        let bytes = frame.as_bytes();
        self.log.lock().unwrap().push(Presented {
            channel: self.channel.clone(),
            width: frame.width(),
            height: frame.height(),
            first_word: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            generation: frame.generation(),
        });
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return everything it logged.
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buf.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
