//! demohost-core: a headless host that loads one WebAssembly module and drives
//! several visual demos sharing its linear memory.
//!
//! Guest contract, per configured demo `<name>`:
//! - `<name>_init(width: u32, height: u32) -> u32`: allocate an RGBA8 framebuffer and
//!   return its offset in linear memory (0 means failure).
//! - `<name>_render(dt_ms: f64)`: advance the demo and rewrite the framebuffer.
//!
//! The module must also export `memory`. Host imports are resolved from an ordered
//! list of namespaces (see [`env`]); anything left unresolved becomes a logging stub.
//!
//! Typical flow:
//! 1. Build an [`EnvironmentResolver`] and a [`ModuleLoader`].
//! 2. Build a [`FramePump`] from channel bindings and a [`FrameScheduler`].
//! 3. `pump.start(loader.load(source, &pump.contract()).await)`.
//! 4. `pump.run(&stop)`.

pub mod abi;
pub mod channel;
pub mod clock;
pub mod config;
pub mod env;
pub mod loader;
pub mod memory;
pub mod pump;
pub mod runtime;
pub mod surface;

#[cfg(test)]
mod testing;

pub use abi::{DemoEntrypoints, ExportContract};
pub use channel::{ChannelSpec, ChannelState, DemoChannel, Exclusion};
pub use clock::{FrameScheduler, IntervalScheduler, SteppedScheduler, StopSignal};
pub use config::{ConfigError, HarnessConfig};
pub use env::{EnvironmentResolver, ImportNamespace, UnresolvedCall, UnresolvedCalls};
pub use loader::{LoadError, LoadedModule, ModuleLoader, ModuleSource};
pub use memory::{MemoryBridge, MemoryError, PixelView};
pub use pump::{ChannelBinding, FramePump, PumpError, PumpState, TickReport};
pub use runtime::libm_namespace;
pub use surface::{FramebufferSurface, PngSnapshotSurface, Surface, SurfaceError};
