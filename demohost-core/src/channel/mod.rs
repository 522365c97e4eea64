//! Demo channels.
//!
//! A channel is one demo's `{init, render, surface}` triple. `init` runs once and
//! yields the framebuffer offset; a channel whose init fails is excluded for the rest
//! of the session and never rendered again.

use std::num::NonZeroU32;

use wasmtime::Store;

use crate::abi::{DemoEntrypoints, rgba_len};
use crate::memory::{MemoryBridge, checked_range};
use crate::surface::{Surface, SurfaceError};

/// Static description of a demo: its export prefix and surface size.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, width: NonZeroU32, height: NonZeroU32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
        }
    }

    /// Size of the RGBA8 framebuffer in bytes, or `None` if no wasm32 guest could hold it.
    pub fn buffer_len(&self) -> Option<u64> {
        rgba_len(self.width.get(), self.height.get())
    }
}

/// Why a channel was excluded.
#[derive(Clone, Debug, PartialEq)]
pub enum Exclusion {
    /// `<name>_init` returned 0.
    InitReturnedNull,
    /// `<name>_init` trapped.
    InitTrapped(String),
    /// The returned buffer does not fit in linear memory.
    BufferOutOfBounds { offset: u32, len: u64, memory: usize },
    /// `<name>_render` trapped.
    RenderTrapped(String),
    /// The framebuffer could no longer be read.
    Unreadable(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelState {
    /// Not initialized yet.
    Pending,
    Alive { offset: NonZeroU32 },
    Excluded(Exclusion),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel `{name}` is excluded: {reason:?}")]
    Excluded { name: String, reason: Exclusion },
    #[error("channel `{name}` was already initialized")]
    AlreadyInitialized { name: String },
    #[error("channel `{name}` is not initialized")]
    NotInitialized { name: String },
    #[error("channel `{name}` failed to present: {source}")]
    Present {
        name: String,
        #[source]
        source: SurfaceError,
    },
}

/// A demo bound to the live module and its surface.
pub struct DemoChannel {
    spec: ChannelSpec,
    entry: DemoEntrypoints,
    surface: Box<dyn Surface>,
    state: ChannelState,
}

impl DemoChannel {
    pub fn new(spec: ChannelSpec, entry: DemoEntrypoints, surface: Box<dyn Surface>) -> Self {
        Self {
            spec,
            entry,
            surface,
            state: ChannelState::Pending,
        }
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn surface(&self) -> &dyn Surface {
        self.surface.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, ChannelState::Alive { .. })
    }

    pub fn pixel_offset(&self) -> Option<NonZeroU32> {
        match self.state {
            ChannelState::Alive { offset } => Some(offset),
            _ => None,
        }
    }

    fn exclude(&mut self, reason: Exclusion) -> ChannelError {
        tracing::warn!(channel = %self.spec.name, ?reason, "channel excluded");
        self.state = ChannelState::Excluded(reason.clone());
        ChannelError::Excluded {
            name: self.spec.name.clone(),
            reason,
        }
    }

    /// Ask the guest to allocate this channel's framebuffer.
    ///
    /// Runs at most once. Any failure excludes the channel permanently.
    pub fn init(
        &mut self,
        store: &mut Store<()>,
        memory: &mut MemoryBridge,
    ) -> Result<NonZeroU32, ChannelError> {
        if self.state != ChannelState::Pending {
            return Err(ChannelError::AlreadyInitialized {
                name: self.spec.name.clone(),
            });
        }

        let (w, h) = (self.spec.width.get(), self.spec.height.get());
        let raw = match self.entry.init.call(&mut *store, (w, h)) {
            Ok(ptr) => ptr,
            Err(e) => return Err(self.exclude(Exclusion::InitTrapped(format!("{e:#}")))),
        };

        let Some(offset) = NonZeroU32::new(raw) else {
            return Err(self.exclude(Exclusion::InitReturnedNull));
        };

        let size = memory.size(store);
        // An oversized spec can never fit, whatever the offset.
        let len = self.spec.buffer_len().unwrap_or(u64::MAX);
        if checked_range(offset.get() as u64, len, size).is_err() {
            return Err(self.exclude(Exclusion::BufferOutOfBounds {
                offset: offset.get(),
                len,
                memory: size,
            }));
        }
        memory.observe(store);

        tracing::info!(channel = %self.spec.name, pixels_at = offset.get(), "channel initialized");
        self.state = ChannelState::Alive { offset };
        Ok(offset)
    }

    fn alive_offset(&self) -> Result<NonZeroU32, ChannelError> {
        match &self.state {
            ChannelState::Alive { offset } => Ok(*offset),
            ChannelState::Pending => Err(ChannelError::NotInitialized {
                name: self.spec.name.clone(),
            }),
            ChannelState::Excluded(reason) => Err(ChannelError::Excluded {
                name: self.spec.name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Advance the demo by `dt_ms` milliseconds. A trap excludes the channel.
    pub fn render(&mut self, store: &mut Store<()>, dt_ms: f64) -> Result<(), ChannelError> {
        self.alive_offset()?;
        if let Err(e) = self.entry.render.call(&mut *store, dt_ms) {
            return Err(self.exclude(Exclusion::RenderTrapped(format!("{e:#}"))));
        }
        Ok(())
    }

    /// Derive a fresh view of the framebuffer and hand it to the surface.
    ///
    /// An unreadable framebuffer excludes the channel; a surface error does not.
    pub fn present(
        &mut self,
        store: &Store<()>,
        memory: &mut MemoryBridge,
    ) -> Result<(), ChannelError> {
        let offset = self.alive_offset()?;
        let view = match memory.pixels(
            store,
            offset.get(),
            self.spec.width.get(),
            self.spec.height.get(),
        ) {
            Ok(view) => view,
            Err(e) => return Err(self.exclude(Exclusion::Unreadable(e.to_string()))),
        };

        self.surface
            .present(&view)
            .map_err(|source| ChannelError::Present {
                name: self.spec.name.clone(),
                source,
            })
    }
}

impl std::fmt::Debug for DemoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoChannel")
            .field("spec", &self.spec)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ExportContract;
    use crate::surface::FramebufferSurface;
    use crate::testing::{load_wat, nz};

    const GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $frame (mut i32) (i32.const 0))
            (func (export "good_init") (param i32 i32) (result i32) (i32.const 256))
            (func (export "good_render") (param f64)
                (global.set $frame (i32.add (global.get $frame) (i32.const 1)))
                (i32.store (i32.const 256) (global.get $frame)))
            (func (export "null_init") (param i32 i32) (result i32) (i32.const 0))
            (func (export "null_render") (param f64) unreachable)
            (func (export "huge_init") (param i32 i32) (result i32) (i32.const 65000))
            (func (export "huge_render") (param f64))
            (func (export "trap_init") (param i32 i32) (result i32) unreachable)
            (func (export "trap_render") (param f64))
            (func (export "crash_init") (param i32 i32) (result i32) (i32.const 512))
            (func (export "crash_render") (param f64) unreachable))
    "#;

    fn channels() -> (crate::loader::LoadedModule, Vec<DemoChannel>) {
        let names = ["good", "null", "huge", "trap", "crash"];
        let mut loaded = load_wat(GUEST, &ExportContract::new(names));
        let channels = loaded
            .entrypoints
            .drain(..)
            .map(|entry| {
                let spec = ChannelSpec::new(entry.demo.clone(), nz(2), nz(2));
                let surface = FramebufferSurface::new(2, 2).unwrap();
                DemoChannel::new(spec, entry, Box::new(surface))
            })
            .collect();
        (loaded, channels)
    }

    #[test]
    fn init_success_sets_offset_once() {
        let (mut loaded, mut chans) = channels();
        let good = &mut chans[0];
        let offset = good.init(&mut loaded.store, &mut loaded.memory).unwrap();
        assert_eq!(offset.get(), 256);
        assert_eq!(good.pixel_offset(), Some(offset));
        assert!(matches!(
            good.init(&mut loaded.store, &mut loaded.memory),
            Err(ChannelError::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn null_pointer_excludes_channel_and_blocks_render() {
        let (mut loaded, mut chans) = channels();
        let null = &mut chans[1];
        assert!(null.init(&mut loaded.store, &mut loaded.memory).is_err());
        assert_eq!(
            null.state(),
            &ChannelState::Excluded(Exclusion::InitReturnedNull)
        );
        // Render would trap (`unreachable`) if it were ever called.
        assert!(matches!(
            null.render(&mut loaded.store, 16.0),
            Err(ChannelError::Excluded { .. })
        ));
    }

    #[test]
    fn out_of_bounds_buffer_is_excluded() {
        let (mut loaded, mut chans) = channels();
        let huge = &mut chans[2];
        huge.spec = ChannelSpec::new("huge", nz(64), nz(64));
        assert!(huge.init(&mut loaded.store, &mut loaded.memory).is_err());
        assert!(matches!(
            huge.state(),
            ChannelState::Excluded(Exclusion::BufferOutOfBounds { offset: 65000, .. })
        ));
    }

    #[test]
    fn unaddressable_size_is_excluded_without_overflow() {
        let (mut loaded, mut chans) = channels();
        let good = &mut chans[0];
        good.spec = ChannelSpec::new("good", nz(1 << 31), nz(1 << 31));
        assert_eq!(good.spec().buffer_len(), None);
        assert!(good.init(&mut loaded.store, &mut loaded.memory).is_err());
        assert!(matches!(
            good.state(),
            ChannelState::Excluded(Exclusion::BufferOutOfBounds { offset: 256, len: u64::MAX, .. })
        ));
    }

    #[test]
    fn trapping_init_is_excluded() {
        let (mut loaded, mut chans) = channels();
        let trap = &mut chans[3];
        assert!(trap.init(&mut loaded.store, &mut loaded.memory).is_err());
        assert!(matches!(
            trap.state(),
            ChannelState::Excluded(Exclusion::InitTrapped(_))
        ));
    }

    #[test]
    fn render_then_present_copies_latest_frame() {
        let (mut loaded, mut chans) = channels();
        let good = &mut chans[0];
        good.init(&mut loaded.store, &mut loaded.memory).unwrap();

        good.render(&mut loaded.store, 16.0).unwrap();
        good.render(&mut loaded.store, 16.0).unwrap();
        good.present(&loaded.store, &mut loaded.memory).unwrap();

        let view = loaded
            .memory
            .pixels(&loaded.store, 256, 2, 2)
            .unwrap();
        assert_eq!(view.pixel(0, 0), Some(2u32.to_le_bytes()));
    }

    #[test]
    fn render_trap_excludes_channel() {
        let (mut loaded, mut chans) = channels();
        let crash = &mut chans[4];
        crash.init(&mut loaded.store, &mut loaded.memory).unwrap();
        assert!(crash.render(&mut loaded.store, 16.0).is_err());
        assert!(!crash.is_alive());
        assert!(matches!(
            crash.present(&loaded.store, &mut loaded.memory),
            Err(ChannelError::Excluded { .. })
        ));
    }
}
