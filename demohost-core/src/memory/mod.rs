//! Zero-copy access to the guest's linear memory.
//!
//! The guest may grow its memory at any time it runs, and growth can move the backing
//! allocation. Offsets stay valid; slices do not. Every view handed out here borrows
//! the store, so it cannot be held across a guest call. [`MemoryBridge::observe`]
//! tracks a generation counter that bumps whenever the memory size changes.

use std::borrow::Cow;
use std::ops::Range;

use wasmtime::{Memory, Store};

use crate::abi::{BYTES_PER_PIXEL, rgba_len};

/// WASM page size in bytes.
pub const PAGE_SIZE: u64 = 65536;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("range {offset}+{len} is outside linear memory of {size} bytes")]
    OutOfBounds { offset: u64, len: u64, size: usize },
    #[error("failed to grow linear memory by {pages} pages: {reason}")]
    Grow { pages: u64, reason: String },
}

/// Resolve `offset..offset+len` against a memory of `size` bytes.
pub fn checked_range(offset: u64, len: u64, size: usize) -> Result<Range<usize>, MemoryError> {
    let oob = || MemoryError::OutOfBounds { offset, len, size };
    let end = offset.checked_add(len).ok_or_else(oob)?;
    if end > size as u64 {
        return Err(oob());
    }
    Ok(offset as usize..end as usize)
}

/// Decode guest text, replacing invalid UTF-8 sequences.
pub fn utf8_lossy(data: &[u8], offset: u32, len: u32) -> Result<Cow<'_, str>, MemoryError> {
    let range = checked_range(offset as u64, len as u64, data.len())?;
    Ok(String::from_utf8_lossy(&data[range]))
}

/// The guest's exported memory plus growth tracking.
#[derive(Debug)]
pub struct MemoryBridge {
    memory: Memory,
    generation: u64,
    last_size: usize,
}

impl MemoryBridge {
    pub fn new(memory: Memory, store: &Store<()>) -> Self {
        Self {
            memory,
            generation: 0,
            last_size: memory.data_size(store),
        }
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Current size of linear memory in bytes.
    pub fn size(&self, store: &Store<()>) -> usize {
        self.memory.data_size(store)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compare the current size with the last one seen; bump the generation on change.
    pub fn observe(&mut self, store: &Store<()>) -> u64 {
        let size = self.memory.data_size(store);
        if size != self.last_size {
            tracing::debug!(
                from = self.last_size,
                to = size,
                generation = self.generation + 1,
                "linear memory resized"
            );
            self.last_size = size;
            self.generation += 1;
        }
        self.generation
    }

    /// Grow memory from the host side. Returns the previous size in pages.
    pub fn grow(&mut self, store: &mut Store<()>, pages: u64) -> Result<u64, MemoryError> {
        let previous = self
            .memory
            .grow(&mut *store, pages)
            .map_err(|e| MemoryError::Grow {
                pages,
                reason: format!("{e:#}"),
            })?;
        self.observe(store);
        Ok(previous)
    }

    /// A byte view over the memory's current backing allocation.
    pub fn view<'a>(
        &mut self,
        store: &'a Store<()>,
        offset: u32,
        len: u64,
    ) -> Result<&'a [u8], MemoryError> {
        self.observe(store);
        let data = self.memory.data(store);
        let range = checked_range(offset as u64, len, data.len())?;
        Ok(&data[range])
    }

    /// An RGBA8 view of `width * height` pixels starting at `offset`.
    pub fn pixels<'a>(
        &mut self,
        store: &'a Store<()>,
        offset: u32,
        width: u32,
        height: u32,
    ) -> Result<PixelView<'a>, MemoryError> {
        let len = rgba_len(width, height).unwrap_or(u64::MAX);
        let bytes = self.view(store, offset, len)?;
        Ok(PixelView {
            bytes,
            width,
            height,
            generation: self.generation,
        })
    }

    pub fn read_utf8<'a>(
        &self,
        store: &'a Store<()>,
        offset: u32,
        len: u32,
    ) -> Result<Cow<'a, str>, MemoryError> {
        utf8_lossy(self.memory.data(store), offset, len)
    }
}

/// A borrowed RGBA8 window into linear memory.
#[derive(Clone, Copy, Debug)]
pub struct PixelView<'a> {
    bytes: &'a [u8],
    width: u32,
    height: u32,
    generation: u64,
}

impl<'a> PixelView<'a> {
    /// Wrap a host-side RGBA8 buffer. `bytes` must hold exactly `width * height` pixels.
    pub fn from_rgba(bytes: &'a [u8], width: u32, height: u32) -> Option<Self> {
        let expected = rgba_len(width, height)?;
        (bytes.len() as u64 == expected).then_some(Self {
            bytes,
            width,
            height,
            generation: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Memory generation the view was derived under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL as usize
    }

    pub fn row(&self, y: u32) -> Option<&'a [u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride();
        self.bytes.get(start..start + self.stride())
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let i = x as usize * BYTES_PER_PIXEL as usize;
        row.get(i..i + 4).and_then(|p| p.try_into().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module};

    fn guest(wat: &str) -> (Store<()>, MemoryBridge, Instance) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat::parse_str(wat).unwrap()).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        let memory = instance.get_memory(&mut store, "memory").unwrap();
        let bridge = MemoryBridge::new(memory, &store);
        (store, bridge, instance)
    }

    const PAINTER: &str = r#"
        (module
            (memory (export "memory") 1)
            (data (i32.const 1024) "\11\22\33\44\55\66\77\88")
            (func (export "grow") (result i32) (memory.grow (i32.const 2))))
    "#;

    #[test]
    fn checked_range_rejects_overflow_and_out_of_bounds() {
        assert_eq!(checked_range(4, 4, 8).unwrap(), 4..8);
        assert!(checked_range(5, 4, 8).is_err());
        assert!(checked_range(u64::MAX, 2, 8).is_err());
    }

    #[test]
    fn view_reads_current_bytes() {
        let (store, mut bridge, _) = guest(PAINTER);
        assert_eq!(
            bridge.view(&store, 1024, 4).unwrap(),
            &[0x11, 0x22, 0x33, 0x44]
        );
        assert!(bridge.view(&store, PAGE_SIZE as u32 - 2, 4).is_err());
    }

    #[test]
    fn host_growth_bumps_generation_and_keeps_bytes() {
        let (mut store, mut bridge, _) = guest(PAINTER);
        let before = bridge.view(&store, 1024, 8).unwrap().to_vec();
        assert_eq!(bridge.generation(), 0);

        assert_eq!(bridge.grow(&mut store, 3).unwrap(), 1);
        assert_eq!(bridge.generation(), 1);
        assert_eq!(bridge.size(&store), 4 * PAGE_SIZE as usize);

        let after = bridge.view(&store, 1024, 8).unwrap();
        assert_eq!(after, before.as_slice());
    }

    #[test]
    fn oversized_pixel_view_is_out_of_bounds() {
        let (store, mut bridge, _) = guest(PAINTER);
        assert!(matches!(
            bridge.pixels(&store, 1024, u32::MAX, u32::MAX),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn guest_growth_is_observed_on_next_view() {
        let (mut store, mut bridge, instance) = guest(PAINTER);
        let grow = instance
            .get_typed_func::<(), i32>(&mut store, "grow")
            .unwrap();
        assert_eq!(grow.call(&mut store, ()).unwrap(), 1);

        let view = bridge.pixels(&store, 1024, 2, 1).unwrap();
        assert_eq!(view.generation(), 1);
        assert_eq!(view.pixel(1, 0), Some([0x55, 0x66, 0x77, 0x88]));
    }

    #[test]
    fn pixel_view_rows_and_bounds() {
        let data: Vec<u8> = (0u8..24).collect();
        let view = PixelView::from_rgba(&data, 3, 2).unwrap();
        assert_eq!(view.stride(), 12);
        assert_eq!(view.row(1).unwrap()[0], 12);
        assert_eq!(view.pixel(2, 1), Some([20, 21, 22, 23]));
        assert_eq!(view.pixel(3, 0), None);
        assert!(view.row(2).is_none());
        assert!(PixelView::from_rgba(&data, 4, 2).is_none());
        assert!(PixelView::from_rgba(&data, u32::MAX, u32::MAX).is_none());
    }

    #[test]
    fn utf8_lossy_decodes_and_bounds_checks() {
        let data = b"xxhello\xffworld";
        assert_eq!(utf8_lossy(data, 2, 5).unwrap(), "hello");
        assert_eq!(utf8_lossy(data, 2, 6).unwrap(), "hello\u{fffd}");
        assert!(utf8_lossy(data, 10, 10).is_err());
    }
}
