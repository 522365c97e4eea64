//! Presentation surfaces.
//!
//! Each demo is bound to exactly one fixed-size RGBA8 surface. On every tick the pump
//! hands the surface a fresh [`PixelView`] and the surface copies it verbatim.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::abi::rgba_len;
use crate::memory::PixelView;

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error("frame is {got_w}x{got_h} but surface is {want_w}x{want_h}")]
    SizeMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("failed to write snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] png::EncodingError),
    #[error("a {width}x{height} RGBA8 surface is too large")]
    TooLarge { width: u32, height: u32 },
}

/// A fixed-size RGBA8 presentation target.
pub trait Surface: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    /// Copy `frame` onto the surface.
    fn present(&mut self, frame: &PixelView<'_>) -> Result<(), SurfaceError>;
}

fn check_size(surface: &dyn Surface, frame: &PixelView<'_>) -> Result<(), SurfaceError> {
    if frame.width() != surface.width() || frame.height() != surface.height() {
        return Err(SurfaceError::SizeMismatch {
            got_w: frame.width(),
            got_h: frame.height(),
            want_w: surface.width(),
            want_h: surface.height(),
        });
    }
    Ok(())
}

/// Host-owned copy of the last presented frame.
#[derive(Debug, Clone)]
pub struct FramebufferSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    frames: u64,
}

impl FramebufferSurface {
    pub fn new(width: u32, height: u32) -> Result<Self, SurfaceError> {
        let len = rgba_len(width, height)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or(SurfaceError::TooLarge { width, height })?;
        Ok(Self {
            width,
            height,
            pixels: vec![0; len],
            frames: 0,
        })
    }

    /// RGBA8 bytes of the last presented frame (zeroed before the first one).
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Number of frames presented so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Surface for FramebufferSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn present(&mut self, frame: &PixelView<'_>) -> Result<(), SurfaceError> {
        check_size(&*self, frame)?;
        self.pixels.copy_from_slice(frame.as_bytes());
        self.frames += 1;
        Ok(())
    }
}

/// Framebuffer that also writes `<dir>/<name>.png` every `every` frames.
#[derive(Debug)]
pub struct PngSnapshotSurface {
    framebuffer: FramebufferSurface,
    path: PathBuf,
    every: u64,
}

impl PngSnapshotSurface {
    pub fn new(
        dir: &Path,
        name: &str,
        width: u32,
        height: u32,
        every: u32,
    ) -> Result<Self, SurfaceError> {
        Ok(Self {
            framebuffer: FramebufferSurface::new(width, height)?,
            path: dir.join(format!("{name}.png")),
            every: every.max(1) as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn framebuffer(&self) -> &FramebufferSurface {
        &self.framebuffer
    }

    fn write_png(&self) -> Result<(), SurfaceError> {
        let io_err = |source| SurfaceError::Io {
            path: self.path.clone(),
            source,
        };
        let file = File::create(&self.path).map_err(io_err)?;

        let mut encoder = png::Encoder::new(
            BufWriter::new(file),
            self.framebuffer.width,
            self.framebuffer.height,
        );
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(self.framebuffer.pixels())?;
        writer.finish()?;
        Ok(())
    }
}

impl Surface for PngSnapshotSurface {
    fn width(&self) -> u32 {
        self.framebuffer.width
    }

    fn height(&self) -> u32 {
        self.framebuffer.height
    }

    fn present(&mut self, frame: &PixelView<'_>) -> Result<(), SurfaceError> {
        self.framebuffer.present(frame)?;
        if self.framebuffer.frames % self.every == 0 {
            self.write_png()?;
            tracing::debug!(path = %self.path.display(), "wrote snapshot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: u32, height: u32) -> Vec<u8> {
        (0..width * height)
            .flat_map(|i| if i % 2 == 0 { [255, 0, 0, 255] } else { [0, 0, 255, 255] })
            .collect()
    }

    #[test]
    fn framebuffer_copies_frame_verbatim() {
        let data = checker(3, 2);
        let frame = PixelView::from_rgba(&data, 3, 2).unwrap();
        let mut surface = FramebufferSurface::new(3, 2).unwrap();

        surface.present(&frame).unwrap();
        assert_eq!(surface.pixels(), data.as_slice());
        assert_eq!(surface.frames(), 1);
    }

    #[test]
    fn framebuffer_rejects_other_sizes() {
        let data = checker(2, 3);
        let frame = PixelView::from_rgba(&data, 2, 3).unwrap();
        let mut surface = FramebufferSurface::new(3, 2).unwrap();

        assert!(matches!(
            surface.present(&frame),
            Err(SurfaceError::SizeMismatch { .. })
        ));
        assert_eq!(surface.frames(), 0);
    }

    #[test]
    fn unaddressable_surface_is_refused() {
        assert!(matches!(
            FramebufferSurface::new(1 << 31, 1 << 31),
            Err(SurfaceError::TooLarge { .. })
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(PngSnapshotSurface::new(dir.path(), "big", u32::MAX, 2, 1).is_err());
    }

    #[test]
    fn snapshot_surface_writes_decodable_png() {
        let dir = tempfile::tempdir().unwrap();
        let data = checker(4, 4);
        let frame = PixelView::from_rgba(&data, 4, 4).unwrap();
        let mut surface = PngSnapshotSurface::new(dir.path(), "triangle", 4, 4, 2).unwrap();

        surface.present(&frame).unwrap();
        assert!(!surface.path().exists(), "first frame should not be written");
        surface.present(&frame).unwrap();
        assert!(surface.path().exists());

        let decoder = png::Decoder::new(File::open(surface.path()).unwrap());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (4, 4));
        assert_eq!(&buf[..info.buffer_size()], data.as_slice());
    }
}
