//! Capture capability seam.
//!
//! The pixel-acquisition backend lives outside this crate; autofocus and
//! scanning only need something that yields a frame on demand and accepts
//! exposure/gain hints. Frames are opaque grayscale buffers with enough
//! metadata for a focus metric to walk them.

use anyhow::Result;
use async_trait::async_trait;

/// A single captured frame.
///
/// `data` is row-major grayscale, one byte per pixel regardless of the
/// sensor's native depth; backends with deeper ADCs downshift before
/// handing frames over.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!((width * height) as usize, data.len());
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.width + x) as usize]
    }
}

/// Pull-model capture capability.
///
/// `capture` blocks until a frame is available or the backend's own
/// timeout trips; the driver layer never retries on its behalf.
/// Exposure/gain are fire-and-forget configuration.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Frame>;

    async fn set_exposure_ms(&self, _exposure_ms: f64) -> Result<()> {
        Ok(())
    }

    async fn set_gain(&self, _gain: f64) -> Result<()> {
        Ok(())
    }
}
