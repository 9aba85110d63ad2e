//! Captured frame container.
//!
//! A `Frame` is owned by exactly one pipeline iteration:
//! - Produced by the camera read
//! - Borrowed read-only by the detector
//! - Mutated in place by the annotator
//! - Consumed by the JPEG encoder
//!
//! No `Clone` impl: a frame never outlives its iteration.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Instant;

/// Decoded RGB frame plus capture metadata.
pub struct Frame {
    image: RgbImage,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Per-device capture sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Wrap packed RGB24 pixels. Fails when the buffer length does not match
    /// `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("failed to build {}x{} image", width, height))?;
        Ok(Self::from_image(image, sequence))
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB24 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}
