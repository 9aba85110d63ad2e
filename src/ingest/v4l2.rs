//! V4L2 frame source.
//!
//! `V4l2Source` reads frames from a local video device (e.g. /dev/video0),
//! or from a synthetic generator when the device path starts with `stub://`.
//!
//! Capture size and rate are *requested* at connect time; drivers may clamp
//! them. The negotiated values are logged and used as-is.

use anyhow::{anyhow, Result};
#[cfg(feature = "ingest-v4l2")]
use anyhow::Context;
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
#[cfg(feature = "ingest-v4l2")]
use std::time::Instant;

#[cfg(feature = "ingest-v4l2")]
use super::normalize::{normalize_to_rgb, PixelFormat};
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug, PartialEq)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0") or "stub://<name>".
    pub device: String,
    /// Requested frame rate.
    pub target_fps: u32,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// End the stream after this many frames. `None` = unbounded.
    pub frame_limit: Option<u64>,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
            frame_limit: None,
        }
    }
}

/// V4L2 frame source.
pub struct V4l2Source {
    backend: V4l2Backend,
    frame_limit: Option<u64>,
    frames_read: u64,
}

enum V4l2Backend {
    Synthetic(SyntheticV4l2Source),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Result<Self> {
        let frame_limit = config.frame_limit;
        let backend = if config.device.starts_with("stub://") {
            V4l2Backend::Synthetic(SyntheticV4l2Source::new(config))
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                V4l2Backend::Device(DeviceV4l2Source::new(config))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                return Err(anyhow!(
                    "device '{}' requires the ingest-v4l2 feature (use stub:// for synthetic frames)",
                    config.device
                ));
            }
        };
        Ok(Self {
            backend,
            frame_limit,
            frames_read: 0,
        })
    }

    /// Open the device and negotiate the capture format.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.connect(),
        }
    }

    /// Blocking read of the next frame.
    ///
    /// `Ok(None)` marks end of stream (frame limit reached); errors are read
    /// failures.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(limit) = self.frame_limit {
            if self.frames_read >= limit {
                return Ok(None);
            }
        }
        let frame = match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.next_frame()?,
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.next_frame()?,
        };
        self.frames_read += 1;
        Ok(Some(frame))
    }

    /// Check if the source is healthy.
    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.is_healthy(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> V4l2Stats {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.stats(),
        }
    }
}

/// Statistics for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Stats {
    pub frames_captured: u64,
    pub device: String,
    /// Negotiated (width, height).
    pub active_size: (u32, u32),
    pub last_error: Option<String>,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticV4l2Source {
    config: V4l2Config,
    connected: bool,
    frame_count: u64,
}

impl SyntheticV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(anyhow!(
                "synthetic device {} has empty size {}x{}",
                self.config.device,
                self.config.width,
                self.config.height
            ));
        }
        self.connected = true;
        log::info!(
            "V4l2Source: connected to {} (synthetic, {}x{})",
            self.config.device,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic device not connected"));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    /// Asphalt-gray background with a dark patch drifting across it.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![0u8; width * height * 3];

        let patch = (width.min(height) / 6).max(1);
        let patch_x = (self.frame_count as usize * 4) % width.max(1);
        let patch_y = height / 2;
        for y in 0..height {
            for x in 0..width {
                let noise = ((x * 7 + y * 13 + self.frame_count as usize) % 16) as u8;
                let in_patch = x >= patch_x
                    && x < patch_x + patch
                    && y >= patch_y
                    && y < patch_y + patch;
                let value = if in_patch { 30 + noise } else { 110 + noise };
                let offset = (y * width + x) * 3;
                pixels[offset] = value;
                pixels[offset + 1] = value;
                pixels[offset + 2] = value;
            }
        }
        pixels
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> V4l2Stats {
        V4l2Stats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
            active_size: (self.config.width, self.config.height),
            last_error: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceV4l2Source {
    config: V4l2Config,
    state: Option<DeviceV4l2State>,
    pixel_format: PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            pixel_format: PixelFormat::Yuyv,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                self.config.device,
                format.fourcc
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?}, requested {}x{}@{}fps)",
            self.config.device,
            self.active_width,
            self.active_height,
            self.pixel_format,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, meta) = state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })?;
        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };

        let (pixels, width, height) = normalize_to_rgb(
            &buf[..used],
            self.active_width,
            self.active_height,
            self.pixel_format,
        )
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::from_rgb(pixels, width, height, self.frame_count)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return self.state.is_some();
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> V4l2Stats {
        V4l2Stats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
            active_size: (self.active_width, self.active_height),
            last_error: self.last_error.clone(),
        }
    }

    fn health_grace(&self) -> std::time::Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        std::time::Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> V4l2Config {
        V4l2Config {
            device: "stub://test".to_string(),
            target_fps: 30,
            width: 64,
            height: 48,
            frame_limit: None,
        }
    }

    #[test]
    fn v4l2_source_produces_frames() -> Result<()> {
        let mut source = V4l2Source::new(stub_config())?;
        source.connect()?;

        let frame = source.next_frame()?.expect("frame");
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.sequence, 1);
        assert!(source.is_healthy());

        Ok(())
    }

    #[test]
    fn v4l2_source_honors_frame_limit() -> Result<()> {
        let mut source = V4l2Source::new(V4l2Config {
            frame_limit: Some(2),
            ..stub_config()
        })?;
        source.connect()?;

        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);

        Ok(())
    }

    #[test]
    fn synthetic_read_before_connect_fails() -> Result<()> {
        let mut source = V4l2Source::new(stub_config())?;
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn synthetic_frames_change_over_time() -> Result<()> {
        let mut source = V4l2Source::new(stub_config())?;
        source.connect()?;
        let first = source.next_frame()?.expect("frame");
        let second = source.next_frame()?.expect("frame");
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }
}
