//! Process-wide camera access.
//!
//! `CameraSlot` owns at most one open `V4l2Source`. The first `acquire()`
//! opens it; later calls reuse it. The open-or-reuse check and every read
//! go through the same mutex, so concurrent pipelines take turns on the
//! device instead of racing it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::v4l2::{V4l2Config, V4l2Source};
use crate::error::PipelineError;
use crate::frame::Frame;

struct SlotInner {
    config: V4l2Config,
    device: Mutex<Option<V4l2Source>>,
    /// Mirrors `device.is_some()` so liveness checks never wait on a read.
    active: AtomicBool,
}

/// Lazily opened singleton camera.
#[derive(Clone)]
pub struct CameraSlot {
    inner: Arc<SlotInner>,
}

impl CameraSlot {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                config,
                device: Mutex::new(None),
                active: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &V4l2Config {
        &self.inner.config
    }

    /// Return a handle to the shared camera, opening the device on first use.
    ///
    /// Fails with `PipelineError::DeviceUnavailable` when the device cannot
    /// be opened. No retry happens here; the next caller tries again.
    pub fn acquire(&self) -> Result<Camera> {
        let mut guard = self
            .inner
            .device
            .lock()
            .map_err(|_| anyhow!("camera lock poisoned"))?;
        if guard.is_none() {
            let source = open_source(&self.inner.config)?;
            *guard = Some(source);
            self.inner.active.store(true, Ordering::SeqCst);
        }
        Ok(Camera {
            inner: self.inner.clone(),
        })
    }

    /// Whether the singleton handle has been created.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Close the device. Called once at shutdown; outstanding `Camera`
    /// handles see end-of-stream on their next read.
    pub fn release(&self) {
        let source = match self.inner.device.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(source) = source {
            let stats = source.stats();
            log::info!(
                "camera {} released after {} frames",
                stats.device,
                stats.frames_captured
            );
            if let Some(err) = stats.last_error {
                log::warn!("camera {} last error: {}", stats.device, err);
            }
        }
    }
}

fn open_source(config: &V4l2Config) -> Result<V4l2Source> {
    let unavailable = |err: anyhow::Error| PipelineError::DeviceUnavailable {
        device: config.device.clone(),
        reason: format!("{:#}", err),
    };
    let mut source = V4l2Source::new(config.clone()).map_err(unavailable)?;
    source.connect().map_err(unavailable)?;
    Ok(source)
}

/// Handle to the open camera held by one pipeline.
#[derive(Clone)]
pub struct Camera {
    inner: Arc<SlotInner>,
}

impl Camera {
    /// Blocking read under the camera lock.
    ///
    /// Returns `None` at end of stream, after `release()`, or when the read
    /// fails; the failure is logged as a `FrameReadFailure`.
    pub fn next_frame(&self) -> Option<Frame> {
        let mut guard = match self.inner.device.lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::warn!("{}", PipelineError::FrameReadFailure("camera lock poisoned".into()));
                return None;
            }
        };
        let source = guard.as_mut()?;
        match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!(
                    "{}",
                    PipelineError::FrameReadFailure(format!("{}: {:#}", self.inner.config.device, err))
                );
                None
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self.inner.device.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|source| source.is_healthy()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_slot(frame_limit: Option<u64>) -> CameraSlot {
        CameraSlot::new(V4l2Config {
            device: "stub://cam".to_string(),
            target_fps: 30,
            width: 32,
            height: 24,
            frame_limit,
        })
    }

    #[test]
    fn acquire_opens_once_and_shares_the_device() -> Result<()> {
        let slot = stub_slot(None);
        assert!(!slot.is_active());

        let a = slot.acquire()?;
        let b = slot.acquire()?;
        assert!(slot.is_active());

        let first = a.next_frame().expect("frame");
        let second = b.next_frame().expect("frame");
        // Same underlying device: sequence numbers continue across handles.
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        Ok(())
    }

    #[test]
    fn acquire_reports_device_unavailable() {
        let slot = CameraSlot::new(V4l2Config {
            device: "stub://broken".to_string(),
            width: 0,
            ..V4l2Config::default()
        });
        let err = match slot.acquire() {
            Ok(_) => panic!("acquire should fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DeviceUnavailable { .. })
        ));
        assert!(!slot.is_active());
    }

    #[test]
    fn release_ends_outstanding_streams() -> Result<()> {
        let slot = stub_slot(None);
        let camera = slot.acquire()?;
        assert!(camera.next_frame().is_some());

        slot.release();
        assert!(!slot.is_active());
        assert!(camera.next_frame().is_none());
        Ok(())
    }

    #[test]
    fn concurrent_acquire_yields_one_device() -> Result<()> {
        let slot = stub_slot(None);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || slot.acquire().map(|cam| cam.next_frame().map(|f| f.sequence)))
            })
            .collect();
        let mut sequences = Vec::new();
        for handle in handles {
            let seq = handle.join().expect("thread")?;
            sequences.push(seq.expect("frame"));
        }
        sequences.sort();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        Ok(())
    }
}
