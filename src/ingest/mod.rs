//! Frame ingestion.
//!
//! - `V4l2Source`: local V4L2 device (feature: ingest-v4l2) or `stub://`
//!   synthetic frames
//! - `CameraSlot`: the single, lazily opened camera shared by every
//!   streaming connection
//!
//! Frames are handed to exactly one pipeline iteration and dropped after
//! encoding; nothing here buffers or stores them.

pub mod camera;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod v4l2;

pub use camera::{Camera, CameraSlot};
pub use v4l2::{V4l2Config, V4l2Source, V4l2Stats};
