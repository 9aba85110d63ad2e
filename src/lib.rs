//! Pothole Watch
//!
//! Live road-surface monitoring: frames from a local camera go through an
//! object detector, potholes are boxed and captioned on the frame, and the
//! annotated video is served to browsers as an MJPEG multipart stream. A
//! debounced detection state is exposed as JSON for dashboards.
//!
//! # Module Structure
//!
//! - `ingest`: camera access (V4L2 or `stub://` synthetic frames)
//! - `detect`: detector backends and the class-filtering adapter
//! - `annotate`: boxes, captions and the warning banner
//! - `aggregate`: hysteresis state machine and status snapshots
//! - `stream`: per-connection pipeline and multipart framing
//! - `api`: HTTP endpoints (`/video_feed`, `/api/detection_status`, `/api/health`)
//! - `config`: JSON file plus environment configuration

pub mod aggregate;
pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod stream;

pub use aggregate::{AggregatorConfig, DetectionAggregator, DetectionState, StatusReport};
pub use annotate::{AnnotationSummary, Annotator};
pub use api::{ApiConfig, ApiHandle, ApiServer, AppState};
pub use config::PotholeConfig;
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectorAdapter, DetectorBackend};
pub use error::PipelineError;
pub use frame::Frame;
pub use ingest::{Camera, CameraSlot, V4l2Config};
pub use stream::{FramePipeline, FrameStream, MultipartFramer, StreamEnd, StreamOutcome};
