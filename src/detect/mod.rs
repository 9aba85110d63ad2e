mod adapter;
mod backend;
pub mod backends;
mod registry;
mod result;

pub use adapter::{DetectorAdapter, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_TARGET_CLASS};
pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, Detection};
