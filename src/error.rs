/// Failure classes of the frame pipeline.
///
/// Carried inside `anyhow::Error`; callers that need to branch on the class
/// use `err.downcast_ref::<PipelineError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The camera could not be opened. Fatal, never retried.
    DeviceUnavailable { device: String, reason: String },
    /// A single read failed. Ends the stream of the connection that hit it.
    FrameReadFailure(String),
    /// The detector backend failed on a frame.
    DetectorFailure(String),
    /// The annotated frame could not be serialized to JPEG.
    EncodeFailure(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DeviceUnavailable { .. } => "DEVICE_UNAVAILABLE",
            PipelineError::FrameReadFailure(_) => "FRAME_READ_FAILURE",
            PipelineError::DetectorFailure(_) => "DETECTOR_FAILURE",
            PipelineError::EncodeFailure(_) => "ENCODE_FAILURE",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::DeviceUnavailable { device, reason } => {
                write!(f, "{}: cannot open {}: {}", self.code(), device, reason)
            }
            PipelineError::FrameReadFailure(msg)
            | PipelineError::DetectorFailure(msg)
            | PipelineError::EncodeFailure(msg) => write!(f, "{}: {}", self.code(), msg),
        }
    }
}

impl std::error::Error for PipelineError {}
