//! Per-connection frame pipeline and multipart framing.
//!
//! Every streaming client gets its own `FramePipeline` driving the full
//! capture -> detect -> annotate -> encode sequence; there is no shared
//! frame cache between viewers. The camera, detector backend and detection
//! state are shared; each is behind its own lock.
//!
//! A frame's detection count is committed to the aggregator only after
//! every step for that frame succeeded, so a failed frame leaves the
//! detection state untouched.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;

use crate::aggregate::DetectionAggregator;
use crate::annotate::Annotator;
use crate::detect::DetectorAdapter;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::ingest::Camera;

pub const DEFAULT_BOUNDARY: &str = "frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Splits a byte stream into JPEG parts with a fixed boundary token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartFramer {
    boundary: String,
}

impl MultipartFramer {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` for the whole response.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// One self-delimited part: boundary line, part headers, payload, CRLF.
    pub fn frame_part(&self, jpeg: &[u8]) -> Vec<u8> {
        let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", self.boundary);
        let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
        part.extend_from_slice(header.as_bytes());
        part.extend_from_slice(jpeg);
        part.extend_from_slice(b"\r\n");
        part
    }
}

impl Default for MultipartFramer {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDARY)
    }
}

/// Encode an annotated frame as JPEG, consuming it.
pub fn encode_jpeg(frame: Frame, quality: u8) -> Result<Vec<u8>> {
    let image = frame.into_image();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|err| PipelineError::EncodeFailure(err.to_string()))?;
    Ok(buffer)
}

/// Capture -> detect -> annotate -> encode for one connection.
pub struct FramePipeline {
    camera: Camera,
    detector: DetectorAdapter,
    annotator: Annotator,
    aggregator: Arc<DetectionAggregator>,
    jpeg_quality: u8,
}

impl FramePipeline {
    pub fn new(
        camera: Camera,
        detector: DetectorAdapter,
        annotator: Annotator,
        aggregator: Arc<DetectionAggregator>,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            camera,
            detector,
            annotator,
            aggregator,
            jpeg_quality,
        }
    }

    /// Run one iteration. `Ok(None)` means the camera produced no frame.
    pub fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(mut frame) = self.camera.next_frame() else {
            return Ok(None);
        };
        let detections = self.detector.detect(&frame)?;
        self.annotator.annotate(&mut frame, &detections);
        let jpeg = encode_jpeg(frame, self.jpeg_quality)?;
        self.aggregator.record(detections.len());
        Ok(Some(jpeg))
    }

    pub fn into_stream(self, framer: MultipartFramer) -> FrameStream {
        FrameStream {
            pipeline: self,
            framer,
            finished: false,
        }
    }
}

/// Lazy, unbounded sequence of framed JPEG parts.
///
/// Ends without an error item when the camera stops producing. A detector
/// or encode failure is yielded once, then the stream ends.
pub struct FrameStream {
    pipeline: FramePipeline,
    framer: MultipartFramer,
    finished: bool,
}

impl Iterator for FrameStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.pipeline.next_jpeg() {
            Ok(Some(jpeg)) => Some(Ok(self.framer.frame_part(&jpeg))),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Why a pumped stream stopped.
#[derive(Debug)]
pub enum StreamEnd {
    /// The camera stopped producing frames.
    SourceEnded,
    /// Writing to the client failed; it went away.
    ClientClosed,
    /// The shutdown flag was raised.
    Shutdown,
    /// A pipeline step failed.
    Failed(anyhow::Error),
}

#[derive(Debug)]
pub struct StreamOutcome {
    pub frames_sent: u64,
    pub end: StreamEnd,
}

impl FrameStream {
    /// Write parts into `sink` until the producer ends, the sink fails, or
    /// `shutdown` is raised. The flag is checked before each frame is
    /// captured, so shutdown never leaves a recorded-but-unsent frame.
    pub fn pump<W: Write>(mut self, sink: &mut W, shutdown: &AtomicBool) -> StreamOutcome {
        let mut frames_sent = 0u64;
        let end = loop {
            if shutdown.load(Ordering::SeqCst) {
                break StreamEnd::Shutdown;
            }
            let part = match self.next() {
                Some(Ok(part)) => part,
                Some(Err(err)) => break StreamEnd::Failed(err),
                None => break StreamEnd::SourceEnded,
            };
            if sink.write_all(&part).and_then(|_| sink.flush()).is_err() {
                break StreamEnd::ClientClosed;
            }
            frames_sent += 1;
        };
        StreamOutcome { frames_sent, end }
    }
}
