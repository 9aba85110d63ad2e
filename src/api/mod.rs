use crate::aggregate::DetectionAggregator;
use crate::annotate::Annotator;
use crate::detect::DetectorAdapter;
use crate::error::PipelineError;
use crate::ingest::CameraSlot;
use crate::stream::{
    FramePipeline, MultipartFramer, StreamEnd, DEFAULT_BOUNDARY, DEFAULT_JPEG_QUALITY,
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub boundary: String,
    pub jpeg_quality: u8,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Shared resources handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub camera: CameraSlot,
    /// `None` when no detector backend could be loaded.
    pub detector: Option<DetectorAdapter>,
    pub aggregator: Arc<DetectionAggregator>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    model_loaded: bool,
    camera_active: bool,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, end every open stream between frames, and wait.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: AppState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("pothole api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("pothole api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: AppState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        workers.retain(|worker| !worker.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let state = state.clone();
                let shutdown = shutdown.clone();
                workers.push(std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &state, &shutdown) {
                        log::warn!("pothole api request from {} rejected: {}", peer, err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };
    shutdown.store(true, Ordering::SeqCst);
    for worker in workers {
        if worker.join().is_err() {
            log::error!("pothole api connection thread panicked");
        }
    }
    result
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &AppState,
    shutdown: &AtomicBool,
) -> Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/video_feed" => serve_video_feed(stream, cfg, state, shutdown),
        "/api/detection_status" => {
            let payload = serde_json::to_vec(&state.aggregator.snapshot())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/api/health" => {
            let report = HealthReport {
                status: "healthy",
                model_loaded: state.detector.is_some(),
                camera_active: state.camera.is_active(),
            };
            let payload = serde_json::to_vec(&report)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn serve_video_feed(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &AppState,
    shutdown: &AtomicBool,
) -> Result<()> {
    let Some(detector) = state.detector.clone() else {
        write_json_response(&mut stream, 503, r#"{"error":"model_not_loaded"}"#)?;
        return Ok(());
    };
    let camera = match state.camera.acquire() {
        Ok(camera) => camera,
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::code)
                .unwrap_or("INTERNAL");
            let body = serde_json::json!({ "error": code, "detail": format!("{:#}", err) });
            write_response(&mut stream, 500, "application/json", body.to_string().as_bytes())?;
            return Err(err);
        }
    };

    let framer = MultipartFramer::new(cfg.boundary.clone());
    write_head(&mut stream, 200, &framer.content_type(), None)?;
    stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;

    let peer = stream.peer_addr()?;
    log::info!("stream to {} started", peer);
    let annotator = Annotator::new(detector.target_class());
    let pipeline = FramePipeline::new(
        camera,
        detector,
        annotator,
        state.aggregator.clone(),
        cfg.jpeg_quality,
    );
    let outcome = pipeline.into_stream(framer).pump(&mut stream, shutdown);
    match outcome.end {
        StreamEnd::Failed(err) => {
            log::error!(
                "stream to {} failed after {} frames: {:#}",
                peer,
                outcome.frames_sent,
                err
            );
        }
        end => {
            log::info!(
                "stream to {} ended after {} frames ({:?})",
                peer,
                outcome.frames_sent,
                end
            );
        }
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    write_head(stream, status, content_type, Some(body.len()))?;
    stream.write_all(body)?;
    Ok(())
}

/// Status line and headers. `content_length` is `None` for streamed bodies.
fn write_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    content_length: Option<usize>,
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n"
    );
    if let Some(len) = content_length {
        header.push_str(&format!("Content-Length: {len}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
