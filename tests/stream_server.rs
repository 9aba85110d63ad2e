use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pothole_watch::api::{ApiConfig, ApiHandle, ApiServer, AppState};
use pothole_watch::detect::{
    BoundingBox, Detection, DetectorAdapter, DetectorBackend, StubBackend,
};
use pothole_watch::{CameraSlot, DetectionAggregator, Frame, V4l2Config};

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

fn pothole() -> Detection {
    Detection::new(BoundingBox::new(8, 30, 60, 70), 0.87, "pothole")
}

fn camera(frame_limit: Option<u64>, width: u32) -> CameraSlot {
    CameraSlot::new(V4l2Config {
        device: "stub://road".to_string(),
        target_fps: 30,
        width,
        height: 96,
        frame_limit,
    })
}

fn adapter(backend: StubBackend) -> DetectorAdapter {
    DetectorAdapter::new(Arc::new(Mutex::new(backend)), 0.3, "pothole")
}

/// Detects nothing, slowly, so concurrent pipelines interleave on the camera.
struct SlowBackend {
    delay: Duration,
}

impl DetectorBackend for SlowBackend {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&mut self, _frame: &Frame, _threshold: f32) -> Result<Vec<Detection>> {
        std::thread::sleep(self.delay);
        Ok(Vec::new())
    }
}

fn open_feed(addr: std::net::SocketAddr) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    Ok(stream)
}

fn count_parts(body: &[u8]) -> usize {
    body.windows(PART_HEADER.len())
        .filter(|window| *window == PART_HEADER)
        .count()
}

fn split_response(response: &[u8]) -> (String, Vec<u8>) {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(response.len());
    (
        String::from_utf8_lossy(&response[..split]).to_string(),
        response[split..].to_vec(),
    )
}

struct TestApi {
    api_handle: Option<ApiHandle>,
    aggregator: Arc<DetectionAggregator>,
    camera: CameraSlot,
}

impl TestApi {
    fn new(camera: CameraSlot, detector: Option<DetectorAdapter>) -> Result<Self> {
        let aggregator = Arc::new(DetectionAggregator::default());
        let state = AppState {
            camera: camera.clone(),
            detector,
            aggregator: aggregator.clone(),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
            aggregator,
            camera,
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }

    fn request(&self, method: &str, path: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        Ok(split_response(&response))
    }

    fn get_json(&self, path: &str) -> Result<(String, Value)> {
        let (headers, body) = self.request("GET", path)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

#[test]
fn video_feed_streams_one_part_per_frame() -> Result<()> {
    let api = TestApi::new(camera(Some(4), 128), Some(adapter(StubBackend::new())))?;

    let (headers, body) = api.request("GET", "/video_feed")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(headers.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(count_parts(&body), 4);
    assert!(body.starts_with(PART_HEADER));
    assert!(body.ends_with(b"\r\n"));
    assert_eq!(api.aggregator.state().total_frames, 4);
    Ok(())
}

#[test]
fn concurrent_viewers_share_one_camera() -> Result<()> {
    const FRAME_LIMIT: u64 = 30;
    let detector = DetectorAdapter::new(
        Arc::new(Mutex::new(SlowBackend {
            delay: Duration::from_millis(20),
        })),
        0.3,
        "pothole",
    );
    let api = TestApi::new(camera(Some(FRAME_LIMIT), 64), Some(detector))?;

    let first = open_feed(api.addr())?;
    let second = open_feed(api.addr())?;
    let readers: Vec<_> = [first, second]
        .into_iter()
        .map(|mut stream| {
            std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
                let mut response = Vec::new();
                stream.read_to_end(&mut response)?;
                Ok(response)
            })
        })
        .collect();

    let mut counts = Vec::new();
    for reader in readers {
        let response = reader.join().expect("reader thread")?;
        let (headers, body) = split_response(&response);
        assert!(headers.starts_with("HTTP/1.1 200 OK"));
        counts.push(count_parts(&body));
    }

    // Every camera frame goes to exactly one viewer.
    assert!(counts.iter().all(|&count| count > 0), "counts: {:?}", counts);
    let total: usize = counts.iter().sum();
    assert_eq!(total as u64, FRAME_LIMIT);
    assert_eq!(api.aggregator.state().total_frames, FRAME_LIMIT);
    Ok(())
}

#[test]
fn detections_show_up_in_status() -> Result<()> {
    let backend = StubBackend::scripted(vec![vec![], vec![pothole()], vec![]]);
    let api = TestApi::new(camera(Some(3), 128), Some(adapter(backend)))?;

    let (_, before) = api.get_json("/api/detection_status")?;
    assert_eq!(before["pothole_detected"], false);
    assert_eq!(before["total_frames"], 0);
    assert_eq!(before["detection_rate"], 0.0);

    let (_, body) = api.request("GET", "/video_feed")?;
    assert_eq!(count_parts(&body), 3);

    let (headers, status) = api.get_json("/api/detection_status")?;
    assert!(headers.contains("Content-Type: application/json"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(status["pothole_detected"], true);
    assert_eq!(status["current_detections"], 0);
    assert_eq!(status["total_detections"], 1);
    assert_eq!(status["total_frames"], 3);
    let rate = status["detection_rate"].as_f64().expect("rate");
    assert!((rate - 1.0 / 3.0).abs() < 1e-9);
    assert!(status["timestamp"].as_f64().expect("timestamp") > 0.0);
    Ok(())
}

#[test]
fn health_reports_model_and_camera() -> Result<()> {
    let api = TestApi::new(camera(Some(1), 64), Some(adapter(StubBackend::new())))?;

    let (headers, health) = api.get_json("/api/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["model_loaded"], true);
    assert_eq!(health["camera_active"], false);

    api.request("GET", "/video_feed")?;
    let (_, health) = api.get_json("/api/health")?;
    assert_eq!(health["camera_active"], true);
    assert!(api.camera.is_active());
    Ok(())
}

#[test]
fn missing_model_is_reported() -> Result<()> {
    let api = TestApi::new(camera(Some(1), 64), None)?;

    let (_, health) = api.get_json("/api/health")?;
    assert_eq!(health["model_loaded"], false);

    let (headers, body) = api.get_json("/video_feed")?;
    assert!(headers.starts_with("HTTP/1.1 503"));
    assert_eq!(body["error"], "model_not_loaded");
    assert!(!api.camera.is_active());
    Ok(())
}

#[test]
fn unavailable_camera_returns_server_error() -> Result<()> {
    let api = TestApi::new(camera(None, 0), Some(adapter(StubBackend::new())))?;

    let (headers, body) = api.get_json("/video_feed")?;
    assert!(headers.starts_with("HTTP/1.1 500"));
    assert_eq!(body["error"], "DEVICE_UNAVAILABLE");

    let (headers, health) = api.get_json("/api/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(health["camera_active"], false);
    Ok(())
}

#[test]
fn unknown_paths_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(camera(Some(1), 64), Some(adapter(StubBackend::new())))?;

    let (headers, body) = api.get_json("/")?;
    assert!(headers.starts_with("HTTP/1.1 404"));
    assert!(headers.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(body["error"], "not_found");

    let (headers, body) = api.get_json("/api/detection_status?verbose=1")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    assert!(body.get("total_frames").is_some());

    let (headers, _) = api.request("POST", "/api/detection_status")?;
    assert!(headers.starts_with("HTTP/1.1 405"));
    Ok(())
}

#[test]
fn client_disconnect_ends_its_stream() -> Result<()> {
    let api = TestApi::new(camera(None, 128), Some(adapter(StubBackend::new())))?;

    {
        let mut stream = TcpStream::connect(api.addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf)?;
        assert!(n > 0);
    }

    // Other endpoints keep working while and after a stream runs.
    let (headers, _) = api.get_json("/api/health")?;
    assert!(headers.starts_with("HTTP/1.1 200 OK"));
    Ok(())
}

#[test]
fn stop_ends_open_streams() -> Result<()> {
    let mut api = TestApi::new(camera(None, 64), Some(adapter(StubBackend::new())))?;

    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut buf = [0u8; 1024];
    assert!(stream.read(&mut buf)? > 0);

    let handle = api.api_handle.take().expect("api handle");
    let reader = std::thread::spawn(move || {
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });
    handle.stop()?;
    reader.join().expect("reader thread");
    Ok(())
}
