//! potholed - pothole detection stream daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + POTHOLE_* environment)
//! 2. Registers the configured detector backend
//! 3. Serves the annotated MJPEG stream and the status/health API
//! 4. Opens the camera lazily on the first stream request
//! 5. Releases the camera on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use pothole_watch::{
    api::{ApiServer, AppState},
    config::{DetectorKind, DetectorSettings, PotholeConfig},
    detect::{BackendRegistry, DetectorAdapter, StubBackend},
    CameraSlot, DetectionAggregator,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve a live pothole-annotated camera stream")]
struct Args {
    /// JSON config file (overrides POTHOLE_CONFIG).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listening address, e.g. 0.0.0.0:5000.
    #[arg(long)]
    addr: Option<String>,

    /// Camera device path, or stub://<name> for synthetic frames.
    #[arg(long)]
    device: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var("POTHOLE_CONFIG").ok().map(PathBuf::from));
    let mut config = PotholeConfig::load_from(config_path.as_deref())?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(device) = args.device {
        config.camera.device = device;
    }

    let registry = build_registry(&config.detector);
    if let Err(err) = registry.warm_up_default() {
        log::warn!("detector warm-up failed: {:#}", err);
    }
    let detector = registry.default_backend().map(|backend| {
        DetectorAdapter::new(
            backend,
            config.detector.confidence,
            config.detector.target_class.clone(),
        )
    });
    match &detector {
        Some(adapter) => {
            log::info!(
                "detector ready: backend={} registered={:?} target_class={} confidence>={}",
                adapter.backend_name(),
                registry.list(),
                config.detector.target_class,
                config.detector.confidence
            );
            if adapter.backend_name() == "stub" {
                log::warn!(
                    "stub detector active: no {} will ever be detected; \
                     set POTHOLE_DETECTOR_BACKEND=tract with a model path for real detection",
                    config.detector.target_class
                );
            }
        }
        None => log::error!("no detector backend loaded; /video_feed will be unavailable"),
    }

    let camera = CameraSlot::new(config.camera_config());
    let state = AppState {
        camera: camera.clone(),
        detector,
        aggregator: Arc::new(DetectionAggregator::new(config.aggregator_config())),
    };
    let api_handle = ApiServer::new(config.api_config(), state).spawn()?;
    log::info!(
        "potholed running. camera {} ({}x{}@{}fps), stream on http://{}/video_feed",
        config.camera.device,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;
    camera.release();

    Ok(())
}

fn build_registry(settings: &DetectorSettings) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    match settings.backend {
        DetectorKind::Stub => registry.register(StubBackend::new()),
        DetectorKind::Tract => register_tract(&mut registry, settings),
    }
    registry
}

#[cfg(feature = "backend-tract")]
fn register_tract(registry: &mut BackendRegistry, settings: &DetectorSettings) {
    let Some(path) = settings.model_path.as_ref() else {
        log::error!("tract backend selected without a model path");
        return;
    };
    match pothole_watch::detect::TractBackend::new(
        path,
        settings.input_size,
        settings.class_names.clone(),
    ) {
        Ok(backend) => {
            log::info!("loaded ONNX model {}", path.display());
            registry.register(backend);
        }
        Err(err) => log::error!("failed to load model {}: {:#}", path.display(), err),
    }
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(_registry: &mut BackendRegistry, _settings: &DetectorSettings) {
    log::error!("tract backend requested but potholed was built without the backend-tract feature");
}
