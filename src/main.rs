//! Handlens: live hand-landmark overlay on the camera preview

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use handlens::capture::{CaptureDevice, TestPatternCapture, V4l2Capture};
use handlens::detection::StubDetector;
use handlens::display::Sdl2Display;
use handlens::pipeline::PipelineParts;
use handlens::{CaptureConfig, CaptureSource, Config, Pipeline};

fn open_device(config: &CaptureConfig) -> Box<dyn CaptureDevice> {
    match config.source {
        CaptureSource::V4l2 => Box::new(V4l2Capture::new(config.clone())),
        CaptureSource::Synthetic => Box::new(TestPatternCapture::new(
            config.width,
            config.height,
            config.fps,
            config.rotation,
        )),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("handlens=debug"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Handlens launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    handlens::CONFIG.store(Arc::new(config.clone()));
    info!("Capture: {:?}", config.capture);

    let runtime = tokio::runtime::Handle::current();
    let detector = Arc::new(StubDetector::new(
        runtime.clone(),
        config.detector.options(),
        Duration::from_millis(config.detector.stub_latency_ms),
    ));

    let mut pipeline = Pipeline::start(PipelineParts {
        device: open_device(&config.capture),
        detector,
        runtime: Some(runtime),
        config: config.clone(),
    })?;

    let quit = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let quit = quit.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => quit.store(true, Ordering::Relaxed),
                Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
            }
        }
    });

    // Initialize SDL2
    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;

    let mut app = Sdl2Display::new(&sdl_context, config.display.width, config.display.height)?;
    let outcome = app.run(&sdl_context, &pipeline, &quit);

    // Stop every producer while the window still exists
    pipeline.shutdown();
    drop(app);

    info!("Handlens shutting down");
    outcome
}
