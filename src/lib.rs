pub mod capture;
pub mod detection;
pub mod display;
pub mod overlay;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use capture::{PixelFormat, Rotation};
use detection::DetectorOptions;

pub use capture::Frame;
pub use pipeline::{Pipeline, PipelineEvent};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] config::ConfigError);

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub detector: DetectorConfig,
    pub display: DisplayConfig,
    pub pipeline: PipelineConfig,
    pub debug: DebugConfig,
}

impl Config {
    /// Defaults, then the TOML file (`handlens.toml` in the working directory
    /// when no path is given, optional), then `HANDLENS__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("handlens").required(false),
        };
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(config::Environment::with_prefix("HANDLENS").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    Back,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    /// Empty selects the first suitable `/dev/videoN`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Clockwise rotation that makes the sensor image upright
    pub rotation: Rotation,
    pub facing: CameraFacing,
    /// Longest wait for a single frame before the driver call gives up
    pub frame_timeout_ms: u64,
    /// Consecutive frame timeouts before capture is reported as failed
    pub stall_limit: u32,
}

impl CaptureConfig {
    /// Front cameras are shown mirrored, like a looking glass.
    pub fn mirror(&self) -> bool {
        self.facing == CameraFacing::Front
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms.max(1))
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSource::V4l2,
            device: String::new(),
            // Square-ish request; drivers fall back to the closest mode
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            rotation: Rotation::Deg0,
            facing: CameraFacing::Front,
            frame_timeout_ms: 1000,
            stall_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub max_hands: usize,
    pub input_size: u32,
    /// Latency of the built-in stub detector
    pub stub_latency_ms: u64,
}

impl DetectorConfig {
    pub fn options(&self) -> DetectorOptions {
        DetectorOptions {
            max_hands: self.max_hands,
            input_size: self.input_size,
            streaming: true,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let options = DetectorOptions::default();
        Self {
            max_hands: options.max_hands,
            input_size: options.input_size,
            stub_latency_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for a single inference. Unset keeps the legacy behaviour: a
    /// stalled detector halts submissions until it answers.
    pub inference_timeout_ms: Option<u64>,
    /// Pin the frame worker to this CPU core
    pub worker_core: Option<usize>,
    pub stats_interval_ms: u64,
}

impl PipelineConfig {
    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_timeout_ms: None,
            worker_core: None,
            stats_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub snapshot_dir: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

/// Counters owned by the frame worker
#[derive(Default)]
pub struct PipelineStats {
    counters: CachePadded<WorkerCounters>,
}

#[derive(Default)]
struct WorkerCounters {
    frames_processed: AtomicU64,
    frames_corrupt: AtomicU64,
}

impl PipelineStats {
    pub fn record_processed(&self) {
        self.counters
            .frames_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.counters.frames_corrupt.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_corrupt").increment(1);
    }

    pub fn frames_processed(&self) -> u64 {
        self.counters.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_corrupt(&self) -> u64 {
        self.counters.frames_corrupt.load(Ordering::Relaxed)
    }
}

/// Performance counters collected throughout the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub frames_corrupt: u64,
    pub submissions_accepted: u64,
    pub submissions_rejected: u64,
    pub detections: u64,
    pub detection_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_request_a_front_camera_and_two_hands() {
        let config = Config::default();
        assert!(config.capture.mirror());
        assert_eq!(config.detector.options().max_hands, 2);
        assert_eq!(config.pipeline.inference_timeout(), None);
        assert_eq!(config.capture.frame_timeout(), Duration::from_millis(1000));
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = std::env::temp_dir().join(format!("handlens-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("handlens.toml");
        std::fs::write(
            &path,
            r#"
[capture]
source = "synthetic"
rotation = 270
facing = "back"

[pipeline]
inference_timeout_ms = 250
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.source, CaptureSource::Synthetic);
        assert_eq!(config.capture.rotation, Rotation::Deg270);
        assert!(!config.capture.mirror());
        assert_eq!(
            config.pipeline.inference_timeout(),
            Some(Duration::from_millis(250))
        );
        // Untouched keys keep their defaults
        assert_eq!(config.detector.input_size, 256);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn environment_overrides_file_and_defaults() {
        // Keys no other test reads, since the environment is process-wide
        let dir = std::env::temp_dir().join(format!("handlens-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("handlens.toml");
        std::fs::write(&path, "[display]\nwidth = 800\nheight = 600\n").unwrap();

        std::env::set_var("HANDLENS__DISPLAY__WIDTH", "1024");
        std::env::set_var("HANDLENS__PIPELINE__WORKER_CORE", "3");
        let loaded = Config::load(Some(&path));
        std::env::remove_var("HANDLENS__DISPLAY__WIDTH");
        std::env::remove_var("HANDLENS__PIPELINE__WORKER_CORE");

        let config = loaded.unwrap();
        assert_eq!(config.display.width, 1024);
        assert_eq!(config.display.height, 600);
        assert_eq!(config.pipeline.worker_core, Some(3));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_invalid_rotation() {
        let dir = std::env::temp_dir().join(format!("handlens-badrot-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("handlens.toml");
        std::fs::write(&path, "[capture]\nrotation = 45\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
