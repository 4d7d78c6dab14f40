//! Pipeline configuration: CLI flags with environment-variable fallback,
//! plus the `DeviceInfo`/`Thresholds` pair echoed into `status` and session
//! summaries so defaults are never implicit.

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const SAMPLE_PERIOD_SECS: f64 = 1.0 / 50.0;
pub const TICK_PERIOD_MS: u64 = 100;

#[derive(Parser, Debug, Clone)]
#[command(name = "rep_tracker")]
#[command(about = "Real-time IMU rep-counting and performance pipeline", long_about = None)]
pub struct Args {
    /// Host to bind the dispatcher's websocket/HTTP listener on
    #[arg(long, env = "REP_TRACKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the dispatcher's websocket/HTTP listener on
    #[arg(long, env = "REP_TRACKER_PORT", default_value_t = 8765)]
    pub port: u16,

    /// Directory that per-session subdirectories are written under
    #[arg(long, env = "REP_TRACKER_SESSIONS_DIR", default_value = "sessions")]
    pub sessions_dir: String,

    /// Directory that `export_session` zip bundles are written under
    #[arg(long, env = "REP_TRACKER_EXPORTS_DIR", default_value = "exports")]
    pub exports_dir: String,

    /// Enable the classifier adapter
    #[arg(long, env = "REP_TRACKER_CLASSIFIER", default_value_t = false)]
    pub enable_classifier: bool,

    /// Path to the classifier model file
    #[arg(long, env = "REP_TRACKER_MODEL_PATH", default_value = "model.tflite")]
    pub model_path: String,

    /// Path to the classifier metadata JSON
    #[arg(long, env = "REP_TRACKER_METADATA_PATH", default_value = "model_metadata.json")]
    pub metadata_path: String,

    /// Samples between successive classifier inference steps
    #[arg(long, env = "REP_TRACKER_INFERENCE_STRIDE", default_value_t = 25)]
    pub inference_stride: usize,

    /// Use the synthetic mock IMU source instead of a real sensor driver
    #[arg(long, default_value_t = true)]
    pub mock_imu: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            sessions_dir: "sessions".to_string(),
            exports_dir: "exports".to_string(),
            enable_classifier: false,
            model_path: "model.tflite".to_string(),
            metadata_path: "model_metadata.json".to_string(),
            inference_stride: 25,
            mock_imu: true,
        }
    }
}

/// Device/runtime metadata echoed into `status` and session summaries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub sample_rate_hz: f64,
    pub tick_rate_hz: f64,
    pub classifier_enabled: bool,
    pub model_path: String,
    pub metadata_path: String,
    pub inference_stride: usize,
    pub host: String,
    pub port: u16,
}

impl From<&Args> for DeviceInfo {
    fn from(args: &Args) -> Self {
        Self {
            sample_rate_hz: 1.0 / SAMPLE_PERIOD_SECS,
            tick_rate_hz: 1000.0 / TICK_PERIOD_MS as f64,
            classifier_enabled: args.enable_classifier,
            model_path: args.model_path.clone(),
            metadata_path: args.metadata_path.clone(),
            inference_stride: args.inference_stride,
            host: args.host.clone(),
            port: args.port,
        }
    }
}

/// Rep-detector / ROM thresholds, fixed at session start and replayed into
/// per-tick diagnostics and the summary, per spec.md §4.6.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Thresholds {
    pub rep_threshold: f64,
    pub rep_hysteresis_ratio: f64,
    pub rep_filter_alpha: f64,
    pub min_rep_interval_secs: f64,
    pub partial_rom_ratio: f64,
    pub classifier_confidence_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            rep_threshold: 1200.0,
            rep_hysteresis_ratio: 0.6,
            rep_filter_alpha: 0.2,
            min_rep_interval_secs: 0.6,
            partial_rom_ratio: 0.7,
            classifier_confidence_threshold: 0.6,
        }
    }
}
