//! The error-kind taxonomy from spec.md §7, minus the kinds that never
//! propagate (non-finite numerical state is always a localized reset, never
//! a `PipelineError`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("sensor read failed: {0}")]
    SensorRead(String),

    #[error("sensor init failed: {0}")]
    SensorInit(String),

    #[error("inference failed ({kind}): {detail}")]
    Inference { kind: String, detail: String },

    #[error("session filesystem failure: {0}")]
    SessionFs(#[from] std::io::Error),

    #[error("session already active")]
    SessionAlreadyActive,

    #[error("no session is active")]
    NoActiveSession,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("summary serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("export failed: {0}")]
    Export(String),
}

/// Reasons the classifier adapter can report instead of a hard error, per
/// spec.md §4.7's "responsibility boundary" — these never stop the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ClassifierUnavailableReason {
    RuntimeMissing,
    ModelNotFound,
    InitFailed { detail: String },
}

impl std::fmt::Display for ClassifierUnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifierUnavailableReason::RuntimeMissing => write!(f, "runtime_missing"),
            ClassifierUnavailableReason::ModelNotFound => write!(f, "model_not_found"),
            ClassifierUnavailableReason::InitFailed { detail } => {
                write!(f, "init_failed:{detail}")
            }
        }
    }
}
