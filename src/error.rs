use std::fmt;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, MonitorError>;

/// Upstream stage output an assessment cannot be scored without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamInput {
    ClinicalScore,
    ImagingPrediction,
}

impl UpstreamInput {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamInput::ClinicalScore => "clinical score",
            UpstreamInput::ImagingPrediction => "imaging prediction",
        }
    }
}

impl fmt::Display for UpstreamInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    /// No recent measured stiffness and no way to estimate a proxy.
    #[error("stage unavailable, reason: stiffness (patient {patient_id})")]
    MissingStiffnessSignal { patient_id: Uuid },

    /// An upstream Stage 1 or Stage 2 signal needed for scoring is absent.
    #[error("stage unavailable, reason: missing {input} (patient {patient_id})")]
    MissingInput {
        patient_id: Uuid,
        input: UpstreamInput,
    },

    /// An input lies outside its valid domain. Never clamped.
    #[error("invalid signal range: {signal} = {value}")]
    InvalidSignalRange { signal: String, value: f64 },

    /// Calibration artifact absent or unusable; fatal at startup.
    #[error("calibration missing: {0}")]
    CalibrationMissing(String),

    #[error("risk monitoring is disabled")]
    Disabled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid alert transition: cannot {action} an alert that is {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub fn invalid_range(signal: impl Into<String>, value: f64) -> Self {
        MonitorError::InvalidSignalRange {
            signal: signal.into(),
            value,
        }
    }
}
