// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Error types shared by the hardware layer, the fan state machine and the
//! registries.

use std::io;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// The sysfs handle no longer resolves (device removed, driver reloaded).
    #[error("hardware gone: {0}")]
    HardwareGone(String),

    /// The process lacks the privilege to write the attribute.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A duty cycle outside 0-100%.
    #[error("duty {0} is outside the valid range 0-100%")]
    InvalidRange(f64),

    /// A curve with no points was evaluated. Callers normally never see this;
    /// evaluation falls back to the default duty instead.
    #[error("curve '{0}' has no points")]
    CurveDegenerate(String),

    /// The stat source had no value for this tick.
    #[error("stat '{0}' is unavailable")]
    StatUnavailable(String),

    #[error("curve '{name}' is used by {fans:?}")]
    CurveInUse { name: String, fans: Vec<String> },

    #[error("unknown curve: {0}")]
    UnknownCurve(String),

    #[error("unknown fan: {0}")]
    UnknownFan(String),

    #[error("unknown notification rule: {0}")]
    UnknownRule(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl ControlError {
    /// Classify an I/O error raised while touching a hardware attribute.
    pub fn from_hw_io(path: &std::path::Path, err: &io::Error) -> Self {
        let what = format!("{}: {err}", path.display());
        if err.kind() == io::ErrorKind::PermissionDenied {
            return ControlError::PermissionDenied(what);
        }
        if err.kind() == io::ErrorKind::NotFound {
            return ControlError::HardwareGone(what);
        }
        match err.raw_os_error() {
            // ENXIO, EIO, ENODEV
            Some(6) | Some(5) | Some(19) => ControlError::HardwareGone(what),
            Some(1) | Some(13) => ControlError::PermissionDenied(what),
            _ => ControlError::Io(what),
        }
    }

    /// Whether this error should knock a fan back to hardware control.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            ControlError::HardwareGone(_)
                | ControlError::PermissionDenied(_)
                | ControlError::InvalidRange(_)
                | ControlError::Io(_)
        )
    }
}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        ControlError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Parse(e.to_string())
    }
}
