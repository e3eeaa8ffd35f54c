use thiserror::Error;

use crate::camera::types::SessionState;

/// Camera subsystem errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No device matches the configured facing preference.
    #[error("no camera matches preference {0}")]
    NoMatchingDevice(String),

    #[error("device open failed: {0}")]
    DeviceOpenFailed(String),

    #[error("session configuration failed: {0}")]
    SessionConfigureFailed(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("device {0} is already held by another capture session")]
    DeviceBusy(String),

    #[error("capture session already active ({0})")]
    SessionActive(SessionState),

    #[error("capture thread error: {0}")]
    Thread(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CameraError>;
