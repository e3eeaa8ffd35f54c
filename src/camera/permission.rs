//! Runtime camera permission, negotiated by the host before any device work.

use crate::camera::error::{CameraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

/// Host-side answer to "may this process use the camera?".
pub trait PermissionGate: Send + Sync {
    fn camera_access(&self) -> PermissionDecision;
}

/// A fixed decision, for hosts that settle permission up front.
impl PermissionGate for PermissionDecision {
    fn camera_access(&self) -> PermissionDecision {
        *self
    }
}

/// Fail with `PermissionDenied` unless a gate exists and grants access.
pub fn require_camera_access(gate: Option<&dyn PermissionGate>) -> Result<()> {
    match gate.map(|g| g.camera_access()) {
        Some(PermissionDecision::Granted) => Ok(()),
        Some(PermissionDecision::Denied) | None => Err(CameraError::PermissionDenied),
    }
}
