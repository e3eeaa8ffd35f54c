use edge_pixels::Frame;

use crate::camera::error::{CameraError, Result};
use crate::camera::types::{CameraDevice, DeviceId, FacingPreference, Size};

/// Asynchronous notifications from an opened device.
///
/// Delivered on the backend's own thread, in the order the device produced
/// them.
#[derive(Debug)]
pub enum DeviceEvent {
    Opened,
    OpenFailed(String),
    Configured(Size),
    ConfigureFailed(String),
    /// A sensor image in its native planar 4:2:0 layout.
    Image(Frame),
    Disconnected,
    Error(String),
}

/// Receiver for [`DeviceEvent`]s, called on the backend's thread.
pub type DeviceEventSink = Box<dyn Fn(DeviceEvent) + Send>;

/// Platform-agnostic camera backend trait.
///
/// Opening is asynchronous: `open_device` returns a handle immediately and
/// completion arrives as [`DeviceEvent::Opened`] or
/// [`DeviceEvent::OpenFailed`] on the sink.
pub trait CameraBackend: Send + Sync {
    /// Enumerate all currently connected camera devices.
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>>;

    /// Start opening `id`; every later event for this device goes to `events`.
    fn open_device(&self, id: &DeviceId, events: DeviceEventSink) -> Result<Box<dyn DeviceHandle>>;
}

/// Exclusive handle to an opened device.
pub trait DeviceHandle: Send {
    /// Request a repeating capture at `size`. Completion arrives as
    /// [`DeviceEvent::Configured`] or [`DeviceEvent::ConfigureFailed`].
    fn configure(&mut self, size: Size) -> Result<()>;

    /// Stop capture and release the hardware. Must be idempotent.
    fn close(&mut self);
}

/// Pick the first device matching `preference`.
pub fn select_device(
    devices: &[CameraDevice],
    preference: &FacingPreference,
) -> Result<CameraDevice> {
    devices
        .iter()
        .find(|d| preference.matches(d))
        .cloned()
        .ok_or_else(|| CameraError::NoMatchingDevice(preference.to_string()))
}
