use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable camera identifier as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new `DeviceId` from a raw string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way a lens points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensFacing {
    Back,
    Front,
    External,
}

impl LensFacing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Back => "back",
            Self::Front => "front",
            Self::External => "external",
        }
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    /// Default capture size requested from the sensor.
    pub const HD: Size = Size::new(1280, 720);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::HD
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Camera video format descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub pixel_format: String,
}

impl FormatDescriptor {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl Eq for FormatDescriptor {}

impl PartialOrd for FormatDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FormatDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Sort by total pixels descending, then by fps descending
        other
            .size()
            .area()
            .cmp(&self.size().area())
            .then_with(|| {
                other
                    .fps
                    .partial_cmp(&self.fps)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| self.pixel_format.cmp(&other.pixel_format))
    }
}

/// Pick the supported size closest in pixel count to `preferred`.
///
/// An exact match always wins; ties go to the larger format. Returns
/// `preferred` unchanged when the device reports no formats.
pub fn closest_size(formats: &[FormatDescriptor], preferred: Size) -> Size {
    let mut sorted: Vec<&FormatDescriptor> = formats.iter().collect();
    sorted.sort();
    if let Some(exact) = sorted.iter().find(|f| f.size() == preferred) {
        return exact.size();
    }
    sorted
        .into_iter()
        .min_by_key(|f| f.size().area().abs_diff(preferred.area()))
        .map(FormatDescriptor::size)
        .unwrap_or(preferred)
}

/// Discovered camera device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraDevice {
    pub id: DeviceId,
    pub name: String,
    pub facing: LensFacing,
    pub formats: Vec<FormatDescriptor>,
}

/// Which device a preview should open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingPreference {
    #[default]
    Back,
    Front,
    External,
    /// A specific device, regardless of facing.
    Device(DeviceId),
}

impl FacingPreference {
    pub fn matches(&self, device: &CameraDevice) -> bool {
        match self {
            Self::Back => device.facing == LensFacing::Back,
            Self::Front => device.facing == LensFacing::Front,
            Self::External => device.facing == LensFacing::External,
            Self::Device(id) => &device.id == id,
        }
    }
}

impl fmt::Display for FacingPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Back => f.write_str("back"),
            Self::Front => f.write_str("front"),
            Self::External => f.write_str("external"),
            Self::Device(id) => write!(f, "device {id}"),
        }
    }
}

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Opening,
    Configuring,
    Streaming,
    Closing,
}

impl SessionState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Opening => 1,
            Self::Configuring => 2,
            Self::Streaming => 3,
            Self::Closing => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Opening,
            2 => Self::Configuring,
            3 => Self::Streaming,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Configuring => "configuring",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}
