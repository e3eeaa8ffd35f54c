use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use edge_pixels::{Frame, PixelFormat, Yuv420Layout};
use tracing::{debug, warn};

use crate::camera::backend::{CameraBackend, DeviceEvent, DeviceEventSink, DeviceHandle};
use crate::camera::error::{CameraError, Result};
use crate::camera::types::{
    closest_size, CameraDevice, DeviceId, FormatDescriptor, LensFacing, Size,
};

const SYNTHETIC_BACK_ID: &str = "synthetic:back:0";
const SYNTHETIC_FRONT_ID: &str = "synthetic:front:1";
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Chroma arrangement the synthetic sensor writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaLayout {
    I420,
    Nv12,
    Nv21,
}

impl ChromaLayout {
    fn layout(self, size: Size, row_padding: usize) -> Yuv420Layout {
        match self {
            Self::I420 => Yuv420Layout::i420(size.width, size.height, row_padding),
            Self::Nv12 => Yuv420Layout::nv12(size.width, size.height, row_padding),
            Self::Nv21 => Yuv420Layout::nv21(size.width, size.height, row_padding),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::I420 => "i420",
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
        }
    }
}

/// How the simulated sensor behaves once a device is opened.
#[derive(Debug, Clone)]
struct SensorBehaviour {
    fps: f32,
    chroma: ChromaLayout,
    row_padding: usize,
    open_delay: Duration,
    open_failure: Option<String>,
    configure_failure: Option<String>,
    unresponsive: bool,
    disconnect_after: Option<u64>,
}

impl Default for SensorBehaviour {
    fn default() -> Self {
        Self {
            fps: 30.0,
            chroma: ChromaLayout::Nv21,
            row_padding: 0,
            open_delay: Duration::ZERO,
            open_failure: None,
            configure_failure: None,
            unresponsive: false,
            disconnect_after: None,
        }
    }
}

/// A camera backend that renders a moving test pattern instead of talking
/// to hardware.
///
/// Each opened device runs a sensor thread that emits planar 4:2:0 images at
/// the configured rate. Failures (open, configure, disconnect, a device that
/// never answers) can be injected through the builder methods.
///
/// Enable via `DUMMY_CAMERA=1` environment variable.
pub struct SyntheticBackend {
    devices: Vec<CameraDevice>,
    behaviour: SensorBehaviour,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    /// One back-facing and one front-facing camera.
    pub fn new() -> Self {
        Self::with_devices(vec![
            Self::device(SYNTHETIC_BACK_ID, LensFacing::Back),
            Self::device(SYNTHETIC_FRONT_ID, LensFacing::Front),
        ])
    }

    pub fn with_devices(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices,
            behaviour: SensorBehaviour::default(),
        }
    }

    /// Whether the synthetic camera is enabled via environment variable.
    pub fn is_enabled() -> bool {
        std::env::var("DUMMY_CAMERA").is_ok_and(|v| v == "1" || v == "true")
    }

    /// Describe a synthetic device offering VGA, 720p and 1080p.
    pub fn device(id: &str, facing: LensFacing) -> CameraDevice {
        let formats = [(640, 480), (1280, 720), (1920, 1080)]
            .into_iter()
            .map(|(width, height)| FormatDescriptor {
                width,
                height,
                fps: 30.0,
                pixel_format: ChromaLayout::Nv21.name().to_string(),
            })
            .collect();
        CameraDevice {
            id: DeviceId::new(id),
            name: format!("Synthetic {} camera", facing.as_str()),
            facing,
            formats,
        }
    }

    pub fn with_fps(mut self, fps: f32) -> Self {
        self.behaviour.fps = fps.max(0.1);
        self
    }

    pub fn with_chroma(mut self, chroma: ChromaLayout) -> Self {
        self.behaviour.chroma = chroma;
        self
    }

    /// Pad every plane row with `bytes` of garbage, like sensors that align
    /// rows to a hardware boundary.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.behaviour.row_padding = bytes;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.behaviour.open_delay = delay;
        self
    }

    pub fn failing_open(mut self, reason: &str) -> Self {
        self.behaviour.open_failure = Some(reason.to_string());
        self
    }

    pub fn failing_configure(mut self, reason: &str) -> Self {
        self.behaviour.configure_failure = Some(reason.to_string());
        self
    }

    /// Accept the open request but never report back.
    pub fn unresponsive(mut self) -> Self {
        self.behaviour.unresponsive = true;
        self
    }

    /// Report a disconnect after `frames` images.
    pub fn disconnecting_after(mut self, frames: u64) -> Self {
        self.behaviour.disconnect_after = Some(frames);
        self
    }
}

impl CameraBackend for SyntheticBackend {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    fn open_device(&self, id: &DeviceId, events: DeviceEventSink) -> Result<Box<dyn DeviceHandle>> {
        let device = self
            .devices
            .iter()
            .find(|d| &d.id == id)
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_string()))?;

        let (requests_tx, requests_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let sensor = Sensor {
            behaviour: self.behaviour.clone(),
            formats: device.formats.clone(),
            events,
            requests: requests_rx,
            running: Arc::clone(&running),
        };
        let thread = std::thread::Builder::new()
            .name(format!("sensor-{id}"))
            .spawn(move || sensor.run())
            .map_err(|e| CameraError::DeviceOpenFailed(format!("sensor thread: {e}")))?;

        Ok(Box::new(SyntheticDevice {
            id: id.clone(),
            requests: Some(requests_tx),
            running,
            thread: Some(thread),
        }))
    }
}

/// Handle to an opened synthetic device.
pub struct SyntheticDevice {
    id: DeviceId,
    requests: Option<Sender<Size>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceHandle for SyntheticDevice {
    fn configure(&mut self, size: Size) -> Result<()> {
        self.requests
            .as_ref()
            .and_then(|tx| tx.send(size).ok())
            .ok_or_else(|| CameraError::SessionConfigureFailed(format!("{} is closed", self.id)))
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.requests = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(device = %self.id, "synthetic device closed");
        }
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct Sensor {
    behaviour: SensorBehaviour,
    formats: Vec<FormatDescriptor>,
    events: DeviceEventSink,
    requests: Receiver<Size>,
    running: Arc<AtomicBool>,
}

impl Sensor {
    fn run(self) {
        if !self.sleep(self.behaviour.open_delay) {
            return;
        }
        if self.behaviour.unresponsive {
            while self.running.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_INTERVAL);
            }
            return;
        }
        if let Some(reason) = &self.behaviour.open_failure {
            (self.events)(DeviceEvent::OpenFailed(reason.clone()));
            return;
        }
        (self.events)(DeviceEvent::Opened);

        let Some(requested) = self.wait_for_configure() else {
            return;
        };
        if let Some(reason) = &self.behaviour.configure_failure {
            (self.events)(DeviceEvent::ConfigureFailed(reason.clone()));
            return;
        }
        let size = closest_size(&self.formats, requested);
        (self.events)(DeviceEvent::Configured(size));
        self.stream(size);
    }

    fn wait_for_configure(&self) -> Option<Size> {
        while self.running.load(Ordering::Relaxed) {
            match self.requests.recv_timeout(POLL_INTERVAL) {
                Ok(size) => return Some(size),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    fn stream(&self, size: Size) {
        let interval = Duration::from_secs_f32(1.0 / self.behaviour.fps);
        let mut index = 0u64;
        while self.running.load(Ordering::Relaxed) {
            if self.behaviour.disconnect_after == Some(index) {
                (self.events)(DeviceEvent::Disconnected);
                return;
            }
            match test_pattern(size, index, self.behaviour.chroma, self.behaviour.row_padding) {
                Ok(frame) => (self.events)(DeviceEvent::Image(frame)),
                Err(e) => {
                    warn!("synthetic sensor produced an invalid frame: {e}");
                    (self.events)(DeviceEvent::Error(e.to_string()));
                    return;
                }
            }
            index += 1;
            if !self.sleep(interval) {
                return;
            }
        }
    }

    /// Sleep for `duration` in short steps. Returns false if closed meanwhile.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

/// Render frame `index` of the moving test pattern: a diagonal luma ramp
/// with a bright square sliding left to right over a chroma gradient.
pub fn test_pattern(
    size: Size,
    index: u64,
    chroma: ChromaLayout,
    row_padding: usize,
) -> edge_pixels::Result<Frame> {
    let (w, h) = (size.width as usize, size.height as usize);
    let layout = chroma.layout(size, row_padding);
    let mut data = vec![0u8; layout.required_len(size.width, size.height)];

    let shift = (index as usize).wrapping_mul(4);
    let side = (w.min(h) / 4).max(1);
    let box_x = if w > side { shift % (w - side) } else { 0 };
    let box_y = h.saturating_sub(side) / 2;
    for row in 0..h {
        for col in 0..w {
            let inside =
                (box_x..box_x + side).contains(&col) && (box_y..box_y + side).contains(&row);
            data[layout.y.index(col, row)] = if inside {
                235
            } else {
                16 + ((col + row + shift) % 200) as u8
            };
        }
    }

    let (cw, ch) = edge_pixels::frame::chroma_dimensions(size.width, size.height);
    for row in 0..ch {
        for col in 0..cw {
            data[layout.u.index(col, row)] = (64 + col * 128 / cw) as u8;
            data[layout.v.index(col, row)] = (64 + row * 128 / ch) as u8;
        }
    }

    Frame::new(
        size.width,
        size.height,
        PixelFormat::Yuv420(layout),
        data,
        Instant::now(),
    )
}
