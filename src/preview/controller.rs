use std::sync::Arc;

use edge_pixels::{filter, FilterMode, Frame};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::camera::backend::{select_device, CameraBackend};
use crate::camera::error::CameraError;
use crate::camera::permission::{require_camera_access, PermissionGate};
use crate::camera::types::{CameraDevice, SessionState};
use crate::diagnostics::stats::DiagnosticSnapshot;
use crate::preview::capture::{CaptureSession, SessionConfig, SessionStatus, StatusCallback};
use crate::preview::presenter::{PresentHandle, PresentSnapshot, Presenter};
use crate::preview::process::{FrameProcessor, UnavailableProcessor};
use crate::preview::sink::{FrameSink, PresentError, PresentFormat};
use crate::settings::types::PreviewSettings;

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Present(#[from] PresentError),
}

/// What the capture thread does to each frame before presenting it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
    pub filter: FilterMode,
    pub present_format: PresentFormat,
}

/// Combined capture and presentation counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDiagnostics {
    pub state: SessionState,
    pub capture: DiagnosticSnapshot,
    pub present: PresentSnapshot,
}

/// The control layer: starts and stops the camera, switches filters and
/// forwards display-surface events to the presenter.
pub struct PreviewController<S: FrameSink> {
    backend: Arc<dyn CameraBackend>,
    permission: Option<Arc<dyn PermissionGate>>,
    processor: Arc<dyn FrameProcessor>,
    // Declared before the presenter: capture stops before rendering does.
    session: CaptureSession,
    presenter: Presenter<S>,
    options: Arc<Mutex<FrameOptions>>,
    last_status: Arc<Mutex<Option<SessionStatus>>>,
    last_failure: Arc<Mutex<Option<CameraError>>>,
    device: Option<CameraDevice>,
}

impl<S> PreviewController<S>
where
    S: FrameSink + Send + 'static,
    S::Surface: Send + 'static,
{
    /// Spawn the render thread around `sink`. Without a permission gate every
    /// start is refused.
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        sink: S,
        permission: Option<Arc<dyn PermissionGate>>,
    ) -> Result<Self, PreviewError> {
        Ok(Self {
            session: CaptureSession::new(Arc::clone(&backend)),
            backend,
            permission,
            processor: Arc::new(UnavailableProcessor),
            presenter: Presenter::spawn(sink)?,
            options: Arc::default(),
            last_status: Arc::default(),
            last_failure: Arc::default(),
            device: None,
        })
    }

    /// Use `processor` for native processing instead of the unavailable stub.
    pub fn with_processor(mut self, processor: Arc<dyn FrameProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Check permission, pick a camera and start streaming into the presenter.
    ///
    /// Any running preview is stopped first. Returns the opened device.
    pub fn start_preview(
        &mut self,
        settings: &PreviewSettings,
    ) -> Result<CameraDevice, PreviewError> {
        self.stop_preview();
        require_camera_access(self.permission.as_deref())?;

        let devices = self.backend.enumerate_devices()?;
        let device = select_device(&devices, &settings.facing)?;

        {
            let mut options = self.options.lock();
            options.filter = settings.filter_mode();
            options.present_format = settings.present_format;
        }
        *self.last_status.lock() = None;
        *self.last_failure.lock() = None;

        let config = SessionConfig {
            preferred_size: settings.preferred_size,
            processor: settings.process_mode.map(|_| Arc::clone(&self.processor)),
            process_mode: settings.process_mode.unwrap_or_default(),
            inbound_capacity: settings.inbound_queue,
            watchdog: settings.watchdog(),
        };
        let on_frame = frame_pipeline(self.presenter.handle(), Arc::clone(&self.options));
        let last_status = Arc::clone(&self.last_status);
        let last_failure = Arc::clone(&self.last_failure);
        let on_status: StatusCallback = Arc::new(move |status| {
            // The Closing/Closed states that follow a failure must not hide it.
            if let Some(e) = status.error() {
                error!("preview stopped: {e}");
                *last_failure.lock() = Some(e);
            }
            *last_status.lock() = Some(status);
        });

        self.session.start(&device, config, on_frame, Some(on_status))?;
        info!(device = %device.id, name = %device.name, "preview started");
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Stop the camera. The last frame stays on screen.
    pub fn stop_preview(&mut self) {
        self.session.stop();
    }

    pub fn set_filters(&self, grayscale: bool, edges: bool) {
        let filter = FilterMode::from_toggles(grayscale, edges);
        self.options.lock().filter = filter;
        info!(filter = filter.as_str(), "filter changed");
    }

    pub fn set_present_format(&self, format: PresentFormat) {
        self.options.lock().present_format = format;
    }

    pub fn frame_options(&self) -> FrameOptions {
        *self.options.lock()
    }

    pub fn attach_surface(&self, surface: S::Surface, width: u32, height: u32) {
        self.presenter.attach_surface(surface, width, height);
    }

    pub fn resize_surface(&self, width: u32, height: u32) {
        self.presenter.resize_surface(width, height);
    }

    pub fn detach_surface(&self) {
        self.presenter.detach_surface();
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The most recent lifecycle notification of the current session.
    pub fn last_status(&self) -> Option<SessionStatus> {
        self.last_status.lock().clone()
    }

    /// Why the current session ended on its own, if it did. Cleared by
    /// [`start_preview`](PreviewController::start_preview).
    pub fn last_failure(&self) -> Option<CameraError> {
        self.last_failure.lock().clone()
    }

    pub fn device(&self) -> Option<&CameraDevice> {
        self.device.as_ref()
    }

    pub fn diagnostics(&self) -> PreviewDiagnostics {
        PreviewDiagnostics {
            state: self.session.state(),
            capture: self.session.diagnostics(),
            present: self.presenter.snapshot(),
        }
    }

    /// Stop the camera and the render thread, returning the sink.
    pub fn shutdown(mut self) -> Option<S> {
        self.session.stop();
        self.presenter.shutdown()
    }
}

/// Frame callback run on the capture thread: filter, reduce to the
/// presentation format, hand to the render thread.
fn frame_pipeline(
    present: PresentHandle,
    options: Arc<Mutex<FrameOptions>>,
) -> Box<dyn FnMut(Frame) + Send> {
    Box::new(move |frame| {
        let FrameOptions {
            filter: mode,
            present_format,
        } = *options.lock();
        let filtered = filter::apply(frame, mode).and_then(|frame| match present_format {
            PresentFormat::Rgba => Ok(frame),
            PresentFormat::Luma => filter::to_luma8(frame),
        });
        match filtered {
            Ok(frame) => present.present(frame),
            Err(e) => error!("failed to filter frame: {e}"),
        }
    })
}
