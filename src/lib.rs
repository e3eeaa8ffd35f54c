pub mod camera;
pub mod diagnostics;
pub mod logging;
pub mod preview;
pub mod settings;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use camera::backend::CameraBackend;
use camera::permission::{PermissionDecision, PermissionGate};
use camera::synthetic::SyntheticBackend;
use preview::controller::{PreviewController, PreviewError};
use preview::gpu::{GpuSink, GpuSurface};
use preview::raster::{PixelCanvas, RasterSink};
use preview::sink::FrameSink;
use settings::store::SettingsStore;
use settings::types::PreviewSettings;

/// Set to `1` to present through the GPU instead of the raster canvas.
pub const GPU_ENV: &str = "EDGEVIEWER_GPU";

/// How long the preview runs before exiting, in seconds.
pub const RUN_SECS_ENV: &str = "EDGEVIEWER_RUN_SECS";

const DEFAULT_RUN_SECS: u64 = 5;

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Preview(#[from] PreviewError),
}

/// Create the camera backend.
///
/// Only the synthetic camera ships with this crate; `DUMMY_CAMERA=1` makes
/// that explicit and silences the warning.
fn create_backend() -> Arc<dyn CameraBackend> {
    if !SyntheticBackend::is_enabled() {
        warn!("no native camera backend on this platform, using the synthetic camera");
    }
    Arc::new(SyntheticBackend::new())
}

fn gpu_requested() -> bool {
    std::env::var(GPU_ENV).is_ok_and(|v| v == "1" || v == "true")
}

fn run_duration() -> Duration {
    let secs = std::env::var(RUN_SECS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RUN_SECS);
    Duration::from_secs(secs)
}

/// Run the headless preview: open the camera from saved settings, stream
/// into the chosen sink and log diagnostics until Ctrl-C or the run time
/// elapses.
pub fn run() -> Result<(), RunError> {
    logging::init();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_preview())
}

async fn run_preview() -> Result<(), RunError> {
    let store = Arc::new(SettingsStore::new(SettingsStore::default_path()));
    let debounce = store.start_debounce_task();
    let settings = store.get();
    info!(
        path = %store.path().display(),
        filter = settings.filter_mode().as_str(),
        "settings loaded"
    );

    let backend = create_backend();
    let permission: Arc<dyn PermissionGate> = Arc::new(PermissionDecision::Granted);

    let result = if gpu_requested() {
        match tokio::task::block_in_place(GpuSink::new) {
            Ok(sink) => {
                let adapter = sink.adapter_info();
                info!(
                    adapter = %adapter.name,
                    backend = ?adapter.backend,
                    "presenting through the GPU"
                );
                let controller = PreviewController::new(backend, sink, Some(permission))?;
                drive(controller, GpuSurface::Offscreen, &settings).await
            }
            Err(e) => {
                warn!("GPU presentation unavailable, falling back to raster: {e}");
                drive_raster(backend, permission, &settings).await
            }
        }
    } else {
        drive_raster(backend, permission, &settings).await
    };

    debounce.abort();
    if let Err(e) = store.flush() {
        warn!("Failed to save settings: {e}");
    }
    result
}

async fn drive_raster(
    backend: Arc<dyn CameraBackend>,
    permission: Arc<dyn PermissionGate>,
    settings: &PreviewSettings,
) -> Result<(), RunError> {
    let sink = RasterSink::<PixelCanvas>::new();
    let controller = PreviewController::new(backend, sink, Some(permission))?;
    drive(controller, PixelCanvas::default(), settings).await
}

async fn drive<S>(
    mut controller: PreviewController<S>,
    surface: S::Surface,
    settings: &PreviewSettings,
) -> Result<(), RunError>
where
    S: FrameSink + Send + 'static,
    S::Surface: Send + 'static,
{
    let size = settings.preferred_size;
    controller.attach_surface(surface, size.width, size.height);
    // Opening the device and joining the session threads block.
    let device = tokio::task::block_in_place(|| controller.start_preview(settings))?;
    info!(device = %device.name, "streaming; press Ctrl-C to stop");

    let deadline = tokio::time::sleep(run_duration());
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(DIAGNOSTICS_INTERVAL);

    let outcome: Result<(), RunError> = loop {
        tokio::select! {
            _ = &mut deadline => break Ok(()),
            _ = &mut ctrl_c => {
                info!("interrupted");
                break Ok(());
            }
            _ = ticker.tick() => {
                let diagnostics = controller.diagnostics();
                info!(
                    state = ?diagnostics.state,
                    fps = diagnostics.capture.fps,
                    drops = diagnostics.capture.drop_count,
                    drawn = diagnostics.present.drawn,
                    overwritten = diagnostics.present.overwritten,
                    resolution = diagnostics.capture.resolution.as_deref().unwrap_or("-"),
                    "preview diagnostics"
                );
                if let Some(e) = controller.last_failure() {
                    break Err(PreviewError::from(e).into());
                }
            }
        }
    };

    tokio::task::block_in_place(|| controller.shutdown());
    outcome
}
