use std::time::{Duration, Instant};

use edge_pixels::{filter, FilterMode, Frame};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::preview::raster::{RasterCanvas, RasterSink};
use crate::preview::sink::{FrameSink, PresentError, PresentFormat};
use crate::web::media::{MediaConstraints, MediaDevices, MediaError, VideoTrack};
use crate::web::scheduler::{AnimationScheduler, FrameRequestId};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// What the page shows next to the canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebStatus {
    pub running: bool,
    /// `"WxH"` of the last drawn frame.
    pub resolution: Option<String>,
    /// Frames drawn per second over the last full window.
    pub fps: Option<f64>,
    /// User-visible reason the preview is not running.
    pub error: Option<String>,
}

impl WebStatus {
    pub fn fps_label(&self) -> String {
        match self.fps {
            Some(fps) => format!("{fps:.0}"),
            None => "N/A".to_string(),
        }
    }
}

#[derive(Debug)]
struct FpsCounter {
    window_start: Option<Instant>,
    frames: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            window_start: None,
            frames: 0,
        }
    }

    /// Count a drawn frame; returns a new rate when a window completes.
    fn tick(&mut self, now: Instant) -> Option<f64> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < FPS_WINDOW {
            return None;
        }
        let fps = f64::from(self.frames - 1) / elapsed.as_secs_f64();
        self.window_start = Some(now);
        self.frames = 1;
        Some(fps)
    }
}

/// Single-threaded camera preview for the page.
///
/// All work happens inside [`on_animation_frame`](WebPreview::on_animation_frame):
/// grab the track's current frame, filter it, draw it, ask for the next
/// display frame. At most one request is outstanding at a time.
pub struct WebPreview<M, A, C> {
    media: M,
    scheduler: A,
    sink: RasterSink<C>,
    track: Option<Box<dyn VideoTrack>>,
    pending: Option<FrameRequestId>,
    filter: FilterMode,
    fps: FpsCounter,
    status: WebStatus,
}

impl<M, A, C> WebPreview<M, A, C>
where
    M: MediaDevices,
    A: AnimationScheduler,
    C: RasterCanvas,
{
    pub fn new(media: M, scheduler: A, canvas: C) -> Self {
        Self {
            media,
            scheduler,
            sink: RasterSink::with_canvas(canvas),
            track: None,
            pending: None,
            filter: FilterMode::None,
            fps: FpsCounter::new(),
            status: WebStatus::default(),
        }
    }

    /// Request the camera and start drawing. A rejection is reported in
    /// [`status`](WebPreview::status) as well as returned.
    pub fn start(&mut self, constraints: &MediaConstraints) -> Result<(), MediaError> {
        self.stop();
        let track = match self.media.get_user_media(constraints) {
            Ok(track) => track,
            Err(e) => {
                warn!("camera request rejected: {e:?}");
                self.status.error = Some(e.to_string());
                return Err(e);
            }
        };
        info!(size = %track.settings(), "camera track started");
        self.track = Some(track);
        self.fps = FpsCounter::new();
        self.status = WebStatus {
            running: true,
            ..WebStatus::default()
        };
        self.pending = Some(self.scheduler.request_frame());
        Ok(())
    }

    /// Cancel the outstanding frame request and stop the track. Idempotent.
    pub fn stop(&mut self) {
        if let Some(id) = self.pending.take() {
            self.scheduler.cancel(id);
        }
        if let Some(mut track) = self.track.take() {
            track.stop();
            debug!("camera track stopped");
        }
        self.status.running = false;
        self.status.fps = None;
    }

    /// Display-frame callback. Returns whether a frame was drawn.
    pub fn on_animation_frame(&mut self, id: FrameRequestId, now: Instant) -> bool {
        if self.pending != Some(id) {
            debug!(id = id.get(), "ignoring stale frame request");
            return false;
        }
        self.pending = None;

        let Some(track) = self.track.as_mut() else {
            return false;
        };
        let frame = track.grab_frame();
        if !track.is_live() {
            warn!("camera track ended");
            self.stop();
            self.status.error = Some("The camera stopped sending video.".to_string());
            return false;
        }

        let drawn = match frame {
            Some(frame) => self.draw(frame, now),
            None => false,
        };
        self.pending = Some(self.scheduler.request_frame());
        drawn
    }

    fn draw(&mut self, frame: Frame, now: Instant) -> bool {
        let filtered = match filter::apply(frame, self.filter) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to filter frame: {e}");
                return false;
            }
        };
        let (width, height) = filtered.dimensions();
        if let Err(e) = self.present(&filtered) {
            warn!("failed to draw frame: {e}");
            return false;
        }
        self.status.resolution = Some(format!("{width}x{height}"));
        if let Some(fps) = self.fps.tick(now) {
            self.status.fps = Some(fps);
        }
        true
    }

    fn present(&mut self, frame: &Frame) -> Result<(), PresentError> {
        let format = PresentFormat::of(frame.format())?;
        self.sink.ensure_target(frame.width(), frame.height(), format)?;
        self.sink.upload(frame)?;
        self.sink.draw()
    }

    /// Takes effect from the next display frame.
    pub fn set_filters(&mut self, grayscale: bool, edges: bool) {
        self.filter = FilterMode::from_toggles(grayscale, edges);
    }

    pub fn filter(&self) -> FilterMode {
        self.filter
    }

    pub fn status(&self) -> &WebStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.track.is_some()
    }

    pub fn canvas(&self) -> Option<&C> {
        self.sink.canvas()
    }

    pub fn scheduler_mut(&mut self) -> &mut A {
        &mut self.scheduler
    }

    pub fn media(&self) -> &M {
        &self.media
    }
}

impl<M, A, C> Drop for WebPreview<M, A, C> {
    fn drop(&mut self) {
        if let Some(mut track) = self.track.take() {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::Size;
    use crate::preview::raster::PixelCanvas;
    use crate::web::media::SyntheticMediaDevices;
    use crate::web::scheduler::ManualScheduler;

    type TestPreview = WebPreview<SyntheticMediaDevices, ManualScheduler, PixelCanvas>;

    fn web_preview(media: SyntheticMediaDevices) -> TestPreview {
        WebPreview::new(media, ManualScheduler::new(), PixelCanvas::default())
    }

    fn constraints() -> MediaConstraints {
        MediaConstraints {
            ideal_size: Size::new(8, 6),
            ..MediaConstraints::default()
        }
    }

    /// Fire every due request, as the browser does at the start of a
    /// display frame.
    fn fire(preview: &mut TestPreview, now: Instant) -> Vec<bool> {
        let due = preview.scheduler_mut().take_due();
        due.into_iter().map(|id| preview.on_animation_frame(id, now)).collect()
    }

    #[test]
    fn draws_once_per_display_frame() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.start(&constraints()).unwrap();
        assert_eq!(preview.scheduler_mut().pending().len(), 1);

        let now = Instant::now();
        assert_eq!(fire(&mut preview, now), vec![true]);
        assert_eq!(fire(&mut preview, now + Duration::from_millis(16)), vec![true]);

        let canvas = preview.canvas().unwrap();
        assert_eq!(canvas.blits(), 2);
        assert_eq!(canvas.dimensions(), (8, 6));
        assert_eq!(preview.status().resolution.as_deref(), Some("8x6"));
        assert!(preview.status().running);
        assert_eq!(preview.scheduler_mut().pending().len(), 1);
    }

    #[test]
    fn stale_request_is_ignored() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.start(&constraints()).unwrap();
        let first = preview.scheduler_mut().take_due()[0];
        assert!(preview.on_animation_frame(first, Instant::now()));

        assert!(!preview.on_animation_frame(first, Instant::now()));
        assert_eq!(preview.canvas().unwrap().blits(), 1);
        assert_eq!(preview.scheduler_mut().pending().len(), 1);
    }

    #[test]
    fn stop_cancels_the_request_and_stops_the_track() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.start(&constraints()).unwrap();
        let outstanding = preview.scheduler_mut().pending()[0];
        assert_eq!(preview.media().live_tracks(), 1);

        preview.stop();
        preview.stop();
        assert!(preview.scheduler_mut().pending().is_empty());
        assert_eq!(preview.media().live_tracks(), 0);
        assert!(!preview.is_running());
        assert!(!preview.on_animation_frame(outstanding, Instant::now()));
        assert_eq!(preview.canvas().unwrap().blits(), 0);
    }

    #[test]
    fn restart_replaces_the_previous_track() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.start(&constraints()).unwrap();
        preview.start(&constraints()).unwrap();
        assert_eq!(preview.media().live_tracks(), 1);
        assert_eq!(preview.scheduler_mut().pending().len(), 1);
        assert_eq!(fire(&mut preview, Instant::now()), vec![true]);
    }

    #[test]
    fn rejection_is_reported_without_starting() {
        for error in [
            MediaError::NotFound,
            MediaError::NotAllowed,
            MediaError::NotReadable,
            MediaError::Other("device busy".into()),
        ] {
            let mut preview = web_preview(SyntheticMediaDevices::rejecting(error.clone()));
            assert_eq!(preview.start(&constraints()), Err(error.clone()));
            assert_eq!(preview.status().error, Some(error.to_string()));
            assert!(!preview.status().running);
            assert!(preview.scheduler_mut().pending().is_empty());
        }
    }

    #[test]
    fn edge_filter_applies_inside_the_callback() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.set_filters(true, true);
        assert_eq!(preview.filter(), FilterMode::EdgeDetect);
        preview.start(&constraints()).unwrap();
        fire(&mut preview, Instant::now());

        let canvas = preview.canvas().unwrap();
        assert_eq!(canvas.pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(canvas.pixel(7, 5), Some([0, 0, 0, 255]));
    }

    #[test]
    fn grayscale_filter_draws_grey_pixels() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.set_filters(true, false);
        preview.start(&constraints()).unwrap();
        fire(&mut preview, Instant::now());

        for px in preview.canvas().unwrap().pixels().chunks_exact(4) {
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn ended_track_stops_the_loop() {
        let mut preview = web_preview(SyntheticMediaDevices::new().ending_after(1));
        preview.start(&constraints()).unwrap();
        let now = Instant::now();
        assert_eq!(fire(&mut preview, now), vec![true]);
        assert_eq!(fire(&mut preview, now), vec![false]);

        assert!(!preview.is_running());
        assert!(preview.status().error.is_some());
        assert!(preview.scheduler_mut().pending().is_empty());
    }

    #[test]
    fn fps_is_reported_after_a_full_window() {
        let mut preview = web_preview(SyntheticMediaDevices::new());
        preview.start(&constraints()).unwrap();
        assert_eq!(preview.status().fps_label(), "N/A");

        let start = Instant::now();
        for i in 0..=50u64 {
            fire(&mut preview, start + Duration::from_millis(20 * i));
        }
        let fps = preview.status().fps.unwrap();
        assert!((fps - 50.0).abs() < 0.01, "fps {fps}");
        assert_eq!(preview.status().fps_label(), "50");
    }

    #[test]
    fn status_serialises_to_camelcase() {
        let status = WebStatus {
            running: true,
            resolution: Some("8x6".into()),
            ..WebStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["resolution"], "8x6");
        assert!(json["fps"].is_null());
    }
}
