use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use edge_pixels::Frame;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::preview::mailbox::FrameMailbox;
use crate::preview::sink::{FrameSink, PresentError, PresentFormat, TargetState};

/// How long the render thread sleeps when nothing happens. Only bounds how
/// quickly shutdown is noticed if a wake-up is missed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Display-surface lifecycle notifications from the host.
pub enum SurfaceEvent<T> {
    Attach { surface: T, width: u32, height: u32 },
    Resize { width: u32, height: u32 },
    Detach,
}

#[derive(Default)]
struct Counters {
    drawn: AtomicU64,
    dropped_detached: AtomicU64,
    reallocations: AtomicU64,
    failures: AtomicU64,
}

/// Presenter counters for logging and serialisation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentSnapshot {
    /// Frames handed to the mailbox.
    pub submitted: u64,
    /// Frames replaced in the mailbox before the render thread took them.
    pub overwritten: u64,
    pub drawn: u64,
    pub dropped_while_detached: u64,
    pub reallocations: u64,
    pub failures: u64,
    pub surface_attached: bool,
}

struct Shared<T> {
    surface_events: Mutex<VecDeque<SurfaceEvent<T>>>,
    shutdown: AtomicBool,
    attached: AtomicBool,
    counters: Counters,
}

/// Cloneable entry point for producers; used from the capture thread.
#[derive(Clone)]
pub struct PresentHandle {
    mailbox: Arc<FrameMailbox>,
}

impl PresentHandle {
    /// Hand `frame` to the render thread without blocking. Any frame still
    /// waiting in the mailbox is discarded.
    pub fn present(&self, frame: Frame) {
        self.mailbox.put(frame);
    }
}

/// Render-on-demand presenter.
///
/// Owns a dedicated render thread that holds the [`FrameSink`] (and with it
/// every graphics object) for its whole life. The thread sleeps until a frame
/// or a surface event arrives, so nothing is drawn while the camera is idle.
pub struct Presenter<S: FrameSink> {
    mailbox: Arc<FrameMailbox>,
    shared: Arc<Shared<S::Surface>>,
    thread: Option<JoinHandle<S>>,
}

impl<S> Presenter<S>
where
    S: FrameSink + Send + 'static,
    S::Surface: Send + 'static,
{
    /// Move `sink` onto a new render thread.
    pub fn spawn(sink: S) -> Result<Self, PresentError> {
        let mailbox = Arc::new(FrameMailbox::new());
        let shared = Arc::new(Shared {
            surface_events: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
            attached: AtomicBool::new(sink.is_attached()),
            counters: Counters::default(),
        });

        let thread = {
            let mailbox = Arc::clone(&mailbox);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("render".to_string())
                .spawn(move || render_loop(sink, &mailbox, &shared))
                .map_err(|e| PresentError::Backend(format!("failed to spawn render thread: {e}")))?
        };

        Ok(Self {
            mailbox,
            shared,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> PresentHandle {
        PresentHandle {
            mailbox: Arc::clone(&self.mailbox),
        }
    }

    pub fn present(&self, frame: Frame) {
        self.mailbox.put(frame);
    }

    pub fn attach_surface(&self, surface: S::Surface, width: u32, height: u32) {
        self.push_event(SurfaceEvent::Attach {
            surface,
            width,
            height,
        });
    }

    pub fn resize_surface(&self, width: u32, height: u32) {
        self.push_event(SurfaceEvent::Resize { width, height });
    }

    /// Drop the display surface. Frames arriving until the next attach are
    /// discarded.
    pub fn detach_surface(&self) {
        self.push_event(SurfaceEvent::Detach);
    }

    fn push_event(&self, event: SurfaceEvent<S::Surface>) {
        self.shared.surface_events.lock().push_back(event);
        self.mailbox.wake();
    }

    pub fn snapshot(&self) -> PresentSnapshot {
        let c = &self.shared.counters;
        PresentSnapshot {
            submitted: self.mailbox.sequence(),
            overwritten: self.mailbox.overwritten(),
            drawn: c.drawn.load(Ordering::Relaxed),
            dropped_while_detached: c.dropped_detached.load(Ordering::Relaxed),
            reallocations: c.reallocations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            surface_attached: self.shared.attached.load(Ordering::Relaxed),
        }
    }

    /// Stop the render thread and hand the sink back.
    pub fn shutdown(mut self) -> Option<S> {
        self.stop()
    }

    fn stop(&mut self) -> Option<S> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.mailbox.wake();
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(sink) => Some(sink),
            Err(_) => {
                warn!("render thread panicked");
                None
            }
        }
    }
}

impl<S: FrameSink> Drop for Presenter<S> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.mailbox.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn render_loop<S: FrameSink>(
    mut sink: S,
    mailbox: &FrameMailbox,
    shared: &Shared<S::Surface>,
) -> S {
    debug!("render thread started");
    loop {
        let frame = mailbox.wait_take(IDLE_POLL);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let events: Vec<_> = shared.surface_events.lock().drain(..).collect();
        for event in events {
            handle_surface_event(&mut sink, event, shared);
        }

        if let Some(frame) = frame {
            present_frame(&mut sink, &frame, shared);
        }
    }
    sink.detach();
    shared.attached.store(false, Ordering::Relaxed);
    debug!("render thread exiting");
    sink
}

fn handle_surface_event<S: FrameSink>(
    sink: &mut S,
    event: SurfaceEvent<S::Surface>,
    shared: &Shared<S::Surface>,
) {
    match event {
        SurfaceEvent::Attach {
            surface,
            width,
            height,
        } => match sink.attach(surface, width, height) {
            Ok(()) => {
                info!(width, height, "display surface attached");
                shared.attached.store(true, Ordering::Relaxed);
                redraw(sink, shared);
            }
            Err(e) => {
                warn!("failed to attach display surface: {e}");
                shared.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        },
        SurfaceEvent::Resize { width, height } => {
            sink.resize(width, height);
            redraw(sink, shared);
        }
        SurfaceEvent::Detach => {
            sink.detach();
            shared.attached.store(false, Ordering::Relaxed);
            info!("display surface detached, presentation paused");
        }
    }
}

/// Show the last uploaded content again, e.g. on a fresh surface.
fn redraw<S: FrameSink>(sink: &mut S, shared: &Shared<S::Surface>) {
    if !sink.is_attached() || sink.target() == TargetState::Uninitialized {
        return;
    }
    if let Err(e) = sink.draw() {
        handle_failure(sink, e, shared);
    }
}

fn present_frame<S: FrameSink>(sink: &mut S, frame: &Frame, shared: &Shared<S::Surface>) {
    if !sink.is_attached() {
        shared.counters.dropped_detached.fetch_add(1, Ordering::Relaxed);
        return;
    }
    match upload_and_draw(sink, frame, &shared.counters) {
        Ok(()) => {
            shared.counters.drawn.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => handle_failure(sink, e, shared),
    }
}

fn upload_and_draw<S: FrameSink>(
    sink: &mut S,
    frame: &Frame,
    counters: &Counters,
) -> Result<(), PresentError> {
    let format = PresentFormat::of(frame.format())?;
    let (width, height) = frame.dimensions();
    if !sink.target().fits(width, height, format) {
        sink.ensure_target(width, height, format)?;
        counters.reallocations.fetch_add(1, Ordering::Relaxed);
        debug!(width, height, ?format, "render target allocated");
    }
    sink.upload(frame)?;
    sink.draw()
}

fn handle_failure<S: FrameSink>(sink: &mut S, error: PresentError, shared: &Shared<S::Surface>) {
    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
    if error == PresentError::SurfaceLost {
        warn!("display surface lost, presentation paused until a new surface is attached");
        sink.detach();
        shared.attached.store(false, Ordering::Relaxed);
    } else {
        warn!("failed to present frame: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Sink that remembers what it drew.
    #[derive(Default)]
    struct RecordingSink {
        attached: bool,
        target: Option<(u32, u32, PresentFormat)>,
        uploaded: Option<(Instant, Vec<u8>)>,
        drawn: Vec<(Instant, Vec<u8>)>,
        draw_delay: Duration,
        lose_surface_on_draw: bool,
    }

    impl FrameSink for RecordingSink {
        type Surface = ();

        fn attach(&mut self, _: (), _: u32, _: u32) -> Result<(), PresentError> {
            self.attached = true;
            Ok(())
        }

        fn resize(&mut self, _: u32, _: u32) {}

        fn detach(&mut self) {
            self.attached = false;
        }

        fn is_attached(&self) -> bool {
            self.attached
        }

        fn ensure_target(
            &mut self,
            width: u32,
            height: u32,
            format: PresentFormat,
        ) -> Result<(), PresentError> {
            self.target = Some((width, height, format));
            Ok(())
        }

        fn upload(&mut self, frame: &Frame) -> Result<(), PresentError> {
            self.target().check(frame)?;
            self.uploaded = Some((frame.timestamp(), frame.data().to_vec()));
            Ok(())
        }

        fn draw(&mut self) -> Result<(), PresentError> {
            if self.lose_surface_on_draw {
                self.lose_surface_on_draw = false;
                return Err(PresentError::SurfaceLost);
            }
            std::thread::sleep(self.draw_delay);
            let content = self.uploaded.clone().ok_or(PresentError::NoTarget)?;
            self.drawn.push(content);
            Ok(())
        }

        fn target(&self) -> TargetState {
            match self.target {
                Some((width, height, format)) => TargetState::Ready {
                    width,
                    height,
                    format,
                },
                None => TargetState::Uninitialized,
            }
        }
    }

    fn frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::luma(width, height, vec![value; (width * height) as usize], Instant::now()).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn rapid_frames_never_queue_more_than_one() {
        let sink = RecordingSink {
            draw_delay: Duration::from_millis(3),
            ..Default::default()
        };
        let presenter = Presenter::spawn(sink).unwrap();
        presenter.attach_surface((), 8, 8);
        wait_until(|| presenter.snapshot().surface_attached);

        let handle = presenter.handle();
        const N: u8 = 200;
        for i in 0..N {
            handle.present(frame(4, 4, i));
        }
        wait_until(|| {
            let s = presenter.snapshot();
            s.drawn + s.overwritten == u64::from(N)
        });

        let snapshot = presenter.snapshot();
        let sink = presenter.shutdown().unwrap();
        assert!(sink.drawn.len() <= N as usize);
        assert_eq!(snapshot.submitted, u64::from(N));
        assert!(snapshot.overwritten > 0, "a slow sink must see overwrites");
        assert!(sink.drawn.windows(2).all(|w| w[0].0 <= w[1].0));
        let mut values: Vec<u8> = sink.drawn.iter().map(|(_, data)| data[0]).collect();
        let before = values.len();
        values.dedup();
        assert_eq!(values.len(), before, "a frame was drawn twice");
        assert_eq!(*values.last().unwrap(), N - 1);
    }

    #[test]
    fn frames_are_dropped_while_detached() {
        let presenter = Presenter::spawn(RecordingSink::default()).unwrap();
        presenter.present(frame(2, 2, 1));
        wait_until(|| presenter.snapshot().dropped_while_detached == 1);
        let sink = presenter.shutdown().unwrap();
        assert!(sink.drawn.is_empty());
        assert_eq!(sink.target(), TargetState::Uninitialized);
    }

    #[test]
    fn dimension_change_reallocates_target() {
        let presenter = Presenter::spawn(RecordingSink::default()).unwrap();
        presenter.attach_surface((), 4, 4);
        wait_until(|| presenter.snapshot().surface_attached);
        presenter.present(frame(2, 2, 1));
        wait_until(|| presenter.snapshot().drawn == 1);
        presenter.present(frame(2, 2, 2));
        wait_until(|| presenter.snapshot().drawn == 2);
        presenter.present(frame(3, 1, 3));
        wait_until(|| presenter.snapshot().drawn == 3);

        assert_eq!(presenter.snapshot().reallocations, 2);
        let sink = presenter.shutdown().unwrap();
        assert_eq!(
            sink.target(),
            TargetState::Ready {
                width: 3,
                height: 1,
                format: PresentFormat::Luma
            }
        );
    }

    #[test]
    fn lost_surface_pauses_until_reattached() {
        let sink = RecordingSink {
            lose_surface_on_draw: true,
            ..Default::default()
        };
        let presenter = Presenter::spawn(sink).unwrap();
        presenter.attach_surface((), 4, 4);
        wait_until(|| presenter.snapshot().surface_attached);

        presenter.present(frame(2, 2, 1));
        wait_until(|| presenter.snapshot().failures == 1);
        assert!(!presenter.snapshot().surface_attached);

        presenter.present(frame(2, 2, 2));
        wait_until(|| presenter.snapshot().dropped_while_detached == 1);

        // Reattaching redraws the last uploaded content without a new frame.
        presenter.attach_surface((), 4, 4);
        wait_until(|| presenter.snapshot().surface_attached);
        let sink = presenter.shutdown().unwrap();
        assert_eq!(sink.drawn.len(), 1);
        assert_eq!(sink.drawn[0].1[0], 1);
    }

    #[test]
    fn unsupported_frames_count_as_failures() {
        let presenter = Presenter::spawn(RecordingSink::default()).unwrap();
        presenter.attach_surface((), 4, 4);
        wait_until(|| presenter.snapshot().surface_attached);
        let planar = edge_pixels::Frame::new(
            2,
            2,
            edge_pixels::PixelFormat::Yuv420(edge_pixels::Yuv420Layout::i420(2, 2, 0)),
            vec![0; 6],
            Instant::now(),
        )
        .unwrap();
        presenter.present(planar);
        wait_until(|| presenter.snapshot().failures == 1);
        assert!(presenter.snapshot().surface_attached);
    }

    #[test]
    fn shutdown_returns_the_sink_detached() {
        let presenter = Presenter::spawn(RecordingSink::default()).unwrap();
        presenter.attach_surface((), 1, 1);
        wait_until(|| presenter.snapshot().surface_attached);
        let sink = presenter.shutdown().unwrap();
        assert!(!sink.is_attached());
    }
}
