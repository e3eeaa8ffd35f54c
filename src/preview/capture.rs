use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use edge_pixels::Frame;

use crate::camera::backend::{CameraBackend, DeviceEvent, DeviceEventSink, DeviceHandle};
use crate::camera::error::{CameraError, Result};
use crate::camera::types::{CameraDevice, DeviceId, SessionState, Size};
use crate::diagnostics::stats::{DiagnosticSnapshot, DiagnosticStats};
use crate::preview::process::{process_or_passthrough, FrameProcessor, ProcessMode};

/// Receives every converted frame, in capture order, on the capture thread.
pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// Receives lifecycle notifications on the capture thread.
pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Why a session ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OpenFailed,
    ConfigureFailed,
    Disconnected,
    DeviceError,
}

/// Lifecycle notification emitted by a [`CaptureSession`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionStatus {
    State {
        device_id: DeviceId,
        state: SessionState,
    },
    /// Terminal failure; emitted once, followed by `Closing` and `Closed`.
    Failed {
        device_id: DeviceId,
        kind: FailureKind,
        message: String,
    },
    /// No image for longer than the frame timeout. Emitted once per stall.
    Stalled { device_id: DeviceId, idle_ms: u64 },
}

impl SessionStatus {
    /// The camera error a failure corresponds to.
    pub fn error(&self) -> Option<CameraError> {
        let Self::Failed { kind, message, .. } = self else {
            return None;
        };
        let message = message.clone();
        Some(match kind {
            FailureKind::OpenFailed => CameraError::DeviceOpenFailed(message),
            FailureKind::ConfigureFailed => CameraError::SessionConfigureFailed(message),
            FailureKind::Disconnected => CameraError::Disconnected(message),
            FailureKind::DeviceError => CameraError::Thread(message),
        })
    }
}

/// Timeouts guarding each phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Maximum wait for the device to report it is open.
    pub open_timeout: Duration,
    /// Maximum wait for the stream configuration to complete.
    pub configure_timeout: Duration,
    /// Streaming with no image for this long is reported as a stall.
    pub frame_timeout: Duration,
    /// How often the capture loop checks timers and the stop flag.
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(30),
            configure_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Per-start session parameters.
#[derive(Clone)]
pub struct SessionConfig {
    pub preferred_size: Size,
    /// Native processing applied after conversion. `None` skips it.
    pub processor: Option<Arc<dyn FrameProcessor>>,
    pub process_mode: ProcessMode,
    /// Images buffered between the device callback and the capture loop.
    /// Images arriving while it is full are dropped.
    pub inbound_capacity: usize,
    pub watchdog: WatchdogConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preferred_size: Size::HD,
            processor: None,
            process_mode: ProcessMode::default(),
            inbound_capacity: 4,
            watchdog: WatchdogConfig::default(),
        }
    }
}

fn claims() -> &'static Mutex<HashSet<DeviceId>> {
    static CLAIMS: OnceLock<Mutex<HashSet<DeviceId>>> = OnceLock::new();
    CLAIMS.get_or_init(Default::default)
}

/// Exclusive hold on a device for the life of one session. Released on drop.
struct DeviceClaim(DeviceId);

impl DeviceClaim {
    fn acquire(id: &DeviceId) -> Result<Self> {
        if claims().lock().insert(id.clone()) {
            Ok(Self(id.clone()))
        } else {
            Err(CameraError::DeviceBusy(id.to_string()))
        }
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claims().lock().remove(&self.0);
    }
}

/// Shared view of the session state, written by the capture thread.
#[derive(Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Closed.as_u8())))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

enum Inbound {
    Device(DeviceEvent),
    /// Sent by `stop()` so the loop notices without waiting for a poll tick.
    Wake,
}

/// One camera stream: open, configure, convert and deliver frames.
///
/// `start` opens the device and spawns a capture thread that owns the
/// device handle. The device's callback pushes events into a bounded
/// channel; the capture thread drains it, drives the state machine and,
/// while streaming, converts each image to RGBA, runs native processing and
/// hands the result to the frame callback.
///
/// The callbacks run on the capture thread and must not call
/// [`stop`](Self::stop) on their own session.
pub struct CaptureSession {
    backend: Arc<dyn CameraBackend>,
    device_id: Option<DeviceId>,
    state: StateCell,
    shutdown: Arc<AtomicBool>,
    wake: Option<SyncSender<Inbound>>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DiagnosticStats>>,
    inbound_drops: Arc<AtomicU64>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            device_id: None,
            state: StateCell::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: None,
            thread: None,
            stats: Arc::new(Mutex::new(DiagnosticStats::new())),
            inbound_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open `device` and begin streaming.
    ///
    /// Fails immediately if the session is not closed, the device is held by
    /// another session, or the backend refuses the open. Failures reported
    /// by the device afterwards arrive through `on_status`.
    pub fn start(
        &mut self,
        device: &CameraDevice,
        config: SessionConfig,
        on_frame: FrameCallback,
        on_status: Option<StatusCallback>,
    ) -> Result<()> {
        let state = self.state.get();
        if state != SessionState::Closed {
            return Err(CameraError::SessionActive(state));
        }
        // A previous run that ended on its own has already released everything.
        self.join_thread();

        let claim = DeviceClaim::acquire(&device.id)?;
        self.shutdown = Arc::new(AtomicBool::new(false));
        self.stats = Arc::new(Mutex::new(DiagnosticStats::new()));
        self.inbound_drops = Arc::new(AtomicU64::new(0));
        self.state.set(SessionState::Opening);

        let (tx, rx) = mpsc::sync_channel(config.inbound_capacity.max(1));
        let events = event_sink(tx.clone(), Arc::clone(&self.inbound_drops));
        let handle = match self.backend.open_device(&device.id, events) {
            Ok(handle) => handle,
            Err(e) => {
                self.state.set(SessionState::Closed);
                warn!(device = %device.id, "failed to open camera: {e}");
                return Err(e);
            }
        };

        let worker = CaptureLoop {
            device_id: device.id.clone(),
            config,
            state: self.state.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
            inbound_drops: Arc::clone(&self.inbound_drops),
            on_frame,
            on_status,
            stalled: false,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", device.id))
            .spawn(move || worker.run(rx, handle, claim));
        match spawned {
            Ok(thread) => {
                info!(device = %device.id, "capture session started");
                self.device_id = Some(device.id.clone());
                self.wake = Some(tx);
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                // The closure (handle and claim included) was dropped by the failed spawn.
                self.state.set(SessionState::Closed);
                Err(CameraError::Thread(format!("failed to spawn capture thread: {e}")))
            }
        }
    }

    /// Stop the session and release the device. Idempotent, and valid in
    /// every state including before the first `start`.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(wake) = self.wake.take() {
            let _ = wake.try_send(Inbound::Wake);
        }
        if self.join_thread() {
            if let Some(id) = &self.device_id {
                info!(device = %id, "capture session stopped");
            }
        }
        self.state.set(SessionState::Closed);
    }

    fn join_thread(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return false;
        };
        if thread.join().is_err() {
            error!("capture thread panicked");
        }
        true
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// The device of the current or most recent start.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device_id.as_ref()
    }

    /// Take a snapshot of diagnostic stats for this session.
    pub fn diagnostics(&self) -> DiagnosticSnapshot {
        let mut stats = self.stats.lock();
        stats.record_drops(self.inbound_drops.swap(0, Ordering::Relaxed));
        stats.snapshot()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Device callback: never blocks on images, which are dropped (and counted)
/// when the capture loop falls behind. Lifecycle events always get through.
fn event_sink(tx: SyncSender<Inbound>, drops: Arc<AtomicU64>) -> DeviceEventSink {
    Box::new(move |event| match event {
        DeviceEvent::Image(frame) => {
            let sent = tx.try_send(Inbound::Device(DeviceEvent::Image(frame)));
            if let Err(TrySendError::Full(_)) = sent {
                drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        other => {
            let _ = tx.send(Inbound::Device(other));
        }
    })
}

/// Why the capture loop returned.
enum Exit {
    Stopped,
    Failed(FailureKind, String),
}

struct CaptureLoop {
    device_id: DeviceId,
    config: SessionConfig,
    state: StateCell,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<DiagnosticStats>>,
    inbound_drops: Arc<AtomicU64>,
    on_frame: FrameCallback,
    on_status: Option<StatusCallback>,
    stalled: bool,
}

impl CaptureLoop {
    fn run(mut self, rx: Receiver<Inbound>, mut handle: Box<dyn DeviceHandle>, claim: DeviceClaim) {
        debug!(device = %self.device_id, "capture thread starting");
        self.emit_state(SessionState::Opening);

        let exit = self.drive(rx, handle.as_mut());
        // The receiver is gone by now, so a device blocked in its callback
        // fails fast instead of deadlocking the close below.
        if let Exit::Failed(kind, message) = &exit {
            warn!(device = %self.device_id, ?kind, "capture session failed: {message}");
            self.emit(SessionStatus::Failed {
                device_id: self.device_id.clone(),
                kind: *kind,
                message: message.clone(),
            });
        }

        self.transition(SessionState::Closing);
        handle.close();
        drop(claim);
        self.transition(SessionState::Closed);
        debug!(device = %self.device_id, "capture thread exiting");
    }

    fn drive(&mut self, rx: Receiver<Inbound>, handle: &mut dyn DeviceHandle) -> Exit {
        let watchdog = self.config.watchdog;
        let mut phase_started = Instant::now();
        let mut last_image = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Exit::Stopped;
            }
            let event = match rx.recv_timeout(watchdog.poll_interval) {
                Ok(Inbound::Device(event)) => Some(event),
                Ok(Inbound::Wake) => continue,
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Exit::Failed(
                        FailureKind::DeviceError,
                        "device event channel closed".to_string(),
                    );
                }
            };
            if self.shutdown.load(Ordering::Acquire) {
                return Exit::Stopped;
            }

            if let Some(event) = event {
                match (self.state.get(), event) {
                    (SessionState::Opening, DeviceEvent::Opened) => {
                        self.transition(SessionState::Configuring);
                        phase_started = Instant::now();
                        if let Err(e) = handle.configure(self.config.preferred_size) {
                            return Exit::Failed(FailureKind::ConfigureFailed, e.to_string());
                        }
                    }
                    (SessionState::Opening, DeviceEvent::OpenFailed(reason)) => {
                        return Exit::Failed(FailureKind::OpenFailed, reason);
                    }
                    (SessionState::Configuring, DeviceEvent::Configured(size)) => {
                        info!(device = %self.device_id, %size, "streaming");
                        self.transition(SessionState::Streaming);
                        last_image = Instant::now();
                    }
                    (SessionState::Configuring, DeviceEvent::ConfigureFailed(reason)) => {
                        return Exit::Failed(FailureKind::ConfigureFailed, reason);
                    }
                    (SessionState::Streaming, DeviceEvent::Image(frame)) => {
                        last_image = Instant::now();
                        self.stalled = false;
                        self.deliver(frame);
                    }
                    (_, DeviceEvent::Image(_)) => {
                        // Images before the stream is configured are not ours to show.
                        self.stats.lock().record_drop();
                    }
                    (_, DeviceEvent::Disconnected) => {
                        return Exit::Failed(
                            FailureKind::Disconnected,
                            format!("{} disconnected", self.device_id),
                        );
                    }
                    (_, DeviceEvent::Error(reason)) => {
                        return Exit::Failed(FailureKind::DeviceError, reason);
                    }
                    (state, event) => {
                        debug!(
                            device = %self.device_id,
                            %state,
                            ?event,
                            "ignoring out-of-order device event"
                        );
                    }
                }
            }

            // A chatty device must not keep the watchdog from firing.
            if let Some(exit) = self.check_timers(self.state.get(), phase_started, last_image) {
                return exit;
            }
        }
    }

    fn check_timers(
        &mut self,
        state: SessionState,
        phase_started: Instant,
        last_image: Instant,
    ) -> Option<Exit> {
        let watchdog = self.config.watchdog;
        match state {
            SessionState::Opening if phase_started.elapsed() >= watchdog.open_timeout => {
                Some(Exit::Failed(
                    FailureKind::OpenFailed,
                    format!(
                        "device did not open within {}ms",
                        watchdog.open_timeout.as_millis()
                    ),
                ))
            }
            SessionState::Configuring if phase_started.elapsed() >= watchdog.configure_timeout => {
                Some(Exit::Failed(
                    FailureKind::ConfigureFailed,
                    format!(
                        "stream not configured within {}ms",
                        watchdog.configure_timeout.as_millis()
                    ),
                ))
            }
            SessionState::Streaming
                if !self.stalled && last_image.elapsed() >= watchdog.frame_timeout =>
            {
                let idle_ms = last_image.elapsed().as_millis() as u64;
                warn!(device = %self.device_id, idle_ms, "watchdog: no frames received");
                self.stalled = true;
                self.emit(SessionStatus::Stalled {
                    device_id: self.device_id.clone(),
                    idle_ms,
                });
                None
            }
            _ => None,
        }
    }

    /// Convert, process and hand one sensor image to the frame callback.
    fn deliver(&mut self, image: Frame) {
        let captured_at = image.timestamp();
        let rgba = match edge_pixels::to_rgba(image) {
            Ok(rgba) => rgba,
            Err(e) => {
                if cfg!(debug_assertions) {
                    panic!("malformed frame from {}: {e}", self.device_id);
                }
                error!(device = %self.device_id, "dropping malformed frame: {e}");
                self.stats.lock().record_drop();
                return;
            }
        };

        // Native processing can be slow; keep the stats lock out of it.
        let (frame, fell_back) = match &self.config.processor {
            Some(processor) => {
                let processed =
                    process_or_passthrough(processor.as_ref(), rgba, self.config.process_mode);
                (processed.frame, processed.fell_back)
            }
            None => (rgba, false),
        };

        {
            let mut stats = self.stats.lock();
            stats.record_drops(self.inbound_drops.swap(0, Ordering::Relaxed));
            if fell_back {
                stats.record_fallback();
            }
            stats.record_frame(frame.data().len(), frame.dimensions(), captured_at);
        }
        (self.on_frame)(frame);
    }

    fn transition(&self, state: SessionState) {
        self.state.set(state);
        self.emit_state(state);
    }

    fn emit_state(&self, state: SessionState) {
        debug!(device = %self.device_id, %state, "session state");
        self.emit(SessionStatus::State {
            device_id: self.device_id.clone(),
            state,
        });
    }

    fn emit(&self, status: SessionStatus) {
        if let Some(cb) = &self.on_status {
            cb(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::synthetic::{test_pattern, ChromaLayout, SyntheticBackend};
    use crate::camera::types::{FormatDescriptor, LensFacing};
    use crate::preview::process::ProcessingError;

    fn tiny_device(id: &str) -> CameraDevice {
        CameraDevice {
            id: DeviceId::new(id),
            name: format!("test {id}"),
            facing: LensFacing::Back,
            formats: vec![FormatDescriptor {
                width: 32,
                height: 24,
                fps: 60.0,
                pixel_format: "nv21".to_string(),
            }],
        }
    }

    fn backend_for(device: &CameraDevice) -> SyntheticBackend {
        SyntheticBackend::with_devices(vec![device.clone()]).with_fps(120.0)
    }

    /// Short durations for watchdog tests.
    fn fast_watchdog() -> WatchdogConfig {
        WatchdogConfig {
            open_timeout: Duration::from_millis(100),
            configure_timeout: Duration::from_millis(100),
            frame_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            preferred_size: Size::new(32, 24),
            watchdog: fast_watchdog(),
            ..SessionConfig::default()
        }
    }

    struct Recorder {
        frames: Arc<Mutex<Vec<Frame>>>,
        statuses: Arc<Mutex<Vec<SessionStatus>>>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                frames: Arc::default(),
                statuses: Arc::default(),
            }
        }

        fn on_frame(&self) -> FrameCallback {
            let frames = Arc::clone(&self.frames);
            Box::new(move |frame| frames.lock().push(frame))
        }

        fn on_status(&self) -> Option<StatusCallback> {
            let statuses = Arc::clone(&self.statuses);
            Some(Arc::new(move |status| statuses.lock().push(status)))
        }

        fn states(&self) -> Vec<SessionState> {
            self.statuses
                .lock()
                .iter()
                .filter_map(|s| match s {
                    SessionStatus::State { state, .. } => Some(*state),
                    _ => None,
                })
                .collect()
        }

        fn failures(&self) -> Vec<FailureKind> {
            self.statuses
                .lock()
                .iter()
                .filter_map(|s| match s {
                    SessionStatus::Failed { kind, .. } => Some(*kind),
                    _ => None,
                })
                .collect()
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let mut session = CaptureSession::new(Arc::new(SyntheticBackend::new()));
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.device_id().is_none());
    }

    #[test]
    fn streams_converted_frames_in_capture_order() {
        let device = tiny_device("capture-test:stream");
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend_for(&device)));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("five frames", || recorder.frames.lock().len() >= 5);
        assert_eq!(session.state(), SessionState::Streaming);
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Closed);

        let frames = recorder.frames.lock();
        assert!(frames.iter().all(|f| f.format() == edge_pixels::PixelFormat::Rgba8));
        assert!(frames.iter().all(|f| f.dimensions() == (32, 24)));
        assert!(frames.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
        assert_eq!(
            recorder.states(),
            vec![
                SessionState::Opening,
                SessionState::Configuring,
                SessionState::Streaming,
                SessionState::Closing,
                SessionState::Closed,
            ]
        );
        assert!(recorder.failures().is_empty());
    }

    #[test]
    fn stop_while_opening_releases_device() {
        let device = tiny_device("capture-test:opening");
        let backend = backend_for(&device).with_open_delay(Duration::from_secs(10));
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();
        assert_eq!(session.state(), SessionState::Opening);

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(recorder.frames.lock().is_empty());
        session.stop();

        // The claim is gone: the same device can be started again.
        let mut again = CaptureSession::new(Arc::new(backend_for(&device)));
        again
            .start(&device, config(), Box::new(|_| {}), None)
            .unwrap();
        again.stop();
    }

    #[test]
    fn open_failure_is_terminal_and_reported_once() {
        let device = tiny_device("capture-test:open-failure");
        let backend = backend_for(&device).failing_open("sensor busy");
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(recorder.failures(), vec![FailureKind::OpenFailed]);
        let error = recorder
            .statuses
            .lock()
            .iter()
            .find_map(SessionStatus::error)
            .unwrap();
        assert_eq!(error, CameraError::DeviceOpenFailed("sensor busy".to_string()));

        // Not retried.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.failures().len(), 1);
        session.stop();
        assert_eq!(recorder.failures().len(), 1);
    }

    #[test]
    fn configure_failure_is_terminal() {
        let device = tiny_device("capture-test:configure-failure");
        let backend = backend_for(&device).failing_configure("unsupported size");
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(recorder.failures(), vec![FailureKind::ConfigureFailed]);
        assert_eq!(
            recorder.states(),
            vec![
                SessionState::Opening,
                SessionState::Configuring,
                SessionState::Closing,
                SessionState::Closed,
            ]
        );
        session.stop();
    }

    #[test]
    fn disconnect_closes_the_session() {
        let device = tiny_device("capture-test:disconnect");
        let backend = backend_for(&device).disconnecting_after(3);
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(recorder.failures(), vec![FailureKind::Disconnected]);
        assert!(recorder.frames.lock().len() <= 3);

        // A finished session can be started again.
        session
            .start(&device, config(), Box::new(|_| {}), None)
            .unwrap();
        session.stop();
    }

    #[test]
    fn unresponsive_device_times_out_while_opening() {
        let device = tiny_device("capture-test:unresponsive");
        let backend = backend_for(&device).unresponsive();
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(recorder.failures(), vec![FailureKind::OpenFailed]);
        session.stop();
    }

    #[test]
    fn a_device_can_only_be_held_once() {
        let device = tiny_device("capture-test:busy");
        let backend: Arc<dyn CameraBackend> = Arc::new(backend_for(&device));
        let mut first = CaptureSession::new(Arc::clone(&backend));
        first.start(&device, config(), Box::new(|_| {}), None).unwrap();

        let mut second = CaptureSession::new(backend);
        let err = second.start(&device, config(), Box::new(|_| {}), None).unwrap_err();
        assert_eq!(err, CameraError::DeviceBusy("capture-test:busy".to_string()));
        assert_eq!(second.state(), SessionState::Closed);

        let err = first.start(&device, config(), Box::new(|_| {}), None).unwrap_err();
        assert!(matches!(err, CameraError::SessionActive(_)));
        first.stop();
    }

    #[test]
    fn unknown_device_fails_synchronously() {
        let device = tiny_device("capture-test:unknown");
        let mut session = CaptureSession::new(Arc::new(SyntheticBackend::new()));
        let err = session.start(&device, config(), Box::new(|_| {}), None).unwrap_err();
        assert_eq!(err, CameraError::DeviceNotFound("capture-test:unknown".to_string()));
        assert_eq!(session.state(), SessionState::Closed);
        // The claim was released with the failed start.
        assert!(DeviceClaim::acquire(&device.id).is_ok());
    }

    struct Failing;

    impl FrameProcessor for Failing {
        fn process(
            &self,
            _: &[u8],
            _: u32,
            _: u32,
            _: ProcessMode,
        ) -> std::result::Result<Vec<u8>, ProcessingError> {
            Err(ProcessingError::Unavailable("test".to_string()))
        }
    }

    #[test]
    fn processing_failure_falls_back_to_converted_frame() {
        let device = tiny_device("capture-test:processing");
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend_for(&device)));
        let config = SessionConfig {
            processor: Some(Arc::new(Failing)),
            ..config()
        };
        session
            .start(&device, config, recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("frames", || recorder.frames.lock().len() >= 2);
        session.stop();
        let diagnostics = session.diagnostics();
        assert!(diagnostics.frame_count >= 2);
        assert_eq!(diagnostics.processing_fallbacks, diagnostics.frame_count);
        assert_eq!(diagnostics.resolution.as_deref(), Some("32x24"));
    }

    #[test]
    fn slow_consumer_drops_images_instead_of_blocking_the_device() {
        let device = tiny_device("capture-test:slow");
        let backend = backend_for(&device).with_fps(500.0);
        let mut session = CaptureSession::new(Arc::new(backend));
        let config = SessionConfig {
            inbound_capacity: 1,
            ..config()
        };
        session
            .start(
                &device,
                config,
                Box::new(|_| std::thread::sleep(Duration::from_millis(20))),
                None,
            )
            .unwrap();

        wait_until("drops", || session.diagnostics().drop_count > 0);
        session.stop();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn slow_stream_is_reported_as_stalled() {
        let device = tiny_device("capture-test:stall");
        let backend = backend_for(&device).with_fps(2.0);
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        let stalls = || {
            recorder
                .statuses
                .lock()
                .iter()
                .filter(|s| matches!(s, SessionStatus::Stalled { .. }))
                .count()
        };
        wait_until("stall", || stalls() >= 1);
        assert_eq!(session.state(), SessionState::Streaming);
        session.stop();
    }

    /// Streams images as soon as it is opened but never answers the
    /// configure request. Optionally never reports `Opened` either.
    struct ChattyBackend {
        device: CameraDevice,
        send_opened: bool,
    }

    struct ChattyHandle {
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl DeviceHandle for ChattyHandle {
        fn configure(&mut self, _size: Size) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl CameraBackend for ChattyBackend {
        fn enumerate_devices(&self) -> Result<Vec<CameraDevice>> {
            Ok(vec![self.device.clone()])
        }

        fn open_device(
            &self,
            _id: &DeviceId,
            events: DeviceEventSink,
        ) -> Result<Box<dyn DeviceHandle>> {
            let running = Arc::new(AtomicBool::new(true));
            let flag = Arc::clone(&running);
            let send_opened = self.send_opened;
            let thread = std::thread::spawn(move || {
                if send_opened {
                    events(DeviceEvent::Opened);
                }
                let mut index = 0;
                while flag.load(Ordering::Relaxed) {
                    if let Ok(frame) = test_pattern(Size::new(4, 4), index, ChromaLayout::I420, 0) {
                        events(DeviceEvent::Image(frame));
                    }
                    index += 1;
                    std::thread::sleep(Duration::from_millis(2));
                }
            });
            Ok(Box::new(ChattyHandle {
                running,
                thread: Some(thread),
            }))
        }
    }

    fn start_chatty(id: &str, send_opened: bool) -> (CaptureSession, Recorder) {
        let device = tiny_device(id);
        let backend = ChattyBackend {
            device: device.clone(),
            send_opened,
        };
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();
        (session, recorder)
    }

    #[test]
    fn configure_timeout_fires_while_device_keeps_sending_images() {
        let (mut session, recorder) = start_chatty("capture-test:chatty-configure", true);

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(recorder.failures(), vec![FailureKind::ConfigureFailed]);
        assert!(recorder.frames.lock().is_empty());
        assert!(session.diagnostics().drop_count > 0);
        session.stop();
    }

    #[test]
    fn open_timeout_fires_while_device_keeps_sending_images() {
        let (mut session, recorder) = start_chatty("capture-test:chatty-open", false);

        wait_until("closed", || recorder.states().last() == Some(&SessionState::Closed));
        assert_eq!(recorder.failures(), vec![FailureKind::OpenFailed]);
        assert_eq!(
            recorder.states(),
            vec![SessionState::Opening, SessionState::Closing, SessionState::Closed]
        );
        session.stop();
    }

    #[test]
    fn padded_nv12_sensor_decodes_like_i420() {
        let device = tiny_device("capture-test:nv12");
        let backend = backend_for(&device)
            .with_chroma(ChromaLayout::Nv12)
            .with_row_padding(8);
        let recorder = Recorder::new();
        let mut session = CaptureSession::new(Arc::new(backend));
        session
            .start(&device, config(), recorder.on_frame(), recorder.on_status())
            .unwrap();

        wait_until("a frame", || !recorder.frames.lock().is_empty());
        session.stop();

        let first = recorder.frames.lock()[0].clone();
        assert_eq!(first.dimensions(), (32, 24));
        // The sensor's frame index is not observable; the first delivered
        // frame must equal one of the early reference frames.
        let matches = (0..64).any(|index| {
            let reference = test_pattern(Size::new(32, 24), index, ChromaLayout::I420, 0)
                .and_then(edge_pixels::to_rgba)
                .unwrap();
            reference.data() == first.data()
        });
        assert!(matches, "NV12 frame does not decode like the I420 reference");
        assert!(first.data().chunks_exact(4).all(|px| px[3] == 255));
    }

    /// Signals when processing starts, then takes its time.
    struct SlowProcessor {
        entered: Arc<AtomicBool>,
    }

    impl FrameProcessor for SlowProcessor {
        fn process(
            &self,
            _: &[u8],
            _: u32,
            _: u32,
            _: ProcessMode,
        ) -> std::result::Result<Vec<u8>, ProcessingError> {
            self.entered.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_millis(300));
            Err(ProcessingError::Unavailable("slow".to_string()))
        }
    }

    #[test]
    fn diagnostics_do_not_wait_for_native_processing() {
        let device = tiny_device("capture-test:slow-processing");
        let entered = Arc::new(AtomicBool::new(false));
        let config = SessionConfig {
            processor: Some(Arc::new(SlowProcessor {
                entered: Arc::clone(&entered),
            })),
            ..config()
        };
        let mut session = CaptureSession::new(Arc::new(backend_for(&device)));
        session
            .start(&device, config, Box::new(|_| {}), None)
            .unwrap();

        wait_until("processing", || entered.load(Ordering::Acquire));
        let started = Instant::now();
        let _ = session.diagnostics();
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "diagnostics blocked for {:?}",
            started.elapsed()
        );
        session.stop();
        assert!(session.diagnostics().processing_fallbacks >= 1);
    }

    #[test]
    fn status_serialises_with_type_tag() {
        let status = SessionStatus::Failed {
            device_id: DeviceId::new("cam"),
            kind: FailureKind::OpenFailed,
            message: "nope".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["deviceId"], "cam");
        assert_eq!(json["kind"], "open_failed");
    }

    #[test]
    fn capture_session_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CaptureSession>();
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StatusCallback>();
    }
}
