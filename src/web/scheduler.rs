/// Handle returned by [`AnimationScheduler::request_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameRequestId(u64);

impl FrameRequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Per-display-frame callback registration, modelled on
/// `requestAnimationFrame` / `cancelAnimationFrame`.
pub trait AnimationScheduler {
    /// Ask for one callback on the next display frame.
    fn request_frame(&mut self) -> FrameRequestId;

    /// Withdraw a request. Unknown or already fired ids are ignored.
    fn cancel(&mut self, id: FrameRequestId);
}

/// Scheduler driven by hand: the host collects due requests with
/// [`take_due`](ManualScheduler::take_due) and fires them itself.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    next_id: u64,
    pending: Vec<FrameRequestId>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests waiting for the next display frame.
    pub fn pending(&self) -> &[FrameRequestId] {
        &self.pending
    }

    /// Drain the requests for the display frame that is starting now.
    pub fn take_due(&mut self) -> Vec<FrameRequestId> {
        std::mem::take(&mut self.pending)
    }
}

impl AnimationScheduler for ManualScheduler {
    fn request_frame(&mut self) -> FrameRequestId {
        // Ids start at 1, as browser handles do.
        self.next_id += 1;
        let id = FrameRequestId(self.next_id);
        self.pending.push(id);
        id
    }

    fn cancel(&mut self, id: FrameRequestId) {
        self.pending.retain(|&pending| pending != id);
    }
}
