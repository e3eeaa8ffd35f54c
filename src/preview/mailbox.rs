use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use edge_pixels::Frame;
use parking_lot::{Condvar, Mutex};

struct Slot {
    frame: Option<Frame>,
    woken: bool,
}

/// Single-slot hand-off between the capture thread and the render thread.
///
/// Holds at most one frame. A frame written before the previous one was
/// taken replaces it, so a slow consumer only ever sees the newest frame and
/// memory stays bounded no matter how fast frames arrive.
pub struct FrameMailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
    /// Monotonic counter incremented on each put.
    sequence: AtomicU64,
    overwritten: AtomicU64,
}

impl Default for FrameMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                frame: None,
                woken: false,
            }),
            ready: Condvar::new(),
            sequence: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }

    /// Store `frame`, replacing any unconsumed one, and wake the consumer.
    /// Returns true if a pending frame was discarded.
    pub fn put(&self, frame: Frame) -> bool {
        let replaced = {
            let mut slot = self.slot.lock();
            slot.frame.replace(frame).is_some()
        };
        self.sequence.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        replaced
    }

    /// Take the pending frame without waiting.
    pub fn take(&self) -> Option<Frame> {
        self.slot.lock().frame.take()
    }

    /// Wait up to `timeout` for a frame. Returns early with `None` when
    /// [`wake`](Self::wake) is called with the slot empty.
    pub fn wait_take(&self, timeout: Duration) -> Option<Frame> {
        let mut slot = self.slot.lock();
        if slot.frame.is_none() && !slot.woken {
            self.ready.wait_for(&mut slot, timeout);
        }
        slot.woken = false;
        slot.frame.take()
    }

    /// Interrupt a pending [`wait_take`](Self::wait_take) so the consumer can
    /// look at something other than frames.
    pub fn wake(&self) {
        self.slot.lock().woken = true;
        self.ready.notify_one();
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().frame.is_some()
    }

    /// Number of frames ever put.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Number of frames replaced before the consumer took them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}
