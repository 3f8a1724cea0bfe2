use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Aggregate counters for one pipeline run. Updated lock-free from every pipeline thread.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_accepted: AtomicU64,
    frames_dropped: AtomicU64,
    frames_failed: AtomicU64,
    detector_failures: AtomicU64,
    depth_failures: AtomicU64,
    results_fused: AtomicU64,
    results_delivered: AtomicU64,
    results_discarded: AtomicU64,
    callback_failures: AtomicU64,
    out_of_order_frames: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames dispatched to both backends.
    pub frames_accepted: u64,
    /// Frames rejected by backpressure while a backend was busy.
    pub frames_dropped: u64,
    /// Accepted frames that produced no result because a backend failed.
    pub frames_failed: u64,
    pub detector_failures: u64,
    pub depth_failures: u64,
    pub results_fused: u64,
    /// Results handed to the callback without fault.
    pub results_delivered: u64,
    /// Results thrown away: no callback, full delivery queue, or abandoned on drain timeout.
    pub results_discarded: u64,
    pub callback_failures: u64,
    /// Results suppressed because their sequence did not advance.
    pub out_of_order_frames: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(frame_accepted, frames_accepted);
    counter!(frame_dropped, frames_dropped);
    counter!(frame_failed, frames_failed);
    counter!(detector_failed, detector_failures);
    counter!(depth_failed, depth_failures);
    counter!(result_fused, results_fused);
    counter!(result_delivered, results_delivered);
    counter!(result_discarded, results_discarded);
    counter!(callback_failed, callback_failures);
    counter!(out_of_order, out_of_order_frames);

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            depth_failures: self.depth_failures.load(Ordering::Relaxed),
            results_fused: self.results_fused.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            out_of_order_frames: self.out_of_order_frames.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PipelineStats::new();
        stats.frame_accepted();
        stats.frame_accepted();
        stats.frame_dropped();
        stats.depth_failed();
        let snap = stats.snapshot();
        assert_eq!(snap.frames_accepted, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.depth_failures, 1);
        assert_eq!(snap.results_delivered, 0);
    }
}
