//! Pipeline threads.
//!
//! - acquisition: owns the frame source, applies backpressure, dispatches frames.
//! - detector / depth workers: one backend each, one frame at a time.
//! - fusion: joins both outputs per sequence number, fuses, hands results to the sink.
//!
//! The in-flight gate is taken by acquisition when a frame is dispatched and released by the
//! fusion thread once that frame is finished (delivered, queued or failed). Nothing else
//! queues frames, so at most one frame per role is ever in flight.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::depth::DepthMap;
use crate::detect::DetectionSet;
use crate::error::{panic_message, FrameSourceError, InferenceError};
use crate::frame::{Frame, FrameMeta};
use crate::fuse::{ResultFuser, StageTimings};
use crate::ingest::{FrameSource, SourceStats};
use crate::sink::ResultSink;
use crate::track::Tracker;

use super::events::{BackendRole, PipelineEvent, RoleHealth};
use super::Shared;

const ROLES: usize = 2;
const IDLE_POLL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// In-flight gate
// ----------------------------------------------------------------------------

/// One slot per backend role.
#[derive(Debug, Default)]
pub(crate) struct InFlightGate {
    busy: Mutex<[bool; ROLES]>,
    idle: Condvar,
}

impl InFlightGate {
    fn slots(&self) -> MutexGuard<'_, [bool; ROLES]> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim both roles for a new frame. Fails without blocking if either is busy.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut busy = self.slots();
        if busy.iter().any(|b| *b) {
            return false;
        }
        *busy = [true; ROLES];
        true
    }

    pub(crate) fn release(&self) {
        *self.slots() = [false; ROLES];
        self.idle.notify_all();
    }

    pub(crate) fn in_flight(&self, role: BackendRole) -> bool {
        self.slots()[role.index()]
    }

    /// Block until both roles are idle. Returns `false` if `stop` is raised first.
    pub(crate) fn wait_idle(&self, stop: &AtomicBool) -> bool {
        let mut busy = self.slots();
        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            if busy.iter().all(|b| !*b) {
                return true;
            }
            busy = self
                .idle
                .wait_timeout(busy, IDLE_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn wake(&self) {
        self.idle.notify_all();
    }
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

pub(crate) struct Completion<T> {
    pub sequence: u64,
    pub outcome: Result<T, InferenceError>,
    pub elapsed: Duration,
}

pub(crate) enum JoinMessage {
    /// Sent by acquisition before the frame reaches either worker.
    Dispatched(FrameMeta),
    Detected(Completion<DetectionSet>),
    Estimated(Completion<DepthMap>),
}

// ----------------------------------------------------------------------------
// Backend workers
// ----------------------------------------------------------------------------

/// Serve one backend until the frame channel closes.
///
/// `infer` is expected to stamp the frame's sequence number onto its output. Panics are
/// converted into `InferenceError::Panicked` so a misbehaving backend costs one frame.
pub(crate) fn run_backend<T>(
    role: BackendRole,
    frames: Receiver<Arc<Frame>>,
    results: Sender<JoinMessage>,
    mut infer: impl FnMut(&Frame) -> Result<T, InferenceError>,
    wrap: fn(Completion<T>) -> JoinMessage,
) {
    for frame in frames {
        let started = Instant::now();
        let sequence = frame.sequence();
        let outcome = catch_unwind(AssertUnwindSafe(|| infer(&frame))).unwrap_or_else(|payload| {
            Err(InferenceError::Panicked(panic_message(payload.as_ref())))
        });
        drop(frame);
        let completion = Completion {
            sequence,
            outcome,
            elapsed: started.elapsed(),
        };
        if results.send(wrap(completion)).is_err() {
            log::debug!("{} worker: fusion thread gone, exiting", role);
            break;
        }
    }
}

// ----------------------------------------------------------------------------
// Fusion
// ----------------------------------------------------------------------------

struct PendingFrame {
    meta: FrameMeta,
    detections: Option<Completion<DetectionSet>>,
    depth: Option<Completion<DepthMap>>,
}

pub(crate) struct FusionLoop {
    shared: Arc<Shared>,
    fuser: ResultFuser,
    sink: ResultSink,
    health: [RoleHealth; ROLES],
    pending: BTreeMap<u64, PendingFrame>,
    tracker: Option<Tracker>,
}

impl FusionLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        fuser: ResultFuser,
        sink: ResultSink,
        unhealthy_threshold: u32,
        tracker: Option<Tracker>,
    ) -> Self {
        Self {
            shared,
            fuser,
            sink,
            health: [
                RoleHealth::new(BackendRole::Detector, unhealthy_threshold),
                RoleHealth::new(BackendRole::Depth, unhealthy_threshold),
            ],
            pending: BTreeMap::new(),
            tracker,
        }
    }

    /// Consume worker output until every sender is gone, then flush the sink and mark the
    /// pipeline stopped.
    pub(crate) fn run(mut self, messages: Receiver<JoinMessage>, done: Sender<()>) {
        for message in messages {
            match message {
                JoinMessage::Dispatched(meta) => {
                    self.pending.insert(
                        meta.sequence,
                        PendingFrame {
                            meta,
                            detections: None,
                            depth: None,
                        },
                    );
                }
                JoinMessage::Detected(completion) => {
                    let sequence = completion.sequence;
                    match self.pending.get_mut(&sequence) {
                        Some(frame) => frame.detections = Some(completion),
                        None => log::warn!("detector output for unknown frame {}", sequence),
                    }
                    self.try_complete(sequence);
                }
                JoinMessage::Estimated(completion) => {
                    let sequence = completion.sequence;
                    match self.pending.get_mut(&sequence) {
                        Some(frame) => frame.depth = Some(completion),
                        None => log::warn!("depth output for unknown frame {}", sequence),
                    }
                    self.try_complete(sequence);
                }
            }
        }

        for (sequence, _) in std::mem::take(&mut self.pending) {
            log::warn!("frame {} never completed, dropping it", sequence);
            self.shared.stats.frame_failed();
        }
        self.sink.close();
        self.shared.finish();
        let _ = done.send(());
    }

    fn try_complete(&mut self, sequence: u64) {
        let ready = self
            .pending
            .get(&sequence)
            .map(|f| f.detections.is_some() && f.depth.is_some())
            .unwrap_or(false);
        if !ready {
            return;
        }
        if let Some(frame) = self.pending.remove(&sequence) {
            self.complete(frame);
        }
        self.shared.gate.release();
    }

    fn complete(&mut self, frame: PendingFrame) {
        let PendingFrame {
            meta,
            detections,
            depth,
        } = frame;
        let detections = detections.map(|c| (c.outcome, c.elapsed));
        let depth = depth.map(|c| (c.outcome, c.elapsed));
        let (Some((detections, detect_time)), Some((depth, depth_time))) = (detections, depth)
        else {
            return;
        };

        let detections = self.observe(BackendRole::Detector, meta.sequence, detections);
        let depth = self.observe(BackendRole::Depth, meta.sequence, depth);

        // Either side missing: the frame yields nothing and counts as one failure.
        let (Some(detections), Some(depth)) = (detections, depth) else {
            self.shared.stats.frame_failed();
            return;
        };

        let timings = StageTimings {
            detect: detect_time,
            depth: depth_time,
        };
        match self
            .fuser
            .fuse(&meta, Some(detections), Some(depth), timings)
        {
            Ok(mut result) => {
                if let Some(tracker) = self.tracker.as_mut() {
                    result.tracks = tracker.update(result.captured_at, &result.objects);
                }
                self.shared.stats.result_fused();
                self.sink.submit(result);
            }
            Err(err) => {
                log::warn!("{}", err);
                self.shared.stats.frame_failed();
            }
        }
    }

    /// Update role health and counters for one backend outcome.
    fn observe<T>(
        &mut self,
        role: BackendRole,
        sequence: u64,
        outcome: Result<T, InferenceError>,
    ) -> Option<T> {
        let health = &mut self.health[role.index()];
        match outcome {
            Ok(value) => {
                if let Some(event) = health.record_success() {
                    self.shared.emit(event);
                }
                Some(value)
            }
            Err(err) => {
                match role {
                    BackendRole::Detector => self.shared.stats.detector_failed(),
                    BackendRole::Depth => self.shared.stats.depth_failed(),
                }
                log::debug!("frame {}: {} backend failed: {}", sequence, role, err);
                if let Some(event) = health.record_failure() {
                    self.shared.emit(event);
                }
                None
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Acquisition
// ----------------------------------------------------------------------------

/// Sent by the acquisition thread as its last act.
pub(crate) struct AcquisitionExit {
    pub result: Result<(), FrameSourceError>,
    pub source: SourceStats,
}

pub(crate) struct Acquisition {
    pub shared: Arc<Shared>,
    pub source: Box<dyn FrameSource>,
    pub detector: SyncSender<Arc<Frame>>,
    pub depth: SyncSender<Arc<Frame>>,
    pub join: Sender<JoinMessage>,
}

impl Acquisition {
    /// Pull and dispatch frames until stopped, the source ends, or the source fails.
    ///
    /// Live sources are read continuously and frames that arrive while a backend is busy are
    /// dropped. Non-live sources are only read once both backends are idle, so none of their
    /// frames is dropped.
    pub(crate) fn run(&mut self) -> Result<(), FrameSourceError> {
        let live = self.source.is_live();
        let mut last_sequence: Option<u64> = None;
        let mut healthy = true;
        log::info!(
            "acquiring from {} ({})",
            self.source.describe(),
            if live { "live" } else { "replay" }
        );

        loop {
            if self.shared.stop_requested() {
                return Ok(());
            }
            if !live && !self.shared.gate.wait_idle(&self.shared.stop) {
                return Ok(());
            }

            let frame = match self.source.next_frame()? {
                Some(frame) => frame,
                None => {
                    log::info!("{} reached end of stream", self.source.describe());
                    return Ok(());
                }
            };
            if self.source.is_healthy() != healthy {
                healthy = !healthy;
                let source = self.source.describe();
                self.shared.emit(if healthy {
                    PipelineEvent::SourceRecovered { source }
                } else {
                    PipelineEvent::SourceUnhealthy { source }
                });
            }
            if self.shared.stop_requested() {
                return Ok(());
            }

            let sequence = frame.sequence();
            if last_sequence.is_some_and(|last| sequence <= last) {
                self.shared.stats.out_of_order();
                log::warn!("source repeated or rewound sequence {}, skipping", sequence);
                continue;
            }

            if !self.shared.gate.try_acquire() {
                self.shared.stats.frame_dropped();
                log::trace!("backends busy, dropping frame {}", sequence);
                continue;
            }
            last_sequence = Some(sequence);
            self.shared.stats.frame_accepted();

            let frame = Arc::new(frame);
            if self
                .join
                .send(JoinMessage::Dispatched(FrameMeta::from(frame.as_ref())))
                .is_err()
            {
                log::error!("fusion thread gone, stopping acquisition");
                return Ok(());
            }
            if self.detector.send(frame.clone()).is_err() || self.depth.send(frame).is_err() {
                log::error!("backend worker gone, stopping acquisition");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_frame_at_a_time() {
        let gate = InFlightGate::default();
        assert!(gate.try_acquire());
        assert!(gate.in_flight(BackendRole::Detector));
        assert!(gate.in_flight(BackendRole::Depth));
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn wait_idle_returns_false_once_stopped() {
        let gate = InFlightGate::default();
        assert!(gate.try_acquire());
        let stop = AtomicBool::new(true);
        assert!(!gate.wait_idle(&stop));
        gate.release();
        stop.store(false, Ordering::SeqCst);
        assert!(gate.wait_idle(&stop));
    }

    #[test]
    fn wait_idle_wakes_on_release() {
        let gate = Arc::new(InFlightGate::default());
        assert!(gate.try_acquire());
        let releaser = gate.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            releaser.release();
        });
        let stop = AtomicBool::new(false);
        assert!(gate.wait_idle(&stop));
        handle.join().unwrap();
    }

    #[test]
    fn backend_panics_become_inference_errors() {
        let (frame_tx, frame_rx) = std::sync::mpsc::channel();
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let frame = Frame::new(vec![0u8; 4], 2, 2, crate::frame::PixelFormat::Gray8, 9).unwrap();
        frame_tx.send(Arc::new(frame)).unwrap();
        drop(frame_tx);
        run_backend(
            BackendRole::Depth,
            frame_rx,
            result_tx,
            |_frame: &Frame| -> Result<DepthMap, InferenceError> { panic!("model crashed") },
            JoinMessage::Estimated,
        );
        match result_rx.recv().unwrap() {
            JoinMessage::Estimated(c) => {
                assert_eq!(c.sequence, 9);
                assert!(matches!(c.outcome, Err(InferenceError::Panicked(ref m)) if m == "model crashed"));
            }
            _ => panic!("expected depth completion"),
        }
    }
}
