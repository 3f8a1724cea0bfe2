//! Pipeline scheduler.
//!
//! `Pipeline::builder()` collects the two backends, an optional callback and an optional frame
//! source. `start()` moves the pipeline from `Idle` to `Running` and returns a
//! [`PipelineHandle`]; the handle stops it (`Running -> Draining -> Stopped`) and reports the
//! final counters.
//!
//! Thread layout (see `worker`):
//!
//! ```text
//! acquisition --Arc<Frame>--> detector worker --\
//!             \-Arc<Frame>--> depth worker    ----> fusion --> sink (inline or delivery thread)
//!              \------------- Dispatched meta --/
//! ```

mod events;
mod state;
mod stats;
mod worker;

pub use events::{BackendRole, PipelineEvent};
pub use state::PipelineState;
pub use stats::{PipelineStats, StatsSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::depth::{DepthBackend, DepthSampling};
use crate::detect::{DetectionFilter, DetectionSet, DetectorBackend};
use crate::error::{FrameSourceError, PipelineError};
use crate::frame::Frame;
use crate::fuse::{CameraIntrinsics, FusedResult, ResultFuser, DEFAULT_FOCAL_SCALE};
use crate::ingest::{self, FrameSource, SourceSettings, SourceStats};
use crate::sink::{DeliveryMode, ResultCallback, ResultSink};
use crate::track::{Tracker, TrackerConfig};

use self::state::StateCell;
use self::worker::{
    run_backend, Acquisition, AcquisitionExit, FusionLoop, InFlightGate, JoinMessage,
};

/// Default number of consecutive failures before a role is reported unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Events kept for the caller before new ones are dropped.
pub const EVENT_BACKLOG: usize = 256;
const STOP_POLL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Scheduling and fusion options for one run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub delivery: DeliveryMode,
    /// Capacity of the delivery queue in threaded mode.
    pub delivery_queue: usize,
    /// Upper bound on the drain phase after a stop request.
    pub drain_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub filter: DetectionFilter,
    pub sampling: DepthSampling,
    pub focal_scale: f32,
    pub intrinsics: Option<CameraIntrinsics>,
    /// Attach confirmed object tracks to every result.
    pub tracking: Option<TrackerConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Inline,
            delivery_queue: 4,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            filter: DetectionFilter::default(),
            sampling: DepthSampling::Center,
            focal_scale: DEFAULT_FOCAL_SCALE,
            intrinsics: None,
            tracking: None,
        }
    }
}

impl PipelineConfig {
    fn fuser(&self) -> ResultFuser {
        let fuser = ResultFuser::new(self.sampling, self.focal_scale);
        match self.intrinsics {
            Some(k) => fuser.with_intrinsics(k),
            None => fuser,
        }
    }
}

// ----------------------------------------------------------------------------
// Shared run state
// ----------------------------------------------------------------------------

pub(crate) struct Shared {
    state: StateCell,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) gate: InFlightGate,
    pub(crate) stop: AtomicBool,
    stop_requested_at: Mutex<Option<Instant>>,
    abandon: Arc<AtomicBool>,
    events: SyncSender<PipelineEvent>,
}

impl Shared {
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::StateChanged { from, to } => {
                log::info!("pipeline {} -> {}", from, to)
            }
            PipelineEvent::BackendUnhealthy {
                role,
                consecutive_failures,
            } => log::warn!(
                "{} backend unhealthy after {} consecutive failures",
                role,
                consecutive_failures
            ),
            PipelineEvent::BackendRecovered { role } => log::info!("{} backend recovered", role),
            PipelineEvent::SourceUnhealthy { source } => {
                log::warn!("frame source {} unhealthy", source)
            }
            PipelineEvent::SourceRecovered { source } => {
                log::info!("frame source {} recovered", source)
            }
            PipelineEvent::FrameSourceFailed { message } => {
                log::error!("frame source failed: {}", message)
            }
        }
        // Never block a pipeline thread on a caller that does not read events.
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("event backlog full, dropping {:?}", event)
            }
        }
    }

    fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        if self.state.transition(from, to).is_ok() {
            self.emit(PipelineEvent::StateChanged { from, to });
            true
        } else {
            false
        }
    }

    fn request_stop(&self) {
        self.stop_requested_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Instant::now);
        self.stop.store(true, Ordering::SeqCst);
        self.gate.wake();
        self.transition(PipelineState::Running, PipelineState::Draining);
    }

    /// When the whole stop, source included, must be over.
    fn stop_deadline(&self, drain_timeout: Duration) -> Option<Instant> {
        self.stop_requested_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at + drain_timeout)
    }

    /// Acquisition ended normally: finish what is in flight.
    fn begin_drain(&self) {
        self.transition(PipelineState::Running, PipelineState::Draining);
    }

    /// Acquisition failed: abandon in-flight work and stop immediately.
    fn fail_source(&self, err: &FrameSourceError) {
        self.stop.store(true, Ordering::SeqCst);
        self.abandon.store(true, Ordering::SeqCst);
        self.force_stop();
        self.emit(PipelineEvent::FrameSourceFailed {
            message: err.to_string(),
        });
    }

    fn force_stop(&self) {
        if let Some(from) = self.state.force_stop() {
            self.emit(PipelineEvent::StateChanged {
                from,
                to: PipelineState::Stopped,
            });
        }
    }

    /// Called by the fusion thread once every in-flight frame is accounted for.
    pub(crate) fn finish(&self) {
        if !self.transition(PipelineState::Draining, PipelineState::Stopped) {
            self.force_stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// A configured, not yet started pipeline.
pub struct Pipeline {
    detector: Box<dyn DetectorBackend>,
    depth: Box<dyn DepthBackend>,
    callback: Option<Box<dyn ResultCallback>>,
    source: Box<dyn FrameSource>,
    config: PipelineConfig,
}

#[derive(Default)]
pub struct PipelineBuilder {
    detector: Option<Box<dyn DetectorBackend>>,
    depth: Option<Box<dyn DepthBackend>>,
    callback: Option<Box<dyn ResultCallback>>,
    source: Option<Box<dyn FrameSource>>,
    source_settings: SourceSettings,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn detector(mut self, backend: impl DetectorBackend + 'static) -> Self {
        self.detector = Some(Box::new(backend));
        self
    }

    pub fn depth(mut self, backend: impl DepthBackend + 'static) -> Self {
        self.depth = Some(Box::new(backend));
        self
    }

    /// Register a closure as the result callback.
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: FnMut(FusedResult) -> anyhow::Result<()> + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }

    /// Register a callback object.
    pub fn callback(mut self, callback: impl ResultCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn frame_source(mut self, source: impl FrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Settings for the default camera adapter, used when no source is supplied.
    pub fn source_settings(mut self, settings: SourceSettings) -> Self {
        self.source_settings = settings;
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let detector = self
            .detector
            .ok_or(PipelineError::MissingBackend(BackendRole::Detector))?;
        let depth = self
            .depth
            .ok_or(PipelineError::MissingBackend(BackendRole::Depth))?;
        let source = match self.source {
            Some(source) => source,
            None => ingest::open_source(&self.source_settings)?,
        };
        Ok(Pipeline {
            detector,
            depth,
            callback: self.callback,
            source,
            config: self.config,
        })
    }
}

fn spawn<T, F>(name: &'static str, f: F) -> Result<JoinHandle<T>, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("fusion-{}", name))
        .spawn(f)
        .map_err(|source| PipelineError::Spawn { name, source })
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Connect the source, spawn the pipeline threads and enter `Running`.
    pub fn start(self) -> Result<PipelineHandle, PipelineError> {
        let Pipeline {
            mut detector,
            mut depth,
            callback,
            mut source,
            config,
        } = self;

        source.connect()?;

        let stats = Arc::new(PipelineStats::new());
        let abandon = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::sync_channel(EVENT_BACKLOG);
        let shared = Arc::new(Shared {
            state: StateCell::new(),
            stats: stats.clone(),
            gate: InFlightGate::default(),
            stop: AtomicBool::new(false),
            stop_requested_at: Mutex::new(None),
            abandon: abandon.clone(),
            events: event_tx,
        });

        let sink = ResultSink::new(
            callback,
            config.delivery,
            config.delivery_queue,
            stats,
            abandon,
        )?;

        let (join_tx, join_rx) = mpsc::channel::<JoinMessage>();
        let (detect_tx, detect_rx) = mpsc::sync_channel::<Arc<Frame>>(1);
        let (depth_tx, depth_rx) = mpsc::sync_channel::<Arc<Frame>>(1);
        let (done_tx, done_rx) = mpsc::channel();

        log::info!(
            "starting pipeline: detector={} depth={} delivery={:?}",
            detector.name(),
            depth.name(),
            config.delivery
        );

        let filter = config.filter;
        let results = join_tx.clone();
        spawn("detector", move || {
            if let Err(err) = detector.warm_up() {
                log::warn!("detector warm-up failed: {}", err);
            }
            run_backend(
                BackendRole::Detector,
                detect_rx,
                results,
                |frame: &Frame| {
                    let detections = detector.infer(frame)?;
                    Ok(DetectionSet::new(frame.sequence(), filter.apply(detections)))
                },
                JoinMessage::Detected,
            )
        })?;

        let results = join_tx.clone();
        spawn("depth", move || {
            if let Err(err) = depth.warm_up() {
                log::warn!("depth warm-up failed: {}", err);
            }
            run_backend(
                BackendRole::Depth,
                depth_rx,
                results,
                |frame: &Frame| Ok(depth.infer(frame)?.with_sequence(frame.sequence())),
                JoinMessage::Estimated,
            )
        })?;

        let fusion = FusionLoop::new(
            shared.clone(),
            config.fuser(),
            sink,
            config.unhealthy_threshold,
            config.tracking.map(Tracker::new),
        );
        spawn("join", move || fusion.run(join_rx, done_tx))?;

        shared.transition(PipelineState::Idle, PipelineState::Running);

        let mut acquisition = Acquisition {
            shared: shared.clone(),
            source,
            detector: detect_tx,
            depth: depth_tx,
            join: join_tx,
        };
        let acquisition_shared = shared.clone();
        let (exit_tx, exit_rx) = mpsc::channel();
        let spawned = spawn("acquire", move || {
            let result = acquisition.run();
            // State must change before the senders drop, or fusion could finish first.
            match &result {
                Ok(()) => acquisition_shared.begin_drain(),
                Err(err) => acquisition_shared.fail_source(err),
            }
            let source = acquisition.source.stats();
            drop(acquisition);
            // The handle may have given up on this thread already.
            let _ = exit_tx.send(AcquisitionExit { result, source });
        });
        if let Err(err) = spawned {
            shared.force_stop();
            return Err(err);
        }

        Ok(PipelineHandle {
            shared,
            events: event_rx,
            acquisition: exit_rx,
            done: done_rx,
            drain_timeout: config.drain_timeout,
            outcome: None,
        })
    }

    /// Start and block until the source ends or a [`StopHandle`] stops the run.
    pub fn run(self) -> Result<PipelineReport, PipelineError> {
        self.start()?.wait()
    }
}

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// Outcome of a finished run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub stats: StatsSnapshot,
    pub final_state: PipelineState,
    /// In-flight frames or a blocked frame source did not finish within the drain timeout and
    /// were abandoned.
    pub drain_timed_out: bool,
    /// Source counters at the end of acquisition. `None` when the source was abandoned.
    pub source: Option<SourceStats>,
}

/// How a run ended, kept so that repeated `wait` calls agree.
#[derive(Clone, Debug)]
enum Outcome {
    Finished(PipelineReport),
    SourceFailed(FrameSourceError),
    Panicked(&'static str),
}

impl Outcome {
    fn into_result(self) -> Result<PipelineReport, PipelineError> {
        match self {
            Outcome::Finished(report) => Ok(report),
            Outcome::SourceFailed(err) => Err(PipelineError::FrameSource(err)),
            Outcome::Panicked(thread) => Err(PipelineError::ThreadPanicked(thread)),
        }
    }
}

/// Cloneable stop trigger, usable from signal handlers and other threads.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }
}

/// Control surface of a running pipeline.
///
/// Dropping the handle requests a stop but does not wait for the drain.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    events: Receiver<PipelineEvent>,
    acquisition: Receiver<AcquisitionExit>,
    done: Receiver<()>,
    drain_timeout: Duration,
    outcome: Option<Outcome>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// State changes, backend and source health changes and source failures, in emission order.
    ///
    /// At most [`EVENT_BACKLOG`] unread events are kept; later ones are dropped (and logged at
    /// debug level) until the caller catches up.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop pulling frames. In-flight frames keep going; call `wait` to drain.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    /// Request a stop and drain.
    pub fn stop(&mut self) -> Result<PipelineReport, PipelineError> {
        self.request_stop();
        self.wait()
    }

    /// Block until acquisition ends (end of stream, stop request or source failure), then
    /// drain in-flight frames.
    ///
    /// Once a stop has been requested the whole wait, including a frame source blocked in
    /// `next_frame`, is bounded by the drain timeout; whatever has not finished by then is
    /// abandoned. A run that ends on its own gets the drain timeout for its in-flight frames.
    ///
    /// A frame source failure is returned as `PipelineError::FrameSource`; the pipeline is
    /// already `Stopped` by then. Later calls return the same outcome. Events stay readable
    /// through [`events`](Self::events) afterwards.
    pub fn wait(&mut self) -> Result<PipelineReport, PipelineError> {
        let outcome = match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => {
                let outcome = self.run_to_end();
                self.outcome = Some(outcome.clone());
                outcome
            }
        };
        outcome.into_result()
    }

    fn run_to_end(&mut self) -> Outcome {
        let exit = loop {
            let deadline = self.shared.stop_deadline(self.drain_timeout);
            let timeout =
                deadline.map_or(STOP_POLL, |d| d.saturating_duration_since(Instant::now()));
            match self.acquisition.recv_timeout(timeout) {
                Ok(exit) => break Some(exit),
                Err(RecvTimeoutError::Disconnected) => {
                    self.abandon();
                    return Outcome::Panicked("acquisition");
                }
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        log::warn!(
                            "frame source still blocked {:?} after the stop request, abandoning it",
                            self.drain_timeout
                        );
                        break None;
                    }
                }
            }
        };

        let (drain_timed_out, source) = match exit {
            None => {
                self.abandon();
                (true, None)
            }
            Some(AcquisitionExit {
                result: Err(err), ..
            }) => return Outcome::SourceFailed(err),
            Some(AcquisitionExit {
                result: Ok(()),
                source,
            }) => {
                let deadline = self
                    .shared
                    .stop_deadline(self.drain_timeout)
                    .unwrap_or_else(|| Instant::now() + self.drain_timeout);
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.done.recv_timeout(remaining) {
                    Ok(()) => (false, Some(source)),
                    Err(RecvTimeoutError::Timeout) => {
                        log::warn!(
                            "drain did not finish within {:?}, abandoning in-flight frames",
                            self.drain_timeout
                        );
                        self.abandon();
                        (true, Some(source))
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        self.abandon();
                        return Outcome::Panicked("fusion");
                    }
                }
            }
        };

        let report = PipelineReport {
            stats: self.shared.stats.snapshot(),
            final_state: self.shared.state.get(),
            drain_timed_out,
            source,
        };
        log::info!(
            "pipeline finished: accepted={} delivered={} dropped={} failed={}",
            report.stats.frames_accepted,
            report.stats.results_delivered,
            report.stats.frames_dropped,
            report.stats.frames_failed
        );
        Outcome::Finished(report)
    }

    fn abandon(&self) {
        self.shared.abandon.store(true, Ordering::SeqCst);
        self.shared.force_stop();
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if !self.shared.state.get().is_terminal() {
            self.shared.request_stop();
        }
    }
}
