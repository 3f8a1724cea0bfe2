//! Result delivery.
//!
//! The sink is the isolation boundary between the pipeline and caller code. A callback that
//! returns an error or panics is logged and counted; the pipeline never sees the fault.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SendError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::error::{panic_message, CallbackError, PipelineError};
use crate::fuse::FusedResult;
use crate::pipeline::PipelineStats;

/// Receives one `FusedResult` per successfully fused frame, in sequence order.
///
/// Errors and panics raised here are contained by the pipeline. Any `FnMut(FusedResult) ->
/// anyhow::Result<()>` closure implements this trait.
pub trait ResultCallback: Send {
    fn on_result(&mut self, result: FusedResult) -> anyhow::Result<()>;
}

impl<F> ResultCallback for F
where
    F: FnMut(FusedResult) -> anyhow::Result<()> + Send,
{
    fn on_result(&mut self, result: FusedResult) -> anyhow::Result<()> {
        self(result)
    }
}

/// Where the callback runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// On the fusion thread, right after the join. A slow callback holds back the next result.
    #[default]
    Inline,
    /// On a dedicated delivery thread fed by a bounded queue. A full queue stalls the fusion
    /// thread until the callback catches up; no fused result is dropped.
    Threaded,
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(DeliveryMode::Inline),
            "threaded" | "async" => Ok(DeliveryMode::Threaded),
            other => Err(format!("unknown delivery mode '{}'", other)),
        }
    }
}

/// Runs the callback with fault isolation.
struct Deliverer {
    callback: Box<dyn ResultCallback>,
    stats: Arc<PipelineStats>,
    abandon: Arc<AtomicBool>,
}

impl Deliverer {
    fn deliver(&mut self, result: FusedResult) {
        if self.abandon.load(Ordering::SeqCst) {
            self.stats.result_discarded();
            return;
        }
        let sequence = result.sequence;
        let callback = &mut self.callback;
        let outcome = match catch_unwind(AssertUnwindSafe(|| callback.on_result(result))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(CallbackError::Failed(err)),
            Err(payload) => Err(CallbackError::Panicked(panic_message(payload.as_ref()))),
        };
        match outcome {
            Ok(()) => self.stats.result_delivered(),
            Err(err) => {
                self.stats.callback_failed();
                log::warn!("frame {}: {}", sequence, err);
            }
        }
    }
}

enum Route {
    Discard,
    Inline(Deliverer),
    Threaded {
        tx: SyncSender<FusedResult>,
        join: JoinHandle<()>,
    },
}

/// Front end used by the fusion thread. Enforces increasing sequence order before handing a
/// result to the configured route.
pub(crate) struct ResultSink {
    route: Route,
    stats: Arc<PipelineStats>,
    abandon: Arc<AtomicBool>,
    last_sequence: Option<u64>,
}

impl ResultSink {
    pub(crate) fn new(
        callback: Option<Box<dyn ResultCallback>>,
        mode: DeliveryMode,
        queue_depth: usize,
        stats: Arc<PipelineStats>,
        abandon: Arc<AtomicBool>,
    ) -> Result<Self, PipelineError> {
        let route = match callback {
            None => Route::Discard,
            Some(callback) => {
                let deliverer = Deliverer {
                    callback,
                    stats: stats.clone(),
                    abandon: abandon.clone(),
                };
                match mode {
                    DeliveryMode::Inline => Route::Inline(deliverer),
                    DeliveryMode::Threaded => spawn_delivery(deliverer, queue_depth)?,
                }
            }
        };
        Ok(Self {
            route,
            stats,
            abandon,
            last_sequence: None,
        })
    }

    pub(crate) fn submit(&mut self, result: FusedResult) {
        if let Some(last) = self.last_sequence {
            if result.sequence <= last {
                self.stats.out_of_order();
                log::warn!(
                    "suppressing result {} delivered after {}",
                    result.sequence,
                    last
                );
                return;
            }
        }
        self.last_sequence = Some(result.sequence);

        if self.abandon.load(Ordering::SeqCst) {
            self.stats.result_discarded();
            return;
        }

        match &mut self.route {
            Route::Discard => self.stats.result_discarded(),
            Route::Inline(deliverer) => deliverer.deliver(result),
            // Blocks while the queue is full. The in-flight gate stays closed meanwhile, so
            // backpressure turns into acquisition drops instead of lost results.
            Route::Threaded { tx, .. } => {
                if let Err(SendError(result)) = tx.send(result) {
                    self.stats.result_discarded();
                    log::warn!("delivery thread gone, discarding result {}", result.sequence);
                }
            }
        }
    }

    /// Flush queued results and stop the delivery thread.
    pub(crate) fn close(self) {
        if let Route::Threaded { tx, join } = self.route {
            drop(tx);
            if join.join().is_err() {
                log::error!("result delivery thread panicked");
            }
        }
    }
}

fn spawn_delivery(mut deliverer: Deliverer, queue_depth: usize) -> Result<Route, PipelineError> {
    let (tx, rx) = mpsc::sync_channel::<FusedResult>(queue_depth.max(1));
    let join = std::thread::Builder::new()
        .name("fusion-delivery".into())
        .spawn(move || {
            for result in rx {
                deliverer.deliver(result);
            }
        })
        .map_err(|source| PipelineError::Spawn {
            name: "delivery",
            source,
        })?;
    Ok(Route::Threaded { tx, join })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::DepthMap;
    use crate::detect::DetectionSet;
    use crate::fuse::{CameraIntrinsics, FrameLatency};
    use std::sync::Mutex;
    use std::time::SystemTime;

    fn result(sequence: u64) -> FusedResult {
        FusedResult {
            sequence,
            width: 1,
            height: 1,
            captured_at: SystemTime::now(),
            detections: DetectionSet::new(sequence, Vec::new()),
            depth: DepthMap::filled(1, 1, 1.0).unwrap().with_sequence(sequence),
            objects: Vec::new(),
            tracks: Vec::new(),
            intrinsics: CameraIntrinsics::approximate(1, 1, 0.8),
            latency: FrameLatency::default(),
        }
    }

    fn sink(
        callback: Option<Box<dyn ResultCallback>>,
        mode: DeliveryMode,
    ) -> (ResultSink, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let sink = ResultSink::new(
            callback,
            mode,
            8,
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        (sink, stats)
    }

    #[test]
    fn failing_callback_is_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback = move |r: FusedResult| -> anyhow::Result<()> {
            if r.sequence == 3 {
                anyhow::bail!("callback rejected frame 3");
            }
            if r.sequence == 5 {
                panic!("callback exploded");
            }
            seen_cb.lock().unwrap().push(r.sequence);
            Ok(())
        };
        let (mut sink, stats) = sink(Some(Box::new(callback)), DeliveryMode::Inline);
        for seq in 1..=6 {
            sink.submit(result(seq));
        }
        sink.close();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 4, 6]);
        let snap = stats.snapshot();
        assert_eq!(snap.callback_failures, 2);
        assert_eq!(snap.results_delivered, 4);
    }

    #[test]
    fn out_of_order_results_are_suppressed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback = move |r: FusedResult| -> anyhow::Result<()> {
            seen_cb.lock().unwrap().push(r.sequence);
            Ok(())
        };
        let (mut sink, stats) = sink(Some(Box::new(callback)), DeliveryMode::Inline);
        sink.submit(result(2));
        sink.submit(result(1));
        sink.submit(result(2));
        sink.submit(result(4));
        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
        assert_eq!(stats.snapshot().out_of_order_frames, 2);
    }

    #[test]
    fn no_callback_discards() {
        let (mut sink, stats) = sink(None, DeliveryMode::Threaded);
        sink.submit(result(1));
        sink.submit(result(2));
        sink.close();
        let snap = stats.snapshot();
        assert_eq!(snap.results_discarded, 2);
        assert_eq!(snap.results_delivered, 0);
    }

    #[test]
    fn threaded_delivery_flushes_on_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback = move |r: FusedResult| -> anyhow::Result<()> {
            seen_cb.lock().unwrap().push(r.sequence);
            Ok(())
        };
        let (mut sink, stats) = sink(Some(Box::new(callback)), DeliveryMode::Threaded);
        for seq in 1..=5 {
            sink.submit(result(seq));
        }
        sink.close();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(stats.snapshot().results_delivered, 5);
    }

    #[test]
    fn full_queue_waits_for_slow_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback = move |r: FusedResult| -> anyhow::Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(10));
            seen_cb.lock().unwrap().push(r.sequence);
            Ok(())
        };
        let stats = Arc::new(PipelineStats::new());
        let mut sink = ResultSink::new(
            Some(Box::new(callback)),
            DeliveryMode::Threaded,
            1,
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        for seq in 1..=6 {
            sink.submit(result(seq));
        }
        sink.close();
        assert_eq!(*seen.lock().unwrap(), (1..=6).collect::<Vec<_>>());
        let snap = stats.snapshot();
        assert_eq!(snap.results_delivered, 6);
        assert_eq!(snap.results_discarded, 0);
    }

    #[test]
    fn delivery_mode_parses_aliases() {
        assert_eq!("async".parse::<DeliveryMode>(), Ok(DeliveryMode::Threaded));
        assert_eq!("Inline".parse::<DeliveryMode>(), Ok(DeliveryMode::Inline));
        assert!("batch".parse::<DeliveryMode>().is_err());
    }
}
