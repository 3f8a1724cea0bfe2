use std::fmt;

use serde::Serialize;

use super::state::PipelineState;

/// Which backend slot a condition refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendRole {
    Detector,
    Depth,
}

impl BackendRole {
    pub(crate) fn index(self) -> usize {
        match self {
            BackendRole::Detector => 0,
            BackendRole::Depth => 1,
        }
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendRole::Detector => "detector",
            BackendRole::Depth => "depth",
        })
    }
}

/// Conditions surfaced to the caller while the pipeline runs.
///
/// Per-frame faults never appear here; they are only counted in `PipelineStats`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// Emitted once when a role reaches the consecutive-failure threshold. The backend keeps
    /// being called; it is not restarted.
    BackendUnhealthy {
        role: BackendRole,
        consecutive_failures: u32,
    },
    /// The role produced a good output after having been reported unhealthy.
    BackendRecovered { role: BackendRole },
    /// The frame source reported itself unhealthy (for example a capture stall) but is still
    /// producing frames.
    SourceUnhealthy { source: String },
    SourceRecovered { source: String },
    FrameSourceFailed { message: String },
}

/// Consecutive-failure tracking for one backend role.
#[derive(Debug)]
pub(crate) struct RoleHealth {
    role: BackendRole,
    threshold: u32,
    consecutive: u32,
    unhealthy: bool,
}

impl RoleHealth {
    pub(crate) fn new(role: BackendRole, threshold: u32) -> Self {
        Self {
            role,
            threshold: threshold.max(1),
            consecutive: 0,
            unhealthy: false,
        }
    }

    /// Record a failure. Returns the event to emit when the threshold is first reached.
    pub(crate) fn record_failure(&mut self) -> Option<PipelineEvent> {
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.unhealthy && self.consecutive >= self.threshold {
            self.unhealthy = true;
            return Some(PipelineEvent::BackendUnhealthy {
                role: self.role,
                consecutive_failures: self.consecutive,
            });
        }
        None
    }

    /// Record a success, resetting the streak.
    pub(crate) fn record_success(&mut self) -> Option<PipelineEvent> {
        self.consecutive = 0;
        if self.unhealthy {
            self.unhealthy = false;
            return Some(PipelineEvent::BackendRecovered { role: self.role });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_fires_once_per_streak() {
        let mut health = RoleHealth::new(BackendRole::Depth, 3);
        assert_eq!(health.record_failure(), None);
        assert_eq!(health.record_failure(), None);
        assert_eq!(
            health.record_failure(),
            Some(PipelineEvent::BackendUnhealthy {
                role: BackendRole::Depth,
                consecutive_failures: 3
            })
        );
        assert_eq!(health.record_failure(), None);
        assert_eq!(
            health.record_success(),
            Some(PipelineEvent::BackendRecovered {
                role: BackendRole::Depth
            })
        );
        assert_eq!(health.record_success(), None);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut health = RoleHealth::new(BackendRole::Detector, 3);
        health.record_failure();
        health.record_failure();
        health.record_success();
        assert_eq!(health.record_failure(), None);
        assert_eq!(health.record_failure(), None);
        assert!(health.record_failure().is_some());
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&PipelineEvent::BackendRecovered {
            role: BackendRole::Detector,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"backend_recovered","role":"detector"}"#);
        let json = serde_json::to_string(&PipelineEvent::SourceUnhealthy {
            source: "v4l2:///dev/video0".to_string(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"source_unhealthy","source":"v4l2:///dev/video0"}"#
        );
    }
}
