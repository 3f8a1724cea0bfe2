//! Multi-object tracking over fused results.
//!
//! Tracks are associated frame to frame by greedy IoU matching of the detection boxes. A track
//! is reported once it has been matched `min_hits` times and is forgotten after `max_age`
//! consecutive frames without a match. Positions come from the fused 3D estimate of each
//! object, velocities from the capture-time difference between two matched frames.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::fuse::LocatedObject;

pub const DEFAULT_MAX_OBJECTS: usize = 50;
pub const DEFAULT_MAX_AGE: u32 = 30;
pub const DEFAULT_MIN_HITS: u32 = 3;
pub const DEFAULT_TRACK_IOU: f32 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// No new tracks are opened while this many are alive.
    pub max_objects: usize,
    /// Frames a track survives without a match.
    pub max_age: u32,
    /// Matches needed before a track is reported.
    pub min_hits: u32,
    /// Minimum box overlap for a detection to continue a track.
    pub iou_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_objects: DEFAULT_MAX_OBJECTS,
            max_age: DEFAULT_MAX_AGE,
            min_hits: DEFAULT_MIN_HITS,
            iou_threshold: DEFAULT_TRACK_IOU,
        }
    }
}

/// A confirmed object track as seen after the latest update.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    pub id: u64,
    /// Camera-space position in meters.
    pub position: [f32; 3],
    pub bbox: [f32; 4],
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    /// Meters per second. `None` until the track has been matched a second time.
    pub velocity: Option<[f32; 3]>,
    /// Opened on this frame.
    pub is_new: bool,
    pub frames_tracked: u32,
}

struct TrackState {
    id: u64,
    detection: Detection,
    position: [f32; 3],
    velocity: Option<[f32; 3]>,
    hits: u32,
    age: u32,
    frames_tracked: u32,
    is_new: bool,
}

impl TrackState {
    fn open(id: u64, object: &LocatedObject) -> Self {
        Self {
            id,
            detection: object.detection.clone(),
            position: object.position,
            velocity: None,
            hits: 1,
            age: 0,
            frames_tracked: 1,
            is_new: true,
        }
    }

    fn matched(&mut self, object: &LocatedObject, dt: f32) {
        if dt > 0.0 {
            let [x0, y0, z0] = self.position;
            let [x, y, z] = object.position;
            self.velocity = Some([(x - x0) / dt, (y - y0) / dt, (z - z0) / dt]);
        }
        self.detection = object.detection.clone();
        self.position = object.position;
        self.hits += 1;
        self.age = 0;
        self.frames_tracked += 1;
        self.is_new = false;
    }

    fn missed(&mut self) {
        self.age += 1;
        self.is_new = false;
    }

    fn snapshot(&self) -> Track {
        Track {
            id: self.id,
            position: self.position,
            bbox: self.detection.bbox(),
            class_id: self.detection.class_id,
            label: self.detection.label.clone(),
            confidence: self.detection.confidence,
            velocity: self.velocity,
            is_new: self.is_new,
            frames_tracked: self.frames_tracked,
        }
    }
}

/// Frame-to-frame tracker. Feed it results in sequence order.
pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, TrackState>,
    next_id: u64,
    last_update: Option<SystemTime>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 0,
            last_update: None,
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Live tracks, confirmed or not.
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop every track and restart ids from zero.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 0;
        self.last_update = None;
    }

    /// Advance by one frame captured at `captured_at` and return the confirmed tracks in id
    /// order.
    pub fn update(&mut self, captured_at: SystemTime, objects: &[LocatedObject]) -> Vec<Track> {
        let dt = self
            .last_update
            .and_then(|last| captured_at.duration_since(last).ok())
            .map_or(0.0, |d| d.as_secs_f32());
        self.last_update = Some(captured_at);

        let (matches, unmatched_objects, unmatched_tracks) = self.associate(objects);

        for (index, id) in matches {
            if let Some(track) = self.tracks.get_mut(&id) {
                track.matched(&objects[index], dt);
            }
        }
        for index in unmatched_objects {
            if self.tracks.len() >= self.config.max_objects {
                break;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(id, TrackState::open(id, &objects[index]));
        }
        for id in unmatched_tracks {
            if let Some(track) = self.tracks.get_mut(&id) {
                track.missed();
            }
        }

        let max_age = self.config.max_age;
        self.tracks.retain(|id, track| {
            if track.age > max_age {
                log::debug!("track {} expired after {} missed frames", id, track.age);
                false
            } else {
                true
            }
        });

        self.tracks
            .values()
            .filter(|t| t.hits >= self.config.min_hits)
            .map(TrackState::snapshot)
            .collect()
    }

    /// Greedy best-IoU-first assignment. Returns matched `(object index, track id)` pairs, the
    /// unmatched object indices and the unmatched track ids.
    fn associate(&self, objects: &[LocatedObject]) -> (Vec<(usize, u64)>, Vec<usize>, Vec<u64>) {
        let mut candidates: Vec<(f32, usize, u64)> = Vec::new();
        for (index, object) in objects.iter().enumerate() {
            for (id, track) in &self.tracks {
                let iou = object.detection.iou(&track.detection);
                if iou >= self.config.iou_threshold {
                    candidates.push((iou, index, *id));
                }
            }
        }
        // Stable: equal overlaps keep object-then-track order.
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut object_taken = vec![false; objects.len()];
        let mut track_taken: BTreeMap<u64, bool> =
            self.tracks.keys().map(|id| (*id, false)).collect();
        let mut matches = Vec::new();
        for (_, index, id) in candidates {
            if object_taken[index] || track_taken.get(&id).copied().unwrap_or(true) {
                continue;
            }
            object_taken[index] = true;
            track_taken.insert(id, true);
            matches.push((index, id));
        }

        let unmatched_objects = object_taken
            .iter()
            .enumerate()
            .filter(|(_, taken)| !**taken)
            .map(|(index, _)| index)
            .collect();
        let unmatched_tracks = track_taken
            .into_iter()
            .filter(|(_, taken)| !*taken)
            .map(|(id, _)| id)
            .collect();
        (matches, unmatched_objects, unmatched_tracks)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}
