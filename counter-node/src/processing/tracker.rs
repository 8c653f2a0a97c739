//! Centroid tracker: associates per-frame boxes into persistent identities.
//!
//! Each call to [`CentroidTracker::update`] consumes one frame's boxes. Existing
//! tracks are matched to detections by greedy nearest-centroid assignment under
//! `distance_threshold`; unmatched tracks age and are dropped once they have been
//! missing for more than `max_disappeared` consecutive frames; unmatched
//! detections open new tracks. Ids are handed out from a per-instance counter
//! starting at 1 and are never reused.

use std::collections::{BTreeMap, VecDeque};

use headcount_common::Detection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrackerConfig;

pub type TrackId = u64;

const POSITION_HISTORY_SIZE: usize = 30;

/// Axis-aligned box in frame pixels, top-left anchored.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    pub fn centroid(&self) -> Centroid {
        Centroid {
            cx: self.x + self.width / 2.0,
            cy: self.y + self.height / 2.0,
        }
    }

    /// Finite position and finite, non-negative extent.
    pub fn is_well_formed(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

impl From<&Detection> for BoundingBox {
    fn from(detection: &Detection) -> Self {
        Self {
            x: detection.bbox.xmin,
            y: detection.bbox.ymin,
            width: detection.bbox.width(),
            height: detection.bbox.height(),
            confidence: detection.confidence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub cx: f32,
    pub cy: f32,
}

impl Centroid {
    pub fn new(cx: f32, cy: f32) -> Self {
        Self { cx, cy }
    }

    pub fn distance(&self, other: &Centroid) -> f32 {
        (self.cx - other.cx).hypot(self.cy - other.cy)
    }
}

/// One tracked identity.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub centroid: Centroid,
    /// Box of the detection that last matched this track.
    pub last_box: BoundingBox,
    /// Consecutive frames since the last successful match.
    pub disappeared_count: u32,
    /// Recent centroids, oldest first.
    pub history: VecDeque<Centroid>,
}

impl Track {
    fn new(id: TrackId, bbox: BoundingBox) -> Self {
        let centroid = bbox.centroid();
        let mut history = VecDeque::with_capacity(POSITION_HISTORY_SIZE);
        history.push_back(centroid);
        Self {
            id,
            centroid,
            last_box: bbox,
            disappeared_count: 0,
            history,
        }
    }

    fn observe(&mut self, bbox: BoundingBox) {
        self.centroid = bbox.centroid();
        self.last_box = bbox;
        self.disappeared_count = 0;
        self.history.push_back(self.centroid);
        if self.history.len() > POSITION_HISTORY_SIZE {
            self.history.pop_front();
        }
    }
}

/// A detection from the latest frame and the track it was attributed to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub track_id: TrackId,
    pub bbox: BoundingBox,
    /// True when this detection opened the track.
    pub is_new: bool,
}

pub struct CentroidTracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
    assignments: Vec<Assignment>,
}

impl CentroidTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 1,
            assignments: Vec::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Id the next new track will receive. Strictly greater than every id issued so far.
    pub fn next_id(&self) -> TrackId {
        self.next_id
    }

    /// Number of distinct identities created over the tracker's lifetime.
    pub fn total_unique(&self) -> u64 {
        self.next_id - 1
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Active tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Detections of the most recent frame with their track ids, in input order.
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Advances the tracker by one frame and returns the centroids of all active tracks.
    pub fn update(&mut self, detections: &[BoundingBox]) -> BTreeMap<TrackId, Centroid> {
        let detections: Vec<BoundingBox> = detections
            .iter()
            .copied()
            .filter(|bbox| {
                let ok = bbox.is_well_formed();
                if !ok {
                    debug!("Dropping malformed detection {:?}", bbox);
                }
                ok
            })
            .collect();

        let mut slots: Vec<Option<TrackId>> = vec![None; detections.len()];
        let mut created = vec![false; detections.len()];

        if self.tracks.is_empty() {
            for (idx, bbox) in detections.iter().enumerate() {
                slots[idx] = Some(self.register(*bbox));
                created[idx] = true;
            }
        } else if detections.is_empty() {
            let all: Vec<TrackId> = self.tracks.keys().copied().collect();
            self.age(&all);
        } else {
            let centroids: Vec<Centroid> = detections.iter().map(BoundingBox::centroid).collect();
            let mut unmatched_tracks: Vec<TrackId> = Vec::new();

            for (track_id, det_idx) in self.greedy_match(&centroids) {
                if let Some(track) = self.tracks.get_mut(&track_id) {
                    track.observe(detections[det_idx]);
                }
                slots[det_idx] = Some(track_id);
            }

            for &track_id in self.tracks.keys() {
                if !slots.contains(&Some(track_id)) {
                    unmatched_tracks.push(track_id);
                }
            }
            self.age(&unmatched_tracks);

            for (idx, bbox) in detections.iter().enumerate() {
                if slots[idx].is_none() {
                    slots[idx] = Some(self.register(*bbox));
                    created[idx] = true;
                }
            }
        }

        self.assignments = detections
            .iter()
            .zip(slots)
            .zip(created)
            .filter_map(|((bbox, slot), is_new)| {
                slot.map(|track_id| Assignment {
                    track_id,
                    bbox: *bbox,
                    is_new,
                })
            })
            .collect();

        self.tracks
            .iter()
            .map(|(id, track)| (*id, track.centroid))
            .collect()
    }

    /// Greedy global-minimum matching over the track × detection distance matrix.
    ///
    /// Candidates are visited by ascending distance, then track id, then detection
    /// index; pairs farther than the threshold are never committed.
    fn greedy_match(&self, centroids: &[Centroid]) -> Vec<(TrackId, usize)> {
        let threshold = self.config.distance_threshold;
        let mut candidates: Vec<(f32, TrackId, usize)> = Vec::new();
        for (track_id, track) in &self.tracks {
            for (det_idx, centroid) in centroids.iter().enumerate() {
                let dist = track.centroid.distance(centroid);
                if dist <= threshold {
                    candidates.push((dist, *track_id, det_idx));
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut used_tracks: Vec<TrackId> = Vec::new();
        let mut used_detections = vec![false; centroids.len()];
        let mut matches = Vec::new();

        for (_, track_id, det_idx) in candidates {
            if used_detections[det_idx] || used_tracks.contains(&track_id) {
                continue;
            }
            used_detections[det_idx] = true;
            used_tracks.push(track_id);
            matches.push((track_id, det_idx));
        }

        matches
    }

    fn register(&mut self, bbox: BoundingBox) -> TrackId {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.insert(id, Track::new(id, bbox));
        debug!("New track {} at {:?}", id, bbox.centroid());
        id
    }

    fn age(&mut self, ids: &[TrackId]) {
        let max_disappeared = self.config.max_disappeared;
        for id in ids {
            let expired = match self.tracks.get_mut(id) {
                Some(track) => {
                    track.disappeared_count += 1;
                    track.disappeared_count > max_disappeared
                }
                None => false,
            };
            if expired {
                self.tracks.remove(id);
                debug!("Track {} expired", id);
            }
        }
    }
}

impl Default for CentroidTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_at(cx: f32, cy: f32) -> BoundingBox {
        BoundingBox::new(cx - 5.0, cy - 5.0, 10.0, 10.0, 0.9)
    }

    fn tracker(distance_threshold: f32, max_disappeared: u32) -> CentroidTracker {
        CentroidTracker::new(TrackerConfig {
            distance_threshold,
            max_disappeared,
        })
    }

    #[test]
    fn test_single_object_keeps_identity() {
        let mut tracker = CentroidTracker::default();
        for (cx, cy) in [(10.0, 10.0), (12.0, 11.0), (15.0, 14.0)] {
            let state = tracker.update(&[box_at(cx, cy)]);
            assert_eq!(state.len(), 1);
            assert_eq!(state[&1], Centroid::new(cx, cy));
            assert_eq!(tracker.track(1).unwrap().disappeared_count, 0);
        }
        assert_eq!(tracker.next_id(), 2);
        assert_eq!(tracker.total_unique(), 1);
        assert_eq!(tracker.track(1).unwrap().history.len(), 3);
    }

    #[test]
    fn test_empty_frames_expire_after_max_plus_one() {
        let max = 10;
        let mut tracker = tracker(100.0, max);
        tracker.update(&[box_at(10.0, 10.0), box_at(300.0, 300.0)]);

        for frame in 1..=max {
            let state = tracker.update(&[]);
            assert_eq!(state.len(), 2, "tracks dropped early at empty frame {}", frame);
        }
        assert!(tracker.update(&[]).is_empty());
        assert_eq!(tracker.total_unique(), 2);
    }

    #[test]
    fn test_reappearance_far_away_gets_new_id() {
        let mut tracker = CentroidTracker::default();
        tracker.update(&[box_at(10.0, 10.0)]);
        for _ in 0..tracker.config().max_disappeared {
            tracker.update(&[]);
        }
        assert_eq!(tracker.active_count(), 1);

        let state = tracker.update(&[box_at(500.0, 500.0)]);
        assert_eq!(state.len(), 1);
        assert!(state.contains_key(&2));
        assert!(tracker.track(1).is_none());
    }

    #[test]
    fn test_equal_distance_tie_prefers_lower_detection_index() {
        let mut tracker = CentroidTracker::default();
        tracker.update(&[box_at(10.0, 11.0)]);

        let state = tracker.update(&[box_at(10.0, 10.0), box_at(10.0, 12.0)]);
        assert_eq!(state[&1], Centroid::new(10.0, 10.0));
        assert_eq!(state[&2], Centroid::new(10.0, 12.0));

        let assignments = tracker.assignments();
        assert_eq!(assignments[0].track_id, 1);
        assert!(!assignments[0].is_new);
        assert_eq!(assignments[1].track_id, 2);
        assert!(assignments[1].is_new);
    }

    #[test]
    fn test_closer_detection_wins() {
        let mut tracker = CentroidTracker::default();
        tracker.update(&[box_at(10.0, 11.0)]);

        let state = tracker.update(&[box_at(10.0, 40.0), box_at(10.0, 12.0)]);
        assert_eq!(state[&1], Centroid::new(10.0, 12.0));
        assert_eq!(state[&2], Centroid::new(10.0, 40.0));
    }

    #[test]
    fn test_tie_between_tracks_prefers_lower_track_id() {
        let mut tracker = CentroidTracker::default();
        tracker.update(&[box_at(0.0, 0.0), box_at(20.0, 0.0)]);

        // Equidistant from both tracks; track 1 claims it and track 2 ages.
        tracker.update(&[box_at(10.0, 0.0)]);
        assert_eq!(tracker.track(1).unwrap().centroid, Centroid::new(10.0, 0.0));
        assert_eq!(tracker.track(2).unwrap().disappeared_count, 1);
    }

    #[test]
    fn test_beyond_threshold_never_merges() {
        let mut tracker = tracker(50.0, 10);
        tracker.update(&[box_at(0.0, 0.0)]);
        let state = tracker.update(&[box_at(51.0, 0.0)]);
        assert_eq!(state.len(), 2);
        assert_eq!(tracker.track(1).unwrap().disappeared_count, 1);
        assert_eq!(tracker.track(2).unwrap().centroid, Centroid::new(51.0, 0.0));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut tracker = tracker(50.0, 10);
        tracker.update(&[box_at(0.0, 0.0)]);
        let state = tracker.update(&[box_at(50.0, 0.0)]);
        assert_eq!(state.len(), 1);
        assert_eq!(state[&1], Centroid::new(50.0, 0.0));
    }

    #[test]
    fn test_single_nearby_detection_always_matches() {
        let mut tracker = CentroidTracker::default();
        tracker.update(&[box_at(100.0, 100.0), box_at(400.0, 400.0)]);
        tracker.update(&[box_at(130.0, 90.0)]);
        assert_eq!(tracker.next_id(), 3);
        assert_eq!(tracker.track(1).unwrap().disappeared_count, 0);
        assert_eq!(tracker.track(2).unwrap().disappeared_count, 1);
    }

    #[test]
    fn test_malformed_detections_are_dropped() {
        let mut tracker = CentroidTracker::default();
        let state = tracker.update(&[
            BoundingBox::new(0.0, 0.0, -4.0, 10.0, 0.9),
            BoundingBox::new(f32::NAN, 0.0, 10.0, 10.0, 0.9),
            BoundingBox::new(0.0, 0.0, f32::INFINITY, 10.0, 0.9),
            box_at(50.0, 50.0),
        ]);
        assert_eq!(state.len(), 1);
        assert_eq!(tracker.next_id(), 2);
        assert_eq!(tracker.assignments().len(), 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let frames: Vec<Vec<BoundingBox>> = (0..40)
            .map(|i| {
                let t = i as f32;
                let mut boxes = vec![box_at(10.0 + 3.0 * t, 50.0), box_at(400.0 - 2.0 * t, 60.0)];
                if i % 7 == 3 {
                    boxes.clear();
                }
                if i % 5 == 0 {
                    boxes.push(box_at(200.0, 300.0 + t));
                }
                boxes
            })
            .collect();

        let run = || {
            let mut tracker = CentroidTracker::default();
            frames
                .iter()
                .map(|boxes| tracker.update(boxes))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_next_id_never_decreases() {
        let mut tracker = tracker(20.0, 2);
        let mut last = tracker.next_id();
        for i in 0..50 {
            let boxes: Vec<BoundingBox> = if i % 4 == 0 {
                Vec::new()
            } else {
                (0..(i % 3 + 1)).map(|k| box_at(k as f32 * 37.0 + i as f32 * 11.0, 0.0)).collect()
            };
            tracker.update(&boxes);
            assert!(tracker.next_id() >= last);
            last = tracker.next_id();
        }
    }
}
