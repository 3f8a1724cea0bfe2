use std::cmp::Ordering;

use super::result::Detection;

/// Filtering applied to raw detector output before it is stamped with a sequence number.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionFilter {
    /// Detections below this confidence are discarded.
    pub min_score: f32,
    /// Boxes overlapping a higher-scored box by more than this IoU are suppressed.
    pub nms_iou: f32,
    /// Upper bound on detections kept per frame.
    pub max_detections: usize,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            min_score: 0.25,
            nms_iou: 0.5,
            max_detections: 50,
        }
    }
}

impl DetectionFilter {
    /// Score filter, then greedy non-maximum suppression, then truncation.
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let mut kept = filter_by_score(detections, self.min_score);
        kept = non_max_suppression(kept, self.nms_iou);
        kept.truncate(self.max_detections);
        kept
    }
}

pub fn filter_by_score(detections: Vec<Detection>, min_score: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= min_score)
        .collect()
}

/// Greedy IoU suppression. Output is ordered by descending confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_highest_score_of_overlapping_boxes() {
        let dets = vec![
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.6, 0),
            Detection::new([1.0, 1.0, 11.0, 11.0], 0.9, 0),
            Detection::new([50.0, 50.0, 60.0, 60.0], 0.4, 2),
        ];
        let kept = non_max_suppression(dets, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 2);
    }

    #[test]
    fn filter_applies_score_then_limit() {
        let filter = DetectionFilter {
            min_score: 0.5,
            nms_iou: 0.5,
            max_detections: 1,
        };
        let dets = vec![
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.3, 0),
            Detection::new([20.0, 0.0, 30.0, 10.0], 0.7, 0),
            Detection::new([40.0, 0.0, 50.0, 10.0], 0.8, 0),
        ];
        let kept = filter.apply(dets);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.8);
    }
}
