//! Per-class non-maximum suppression.

use crate::detector::Detection;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Keeps the highest scoring box of every overlapping same-class cluster.
/// Boxes of different classes never suppress each other. Output is sorted by
/// descending score.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: i64, score: f32, bbox: [f32; 4]) -> Detection {
        Detection {
            class_id,
            label: class_id.to_string(),
            score,
            bbox,
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn suppresses_same_class_overlap_above_threshold() {
        let kept = non_max_suppression(
            vec![
                det(1, 0.6, [1.0, 1.0, 11.0, 11.0]),
                det(1, 0.9, [0.0, 0.0, 10.0, 10.0]),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn keeps_overlap_below_threshold_and_other_classes() {
        let kept = non_max_suppression(
            vec![
                det(1, 0.9, [0.0, 0.0, 10.0, 10.0]),
                det(1, 0.8, [5.0, 0.0, 15.0, 10.0]),
                det(2, 0.7, [0.0, 0.0, 10.0, 10.0]),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 3);
        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.7]);
    }
}
