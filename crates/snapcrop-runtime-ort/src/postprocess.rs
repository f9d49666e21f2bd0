use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use ndarray::ArrayViewD;
use snapcrop_core::BoundingBox;

use crate::preprocess::Letterbox;

/// Decodes a YOLOv8 detection head. Accepts `[1, 4 + classes, anchors]` and
/// the transposed `[1, anchors, 4 + classes]` layout; the smaller of the two
/// trailing axes is taken as the attribute axis.
pub fn decode_predictions(
    output: &ArrayViewD<'_, f32>,
    letterbox: &Letterbox,
    image_width: u32,
    image_height: u32,
    confidence_threshold: f32,
) -> Result<Vec<BoundingBox>> {
    let shape = output.shape();
    if shape.len() != 3 || shape[0] != 1 {
        return Err(anyhow!("unexpected detector output shape {:?}", shape));
    }
    let attributes_first = shape[1] <= shape[2];
    let (attributes, anchors) = if attributes_first {
        (shape[1], shape[2])
    } else {
        (shape[2], shape[1])
    };
    if attributes < 5 {
        return Err(anyhow!("detector output has no class scores: {:?}", shape));
    }
    let at = |attr: usize, anchor: usize| {
        if attributes_first {
            output[[0, attr, anchor]]
        } else {
            output[[0, anchor, attr]]
        }
    };

    let max_x = image_width as f32;
    let max_y = image_height as f32;
    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for class_idx in 0..attributes - 4 {
            let score = at(4 + class_idx, anchor);
            if score > best_score {
                best_score = score;
                best_class = class_idx;
            }
        }
        if best_score <= confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
        let candidate = BoundingBox {
            x1: x1.clamp(0.0, max_x),
            y1: y1.clamp(0.0, max_y),
            x2: x2.clamp(0.0, max_x),
            y2: y2.clamp(0.0, max_y),
            confidence: best_score,
            class_id: best_class as u32,
        };
        if candidate.x2 > candidate.x1 && candidate.y2 > candidate.y1 {
            detections.push(candidate);
        }
    }
    Ok(detections)
}

/// Class-wise non-maximum suppression. The result is ordered by confidence,
/// highest first; equal confidences keep class order.
pub fn non_max_suppression(detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    let mut by_class: BTreeMap<u32, Vec<BoundingBox>> = BTreeMap::new();
    for detection in detections {
        by_class.entry(detection.class_id).or_default().push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].iou(&group[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    kept
}
