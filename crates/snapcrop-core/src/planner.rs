use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

/// Axis-aligned detector box in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropRectangle {
    pub left: u32,
    pub upper: u32,
    pub right: u32,
    pub lower: u32,
}

impl CropRectangle {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.lower.saturating_sub(self.upper)
    }

    pub fn fits_within(&self, image_width: u32, image_height: u32) -> bool {
        self.left < self.right && self.right <= image_width && self.upper < self.lower && self.lower <= image_height
    }
}

/// Centers a `target_width` x `target_height` window on the given point and
/// clips it to the image. The window is not shifted back inside, so it can
/// come out smaller than requested near the right and bottom edges.
pub fn plan_crop(
    image_width: u32,
    image_height: u32,
    center_x: u32,
    center_y: u32,
    target_width: u32,
    target_height: u32,
) -> CropRectangle {
    let left = center_x.saturating_sub(target_width / 2);
    let upper = center_y.saturating_sub(target_height / 2);
    let right = image_width.min(left.saturating_add(target_width));
    let lower = image_height.min(upper.saturating_add(target_height));
    CropRectangle {
        left,
        upper,
        right,
        lower,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CenterSource {
    /// Index into the detector's box list.
    Detection { index: usize },
    ImageCenter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterChoice {
    pub center: Point,
    pub source: CenterSource,
}

/// Index of the largest box. Equal areas keep the earliest box.
pub fn largest_box(boxes: &[BoundingBox]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, candidate) in boxes.iter().enumerate() {
        let area = candidate.area();
        if !area.is_finite() {
            continue;
        }
        match best {
            Some((_, best_area)) if area <= best_area => {}
            _ => best = Some((index, area)),
        }
    }
    best.map(|(index, _)| index)
}

pub fn resolve_center(image_width: u32, image_height: u32, boxes: &[BoundingBox]) -> CenterChoice {
    match largest_box(boxes) {
        Some(index) => {
            let chosen = &boxes[index];
            let mid_x = ((chosen.x1 + chosen.x2) / 2.0) as u32;
            let mid_y = ((chosen.y1 + chosen.y2) / 2.0) as u32;
            CenterChoice {
                center: Point {
                    x: mid_x.min(image_width.saturating_sub(1)),
                    y: mid_y.min(image_height.saturating_sub(1)),
                },
                source: CenterSource::Detection { index },
            }
        }
        None => CenterChoice {
            center: Point {
                x: image_width / 2,
                y: image_height / 2,
            },
            source: CenterSource::ImageCenter,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn centered_square_on_empty_detections() {
        let choice = resolve_center(1000, 1000, &[]);
        assert_eq!(choice.source, CenterSource::ImageCenter);
        assert_eq!(choice.center, Point { x: 500, y: 500 });
        let rect = plan_crop(1000, 1000, choice.center.x, choice.center.y, 1000, 1000);
        assert_eq!(
            rect,
            CropRectangle {
                left: 0,
                upper: 0,
                right: 1000,
                lower: 1000
            }
        );
    }

    #[test]
    fn portrait_crop_centers_on_single_detection() {
        let boxes = [bbox(800.0, 800.0, 1200.0, 1200.0)];
        let choice = resolve_center(2000, 2000, &boxes);
        assert_eq!(choice.source, CenterSource::Detection { index: 0 });
        assert_eq!(choice.center, Point { x: 1000, y: 1000 });
        let rect = plan_crop(2000, 2000, 1000, 1000, 800, 1000);
        assert_eq!(
            rect,
            CropRectangle {
                left: 600,
                upper: 500,
                right: 1400,
                lower: 1500
            }
        );
    }

    #[test]
    fn largest_area_wins() {
        // 500 px^2 box first, 2000 px^2 box second.
        let boxes = [bbox(0.0, 0.0, 25.0, 20.0), bbox(100.0, 100.0, 150.0, 140.0)];
        assert_eq!(largest_box(&boxes), Some(1));
        let choice = resolve_center(400, 400, &boxes);
        assert_eq!(choice.center, Point { x: 125, y: 120 });
    }

    #[test]
    fn equal_areas_keep_first_box() {
        let boxes = [
            bbox(0.0, 0.0, 10.0, 10.0),
            bbox(50.0, 50.0, 60.0, 60.0),
            bbox(20.0, 20.0, 30.0, 30.0),
        ];
        assert_eq!(largest_box(&boxes), Some(0));
    }

    #[test]
    fn non_finite_boxes_are_skipped() {
        let boxes = [bbox(f32::NAN, 0.0, 10.0, 10.0), bbox(0.0, 0.0, 4.0, 4.0)];
        assert_eq!(largest_box(&boxes), Some(1));
    }

    #[test]
    fn midpoint_truncates_and_stays_inside_image() {
        let boxes = [bbox(10.0, 11.0, 13.0, 14.0)];
        assert_eq!(resolve_center(100, 100, &boxes).center, Point { x: 11, y: 12 });

        let overhanging = [bbox(90.0, -30.0, 130.0, 10.0)];
        assert_eq!(resolve_center(100, 100, &overhanging).center, Point { x: 99, y: 0 });
    }

    #[test]
    fn left_edge_clamps_to_zero() {
        let rect = plan_crop(1000, 800, 100, 400, 600, 400);
        assert_eq!(rect.left, 0);
        assert_eq!(rect.right, 600);
    }

    #[test]
    fn right_edge_clamps_to_image_width() {
        let rect = plan_crop(1000, 800, 900, 400, 600, 400);
        assert_eq!(rect.left, 600);
        assert_eq!(rect.right, 1000);
        assert_eq!(rect.width(), 400);
    }

    #[test]
    fn full_width_target_always_reaches_right_edge() {
        for center_x in [0, 250, 500, 999] {
            let rect = plan_crop(1000, 1000, center_x, 500, 1000, 500);
            assert_eq!(rect.right, 1000);
            if center_x <= 500 {
                assert_eq!(rect.left, 0);
            }
        }
    }

    #[test]
    fn planned_rectangles_stay_within_bounds() {
        let (width, height) = (640u32, 480u32);
        for center_x in (0..width).step_by(37) {
            for center_y in (0..height).step_by(29) {
                for target_width in [1, 100, 333, 640] {
                    for target_height in [1, 50, 480, 900] {
                        let rect = plan_crop(width, height, center_x, center_y, target_width, target_height);
                        assert!(rect.fits_within(width, height), "{:?}", rect);
                        assert!(rect.width() <= target_width);
                        assert!(rect.height() <= target_height);
                        assert_eq!(
                            rect,
                            plan_crop(width, height, center_x, center_y, target_width, target_height)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }
}
