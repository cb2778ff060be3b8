//! Face box estimation from a single eye region.
//!
//! The descriptor extractor needs a face crop, but the landmark detector
//! only reports eye regions. A face is roughly three eye-widths wide and
//! four eye-heights tall, with the eye in the upper-middle third.

use crate::types::BoundingBox;

const FACE_WIDTH_RATIO: f32 = 3.0;
const FACE_HEIGHT_RATIO: f32 = 4.0;
/// Eye-widths of face to the left of the eye box.
const LEFT_MARGIN_RATIO: f32 = 1.0;
/// Eye-heights of face above the eye box.
const TOP_MARGIN_RATIO: f32 = 1.5;

/// Estimate the containing face box for an eye box.
///
/// Coordinates are clamped to be non-negative; negative or NaN sizes
/// collapse to zero.
pub fn estimate_face_box(eye: &BoundingBox) -> BoundingBox {
    let w = non_negative(eye.width);
    let h = non_negative(eye.height);

    BoundingBox {
        x: non_negative(eye.x - w * LEFT_MARGIN_RATIO),
        y: non_negative(eye.y - h * TOP_MARGIN_RATIO),
        width: w * FACE_WIDTH_RATIO,
        height: h * FACE_HEIGHT_RATIO,
    }
}

fn non_negative(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.max(0.0)
    }
}
