use super::RawDetection;
use crate::overlay::{Keypoint, KeypointSet};

/// Flatten a detection into hand/point tagged keypoints, in received order.
///
/// The output is a lossless pass-through: no filtering, smoothing or bounds
/// checking beyond what the detector produced.
pub fn map_detection(detection: &RawDetection) -> KeypointSet {
    let total = detection.hands.iter().map(Vec::len).sum();
    let mut points = Vec::with_capacity(total);

    for (hand_index, hand) in detection.hands.iter().enumerate() {
        for (point_index, landmark) in hand.iter().enumerate() {
            points.push(Keypoint {
                x: landmark.x,
                y: landmark.y,
                z: landmark.z,
                hand_index,
                point_index,
            });
        }
    }

    KeypointSet::new(points)
}
