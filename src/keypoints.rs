//! Flattening of per-frame landmarks into the fixed-length keypoint vector
//! the sequence classifier was trained on.

use serde::{Deserialize, Serialize};

use crate::types::{FACE_LANDMARKS, HAND_LANDMARKS, Handedness, LandmarkSet, POSE_LANDMARKS};

pub const POSE_VALUES: usize = 4;
pub const POINT_VALUES: usize = 3;

pub const POSE_LEN: usize = POSE_LANDMARKS * POSE_VALUES;
pub const FACE_LEN: usize = FACE_LANDMARKS * POINT_VALUES;
pub const HAND_LEN: usize = HAND_LANDMARKS * POINT_VALUES;

/// pose + face + left hand + right hand
pub const HOLISTIC_LEN: usize = POSE_LEN + FACE_LEN + HAND_LEN + HAND_LEN;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointLayout {
    #[default]
    Holistic,
    HandOnly,
}

impl KeypointLayout {
    pub fn len(&self) -> usize {
        match self {
            KeypointLayout::Holistic => HOLISTIC_LEN,
            KeypointLayout::HandOnly => HAND_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeypointVector(Vec<f32>);

impl KeypointVector {
    pub fn zeros(layout: KeypointLayout) -> Self {
        Self(vec![0.0; layout.len()])
    }

    pub fn from_landmarks(set: &LandmarkSet, layout: KeypointLayout) -> Self {
        let mut values = Vec::with_capacity(layout.len());
        match layout {
            KeypointLayout::Holistic => {
                push_group(&mut values, set.pose.as_deref(), POSE_LANDMARKS);
                push_group(&mut values, set.face.as_deref(), FACE_LANDMARKS);
                push_group(&mut values, set.left_hand.as_deref(), HAND_LANDMARKS);
                push_group(&mut values, set.right_hand.as_deref(), HAND_LANDMARKS);
            }
            KeypointLayout::HandOnly => {
                let left = set.left_hand.as_deref();
                let right = set.right_hand.as_deref();
                let hand = match set.primary_hand {
                    Some(Handedness::Left) => left.or(right),
                    Some(Handedness::Right) => right.or(left),
                    None => right.or(left),
                };
                push_group(&mut values, hand, HAND_LANDMARKS);
            }
        }
        debug_assert_eq!(values.len(), layout.len());
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

impl From<Vec<f32>> for KeypointVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

// Groups with an unexpected landmark count are zero-filled so the vector
// length never depends on what the detectors returned.
fn push_group<const N: usize>(out: &mut Vec<f32>, group: Option<&[[f32; N]]>, expected: usize) {
    match group {
        Some(points) if points.len() == expected => {
            for point in points {
                out.extend_from_slice(point);
            }
        }
        Some(points) => {
            log::debug!(
                "landmark group has {} points, expected {expected}; zero-filling",
                points.len()
            );
            out.resize(out.len() + expected * N, 0.0);
        }
        None => out.resize(out.len() + expected * N, 0.0),
    }
}
