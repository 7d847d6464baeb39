use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    FACE_INPUT_SIZE,
    common::{self, load_session, sigmoid},
};
use crate::types::{FACE_LANDMARKS, Frame};

/// Pose landmarks 0..=10 cover nose, eyes, ears and mouth corners.
const POSE_FACE_POINTS: usize = 11;
const POSE_LEFT_EYE: usize = 2;
const POSE_RIGHT_EYE: usize = 5;
const ROI_SCALE: f32 = 1.8;
const MIN_ROI_SIDE: f32 = 32.0;

/// Face mesh run on a ROI derived from the pose face points, the way the
/// holistic pipeline chains its models.
pub struct FaceLandmarker {
    session: Session,
    min_confidence: f32,
}

impl FaceLandmarker {
    pub fn new(model_path: &Path, min_confidence: f32, intra_threads: usize) -> Result<Self> {
        let session = load_session(model_path, intra_threads, "face mesh model")?;
        Ok(Self {
            session,
            min_confidence,
        })
    }

    pub fn detect(&mut self, frame: &Frame, pose: &[[f32; 4]]) -> Result<Option<Vec<[f32; 3]>>> {
        let Some((center, side, angle)) = face_roi(pose, frame.width, frame.height) else {
            return Ok(None);
        };

        let (input, transform) =
            common::prepare_rotated_crop(frame, center, side, angle, FACE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run face mesh session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "face mesh returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let flag = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .map(sigmoid)
            .unwrap_or(0.0);
        if flag < self.min_confidence {
            log::debug!("no face (flag {flag:.2})");
            return Ok(None);
        }

        let raw = outputs[0].try_extract_array::<f32>()?;
        let flat: Vec<f32> = raw.iter().copied().collect();
        let width = frame.width.max(1) as f32;
        let height = frame.height.max(1) as f32;
        let z_scale = transform.pixel_scale() / width;

        let points = common::decode_points(&flat, FACE_LANDMARKS, 3)?
            .into_iter()
            .map(|p| {
                let (x, y) = transform.project(p[0], p[1]);
                [x / width, y / height, p[2] * z_scale]
            })
            .collect();

        Ok(Some(points))
    }
}

/// Centre, side and roll (eye line) of the face crop in frame pixels.
fn face_roi(pose: &[[f32; 4]], width: u32, height: u32) -> Option<((f32, f32), f32, f32)> {
    if pose.len() < POSE_FACE_POINTS {
        return None;
    }
    let (w, h) = (width as f32, height as f32);
    let points: Vec<(f32, f32)> = pose[..POSE_FACE_POINTS]
        .iter()
        .map(|p| (p[0] * w, p[1] * h))
        .collect();

    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0_f32, 0.0_f32), |acc, (x, y)| (acc.0 + x, acc.1 + y));
    let center = (sx / n, sy / n);

    let (min_x, max_x, min_y, max_y) = points
        .iter()
        .fold((f32::MAX, f32::MIN, f32::MAX, f32::MIN), |acc, (x, y)| {
            (acc.0.min(*x), acc.1.max(*x), acc.2.min(*y), acc.3.max(*y))
        });
    let side = ((max_x - min_x).max(max_y - min_y) * ROI_SCALE).max(MIN_ROI_SIDE);

    let left_eye = points[POSE_LEFT_EYE];
    let right_eye = points[POSE_RIGHT_EYE];
    let angle = (left_eye.1 - right_eye.1).atan2(left_eye.0 - right_eye.0);

    Some((center, side, angle))
}
