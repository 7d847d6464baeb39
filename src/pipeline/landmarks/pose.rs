use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    POSE_INPUT_SIZE,
    common::{self, load_session, sigmoid},
};
use crate::types::{Frame, POSE_LANDMARKS};

/// x, y, z, visibility, presence
const POSE_STRIDE: usize = 5;

/// Full-body landmark model run on the letterboxed frame. The model emits a
/// few auxiliary points after the 33 body landmarks; those are ignored.
pub struct PoseLandmarker {
    session: Session,
    min_confidence: f32,
}

impl PoseLandmarker {
    pub fn new(model_path: &Path, min_confidence: f32, intra_threads: usize) -> Result<Self> {
        let session = load_session(model_path, intra_threads, "pose landmark model")?;
        Ok(Self {
            session,
            min_confidence,
        })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<Option<Vec<[f32; 4]>>> {
        let (input, letterbox) = common::prepare_frame_with_size(frame, POSE_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run pose landmark session")?;

        if outputs.len() < 2 {
            return Err(anyhow!(
                "pose model returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let presence = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);
        if presence < self.min_confidence {
            log::debug!("no pose (presence {presence:.2})");
            return Ok(None);
        }

        let raw = outputs[0].try_extract_array::<f32>()?;
        let flat: Vec<f32> = raw.iter().copied().collect();
        let width = frame.width.max(1) as f32;
        let height = frame.height.max(1) as f32;
        let z_scale = 1.0 / letterbox.scale / width;

        let points = common::decode_points(&flat, POSE_LANDMARKS, POSE_STRIDE)?
            .into_iter()
            .map(|p| {
                let (x, y) = letterbox.unproject(p[0], p[1]);
                [x / width, y / height, p[2] * z_scale, sigmoid(p[3])]
            })
            .collect();

        Ok(Some(points))
    }
}
