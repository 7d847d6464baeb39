use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::session::Session;
use ort::value::Tensor;

use super::{
    HAND_INPUT_SIZE,
    common::{self, load_session},
    palm::{PalmDetector, PalmDetectorConfig, crop_from_palm, pick_regions},
};
use crate::types::{Frame, HAND_LANDMARKS, HandLandmarks, Handedness, PalmRegion};

const MAX_HANDS: usize = 2;

/// Palm detection followed by the 21-point hand landmark model on a rotated
/// crop around each palm.
pub struct HandLandmarker {
    handpose: Session,
    palm_detector: PalmDetector,
    min_confidence: f32,
}

impl HandLandmarker {
    pub fn new(
        handpose_model_path: &Path,
        palm_detector_model_path: &Path,
        min_confidence: f32,
        intra_threads: usize,
    ) -> Result<Self> {
        let handpose = load_session(handpose_model_path, intra_threads, "hand landmark model")?;
        let palm_detector = PalmDetector::new(
            palm_detector_model_path,
            PalmDetectorConfig {
                score_threshold: min_confidence,
                ..PalmDetectorConfig::default()
            },
            intra_threads,
        )?;

        Ok(Self {
            handpose,
            palm_detector,
            min_confidence,
        })
    }

    pub fn detect(&mut self, frame: &Frame) -> Result<(Vec<HandLandmarks>, Vec<PalmRegion>)> {
        let palm_regions = self.palm_detector.detect(frame)?;
        let mut hands = Vec::with_capacity(MAX_HANDS);

        for region in pick_regions(&palm_regions, MAX_HANDS) {
            match self.estimate(frame, region) {
                Ok(Some(hand)) => hands.push(hand),
                Ok(None) => {}
                Err(err) => log::warn!("hand landmark estimation failed: {err:?}"),
            }
        }

        Ok((hands, palm_regions))
    }

    fn estimate(&mut self, frame: &Frame, region: &PalmRegion) -> Result<Option<HandLandmarks>> {
        let (center, side, angle) = crop_from_palm(region);
        let (input, transform) =
            common::prepare_rotated_crop(frame, center, side, angle, HAND_INPUT_SIZE)?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .handpose
            .run(ort::inputs![tensor])
            .context("failed to run hand landmark session")?;

        if outputs.len() < 1 {
            return Err(anyhow!("hand landmark model returned no outputs"));
        }

        let first_scalar = |idx: usize| -> f32 {
            if outputs.len() > idx {
                outputs[idx]
                    .try_extract_array::<f32>()
                    .ok()
                    .and_then(|arr| arr.iter().next().copied())
                    .unwrap_or(0.0)
            } else {
                0.0
            }
        };
        let score = (first_scalar(1) * region.score).clamp(0.0, 1.0);
        if score < self.min_confidence {
            log::debug!("dropping hand with score {score:.2}");
            return Ok(None);
        }
        let handedness = Handedness::from_score(first_scalar(2));

        let coords = outputs[0].try_extract_array::<f32>()?;
        let flat: Vec<f32> = coords.iter().copied().collect();
        let width = frame.width.max(1) as f32;
        let height = frame.height.max(1) as f32;
        let z_scale = transform.pixel_scale() / width;

        let points = common::decode_points(&flat, HAND_LANDMARKS, 3)?
            .into_iter()
            .map(|p| {
                let (x, y) = transform.project(p[0], p[1]);
                [x / width, y / height, p[2] * z_scale]
            })
            .collect();

        Ok(Some(HandLandmarks {
            points,
            handedness,
            score,
        }))
    }
}
