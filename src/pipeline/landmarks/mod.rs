pub mod common;
mod face;
mod hand;
pub mod palm;
mod pose;

use anyhow::Result;

pub use face::FaceLandmarker;
pub use hand::HandLandmarker;
pub use pose::PoseLandmarker;

use crate::{
    config::ModelsConfig,
    keypoints::{KeypointLayout, KeypointVector},
    model_download::{ModelKind, ensure_model_ready},
    types::{Frame, LandmarkSet},
};

pub const PALM_INPUT_SIZE: u32 = 192;
pub const HAND_INPUT_SIZE: u32 = 224;
pub const POSE_INPUT_SIZE: u32 = 256;
pub const FACE_INPUT_SIZE: u32 = 192;

/// Produces landmarks for one frame. Detection failures are not errors: a
/// group that could not be found is simply absent from the result.
pub trait LandmarkDetector: Send + 'static {
    fn detect(&mut self, frame: &Frame) -> LandmarkSet;
}

pub struct HolisticDetector {
    hands: HandLandmarker,
    pose: Option<PoseLandmarker>,
    face: Option<FaceLandmarker>,
}

impl HolisticDetector {
    /// Hand models are required. Pose and face models are optional; without
    /// them those groups are always zero.
    pub fn load(models: &ModelsConfig, min_confidence: f32, layout: KeypointLayout) -> Result<Self> {
        let threads = models.intra_threads;

        let palm = ensure_model_ready(ModelKind::PalmDetector, &models.palm_detector, |_evt| {})?;
        let handpose =
            ensure_model_ready(ModelKind::HandLandmarker, &models.hand_landmarker, |_evt| {})?;
        let hands = HandLandmarker::new(&handpose, &palm, min_confidence, threads)?;
        log::info!(
            "hand landmarker ready using {} and palm detector {}",
            handpose.display(),
            palm.display()
        );

        if layout == KeypointLayout::HandOnly {
            return Ok(Self {
                hands,
                pose: None,
                face: None,
            });
        }

        let pose = ensure_model_ready(ModelKind::PoseLandmarker, &models.pose_landmarker, |_evt| {})
            .and_then(|path| PoseLandmarker::new(&path, min_confidence, threads))
            .map_err(|err| log::warn!("pose landmarks disabled: {err:#}"))
            .ok();

        let face = if pose.is_some() {
            ensure_model_ready(ModelKind::FaceLandmarker, &models.face_landmarker, |_evt| {})
                .and_then(|path| FaceLandmarker::new(&path, min_confidence, threads))
                .map_err(|err| log::warn!("face landmarks disabled: {err:#}"))
                .ok()
        } else {
            log::warn!("face landmarks disabled: the face ROI comes from pose landmarks");
            None
        };

        Ok(Self { hands, pose, face })
    }
}

impl LandmarkDetector for HolisticDetector {
    fn detect(&mut self, frame: &Frame) -> LandmarkSet {
        let mut set = LandmarkSet::default();

        if let Some(pose) = self.pose.as_mut() {
            set.pose = pose.detect(frame).unwrap_or_else(|err| {
                log::warn!("pose detection failed: {err:?}");
                None
            });
        }

        if let (Some(face), Some(pose_points)) = (self.face.as_mut(), set.pose.as_deref()) {
            set.face = face.detect(frame, pose_points).unwrap_or_else(|err| {
                log::warn!("face detection failed: {err:?}");
                None
            });
        }

        match self.hands.detect(frame) {
            Ok((hands, palm_regions)) => {
                set.assign_hands(hands);
                set.palm_regions = palm_regions;
            }
            Err(err) => log::warn!("hand detection failed: {err:?}"),
        }

        set
    }
}

/// Detector plus the flattening layout the classifier expects.
pub struct KeypointExtractor {
    detector: Box<dyn LandmarkDetector>,
    layout: KeypointLayout,
}

impl KeypointExtractor {
    pub fn new(detector: Box<dyn LandmarkDetector>, layout: KeypointLayout) -> Self {
        Self { detector, layout }
    }

    pub fn detect(&mut self, frame: &Frame) -> LandmarkSet {
        self.detector.detect(frame)
    }

    pub fn extract(&mut self, frame: &Frame) -> KeypointVector {
        self.detect_and_extract(frame).1
    }

    pub fn detect_and_extract(&mut self, frame: &Frame) -> (LandmarkSet, KeypointVector) {
        let set = self.detector.detect(frame);
        let vector = KeypointVector::from_landmarks(&set, self.layout);
        (set, vector)
    }
}
