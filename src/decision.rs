use std::fmt;

use crate::classifier::Prediction;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    Detected(Prediction),
    /// A prediction was made but did not clear the threshold.
    NotConfident(Prediction),
}

impl Decision {
    pub fn prediction(&self) -> &Prediction {
        match self {
            Decision::Detected(p) | Decision::NotConfident(p) => p,
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, Decision::Detected(_))
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Detected(p) => write!(f, "{} ({:.1}%)", p.label, p.confidence * 100.0),
            Decision::NotConfident(_) => write!(f, "No confident gesture"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidencePolicy {
    pub threshold: f32,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl ConfidencePolicy {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Strictly above the threshold counts as detected.
    pub fn decide(&self, prediction: Prediction) -> Decision {
        if prediction.confidence > self.threshold {
            Decision::Detected(prediction)
        } else {
            Decision::NotConfident(prediction)
        }
    }
}
