//! Per-stream state: the sliding window plus the interval gate that throttles
//! classifier calls independently of the frame rate.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::{
    classifier::{GestureLabels, Prediction, SequenceClassifier},
    decision::{ConfidencePolicy, Decision},
    keypoints::KeypointVector,
    pipeline::landmarks::KeypointExtractor,
    sequence::{SequenceError, SequenceWindow},
    types::{Frame, LandmarkSet},
};

pub const DEFAULT_PREDICTION_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Window not yet full.
    Filling,
    /// Window full, last prediction too recent.
    ReadyCooldown,
    /// Window full and the interval has elapsed; classify now.
    ReadyFire,
}

#[derive(Debug)]
pub struct StreamSession {
    window: SequenceWindow,
    interval: Duration,
    policy: ConfidencePolicy,
    last_fire: Option<Instant>,
    last_decision: Option<Decision>,
}

impl StreamSession {
    pub fn new(window_len: usize, interval: Duration, policy: ConfidencePolicy) -> Self {
        Self {
            window: SequenceWindow::new(window_len),
            interval,
            policy,
            last_fire: None,
            last_decision: None,
        }
    }

    /// Appends a vector and advances the gate. Returning `ReadyFire` resets
    /// the timer, so the caller is expected to classify the window right away.
    pub fn push(
        &mut self,
        vector: KeypointVector,
        now: Instant,
    ) -> Result<SessionState, SequenceError> {
        self.window.append(vector)?;
        if !self.window.is_ready() {
            return Ok(SessionState::Filling);
        }

        let due = match self.last_fire {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if due {
            self.last_fire = Some(now);
            Ok(SessionState::ReadyFire)
        } else {
            Ok(SessionState::ReadyCooldown)
        }
    }

    pub fn record(&mut self, prediction: Prediction) -> &Decision {
        self.last_decision.insert(self.policy.decide(prediction))
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    pub fn window(&self) -> &SequenceWindow {
        &self.window
    }
}

#[derive(Clone, Debug)]
pub struct StreamEvent {
    pub state: SessionState,
    /// Set only on the frame that triggered a classifier call.
    pub fresh: Option<Decision>,
    pub landmarks: LandmarkSet,
}

/// Glues one session to an extractor and a classifier.
pub struct StreamPredictor<C: SequenceClassifier> {
    session: StreamSession,
    extractor: KeypointExtractor,
    classifier: C,
    labels: GestureLabels,
}

impl<C: SequenceClassifier> StreamPredictor<C> {
    pub fn new(
        session: StreamSession,
        extractor: KeypointExtractor,
        classifier: C,
        labels: GestureLabels,
    ) -> Self {
        Self {
            session,
            extractor,
            classifier,
            labels,
        }
    }

    pub fn process(&mut self, frame: &Frame) -> Result<StreamEvent> {
        let (landmarks, vector) = self.extractor.detect_and_extract(frame);
        self.process_vector(vector, frame.timestamp, landmarks)
    }

    fn process_vector(
        &mut self,
        vector: KeypointVector,
        now: Instant,
        landmarks: LandmarkSet,
    ) -> Result<StreamEvent> {
        let state = self.session.push(vector, now)?;
        let fresh = if state == SessionState::ReadyFire {
            let tensor = self.session.window().to_tensor()?;
            let scores = self.classifier.predict(tensor.view())?;
            let prediction = Prediction::from_scores(&scores, &self.labels)?;
            Some(self.session.record(prediction).clone())
        } else {
            None
        };

        Ok(StreamEvent {
            state,
            fresh,
            landmarks,
        })
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }
}
