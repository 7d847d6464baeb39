use anyhow::{Context, Result, anyhow};
use crossbeam_channel::bounded;

use crate::{
    classifier::SequenceClassifier,
    config::Config,
    decision::Decision,
    pipeline::source::{VideoSource, recv_latest_frame, start_capture},
    service::load_models,
    session::{StreamPredictor, StreamSession},
    types::Frame,
};

/// Feeds frames through the predictor until the iterator ends. `on_decision`
/// sees every fresh decision. Returns the number of frames processed.
pub fn run_stream<C, I, F>(
    predictor: &mut StreamPredictor<C>,
    frames: I,
    mirror: bool,
    mut on_decision: F,
) -> usize
where
    C: SequenceClassifier,
    I: IntoIterator<Item = Frame>,
    F: FnMut(&Decision),
{
    let mut processed = 0;
    for frame in frames {
        let frame = if mirror { frame.mirrored() } else { frame };
        match predictor.process(&frame) {
            Ok(event) => {
                if let Some(decision) = event.fresh.as_ref() {
                    on_decision(decision);
                }
                log::debug!(
                    "frame {processed}: {:?}, window {}/{}",
                    event.state,
                    predictor.session().window().len(),
                    predictor.session().window().capacity()
                );
            }
            Err(err) => log::warn!("frame {processed} skipped: {err:#}"),
        }
        processed += 1;
    }
    processed
}

/// Live recognition from the configured camera or stream, printing each
/// decision. Only returns when the source stops or fails to open.
pub fn run_live(config: &Config, source: &VideoSource) -> Result<()> {
    let recognition = &config.recognition;
    let labels = recognition.gesture_labels()?;
    let (extractor, classifier) = load_models(&config.models, recognition)?;
    let session = StreamSession::new(
        recognition.window_len,
        recognition.prediction_interval(),
        recognition.policy(),
    );
    let mut predictor = StreamPredictor::new(session, extractor, classifier, labels);

    let (frame_tx, frame_rx) = bounded(1);
    let _capture = start_capture(source, frame_tx)
        .with_context(|| format!("failed to open video source {source}"))?;
    log::info!("recognizing from {source}");

    run_stream(
        &mut predictor,
        std::iter::from_fn(|| recv_latest_frame(&frame_rx)),
        config.source.mirror,
        |decision| {
            log::info!("decision: {decision}");
            println!("{decision}");
        },
    );

    Err(anyhow!("video source {source} stopped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::GestureLabels,
        decision::ConfidencePolicy,
        keypoints::KeypointLayout,
        pipeline::landmarks::{KeypointExtractor, LandmarkDetector},
        types::{HAND_LANDMARKS, LandmarkSet},
    };
    use ndarray::ArrayView3;
    use std::time::{Duration, Instant};

    struct FixedClassifier(Vec<f32>);

    impl SequenceClassifier for FixedClassifier {
        fn predict(&mut self, _window: ArrayView3<'_, f32>) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct HandDetector;

    impl LandmarkDetector for HandDetector {
        fn detect(&mut self, _frame: &Frame) -> LandmarkSet {
            LandmarkSet {
                left_hand: Some(vec![[0.4, 0.4, 0.0]; HAND_LANDMARKS]),
                ..LandmarkSet::default()
            }
        }
    }

    fn predictor(scores: Vec<f32>) -> StreamPredictor<FixedClassifier> {
        StreamPredictor::new(
            StreamSession::new(30, Duration::from_secs(3), ConfidencePolicy::default()),
            KeypointExtractor::new(Box::new(HandDetector), KeypointLayout::Holistic),
            FixedClassifier(scores),
            GestureLabels::default(),
        )
    }

    /// `count` frames spaced `step` apart.
    fn frames(count: usize, step: Duration) -> Vec<Frame> {
        let start = Instant::now();
        (0..count)
            .map(|i| Frame {
                rgba: vec![0; 2 * 2 * 4],
                width: 2,
                height: 2,
                timestamp: start + step * i as u32,
            })
            .collect()
    }

    #[test]
    fn test_first_decision_when_window_fills() {
        let mut predictor = predictor(vec![0.02, 0.02, 0.02, 0.92, 0.02]);
        let mut decisions = Vec::new();
        let processed = run_stream(
            &mut predictor,
            frames(30, Duration::from_millis(33)),
            true,
            |d| decisions.push(d.clone()),
        );
        assert_eq!(processed, 30);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].is_detected());
        assert_eq!(decisions[0].prediction().label, "yes");
    }

    #[test]
    fn test_interval_throttles_decisions() {
        let mut predictor = predictor(vec![0.5, 0.1, 0.1, 0.2, 0.1]);
        let mut decisions = Vec::new();
        // 120 frames at 100 ms: fires at frame 29, then strictly after 3 s
        run_stream(
            &mut predictor,
            frames(120, Duration::from_millis(100)),
            false,
            |d| decisions.push(d.clone()),
        );
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|d| !d.is_detected()));
        assert_eq!(decisions[0].to_string(), "No confident gesture");
    }
}
