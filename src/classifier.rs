use std::{cmp::Ordering, path::Path};

use anyhow::{Context, Result, anyhow};
use ndarray::ArrayView3;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::{Tensor, ValueType};
use serde::Serialize;

/// Closed, ordered label set. Position `i` is the classifier's output class `i`
/// and must match the order used at training time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GestureLabels(Vec<String>);

impl GestureLabels {
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(anyhow!("gesture label set must not be empty"));
        }
        for (idx, label) in labels.iter().enumerate() {
            if label.trim().is_empty() {
                return Err(anyhow!("gesture label {idx} is blank"));
            }
            if labels[..idx].contains(label) {
                return Err(anyhow!("gesture label {label:?} appears twice"));
            }
        }
        Ok(Self(labels))
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl Default for GestureLabels {
    fn default() -> Self {
        Self(
            ["hello", "thanks", "iloveyou", "yes", "no"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub class_index: usize,
    pub confidence: f32,
}

impl Prediction {
    /// Arg-max over the class distribution; the first index wins ties and NaN
    /// never wins.
    pub fn from_scores(scores: &[f32], labels: &GestureLabels) -> Result<Self> {
        if scores.len() != labels.len() {
            return Err(anyhow!(
                "classifier returned {} classes, label set has {}",
                scores.len(),
                labels.len()
            ));
        }

        let (class_index, confidence) = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, score)| !score.is_nan())
            .fold(None, |best: Option<(usize, f32)>, (idx, score)| match best {
                Some((_, top)) if top.partial_cmp(&score) != Some(Ordering::Less) => best,
                _ => Some((idx, score)),
            })
            .ok_or_else(|| anyhow!("classifier returned no usable scores"))?;

        let label = labels
            .get(class_index)
            .ok_or_else(|| anyhow!("class index {class_index} has no label"))?
            .to_string();

        Ok(Self {
            label,
            class_index,
            confidence,
        })
    }
}

pub trait SequenceClassifier: Send + 'static {
    /// Returns the class distribution for a `(1, window, features)` tensor.
    fn predict(&mut self, window: ArrayView3<'_, f32>) -> Result<Vec<f32>>;
}

pub struct OrtSequenceClassifier {
    session: Session,
    window_len: usize,
    feature_len: usize,
}

impl OrtSequenceClassifier {
    pub fn new(
        model_path: &Path,
        window_len: usize,
        feature_len: usize,
        class_count: usize,
        intra_threads: usize,
    ) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)
            .with_context(|| {
                format!(
                    "failed to load sequence classifier from {}",
                    model_path.display()
                )
            })?;

        if let Some(ValueType::Tensor { shape, .. }) =
            session.inputs.first().map(|input| &input.input_type)
        {
            let dims: Vec<i64> = shape.iter().copied().collect();
            check_static_dims("input", &dims, &[1, window_len, feature_len])?;
        }
        if let Some(ValueType::Tensor { shape, .. }) =
            session.outputs.first().map(|output| &output.output_type)
        {
            let dims: Vec<i64> = shape.iter().copied().collect();
            check_static_dims("output", &dims, &[1, class_count])?;
        }

        log::info!(
            "loaded sequence classifier from {} (input 1x{window_len}x{feature_len})",
            model_path.display()
        );

        Ok(Self {
            session,
            window_len,
            feature_len,
        })
    }
}

/// Compares the model's declared dimensions with the expected ones. Dynamic
/// dimensions (negative) match anything.
fn check_static_dims(what: &str, model: &[i64], expected: &[usize]) -> Result<()> {
    if model.len() != expected.len() {
        return Err(anyhow!(
            "classifier {what} has rank {} ({model:?}), expected {expected:?}",
            model.len()
        ));
    }
    let mismatch = model
        .iter()
        .zip(expected)
        .any(|(&dim, &want)| dim >= 0 && dim as usize != want);
    if mismatch {
        return Err(anyhow!(
            "classifier {what} shape {model:?} does not match {expected:?}"
        ));
    }
    Ok(())
}

impl SequenceClassifier for OrtSequenceClassifier {
    fn predict(&mut self, window: ArrayView3<'_, f32>) -> Result<Vec<f32>> {
        let expected = [1, self.window_len, self.feature_len];
        if window.shape() != expected {
            return Err(anyhow!(
                "classifier input shape {:?} does not match {:?}",
                window.shape(),
                expected
            ));
        }

        let tensor = Tensor::from_array(window.to_owned())?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run sequence classifier")?;

        if outputs.len() < 1 {
            return Err(anyhow!("sequence classifier returned no outputs"));
        }

        let scores = outputs[0].try_extract_array::<f32>()?;
        Ok(scores.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn test_default_labels_match_training_order() {
        let labels = GestureLabels::default();
        assert_eq!(labels.get(0), Some("hello"));
        assert_eq!(labels.get(2), Some("iloveyou"));
        assert_eq!(labels.get(4), Some("no"));
        assert_eq!(labels.len(), 5);
    }

    #[test]
    fn test_labels_reject_duplicates_and_empty() {
        assert!(GestureLabels::new(Vec::<String>::new()).is_err());
        assert!(GestureLabels::new(["yes", "no", "yes"]).is_err());
        assert!(GestureLabels::new(["yes", " "]).is_err());
        assert!(GestureLabels::new(["yes", "no"]).is_ok());
    }

    #[test]
    fn test_argmax_picks_highest_probability() {
        let labels = GestureLabels::default();
        let prediction = Prediction::from_scores(&[0.05, 0.1, 0.6, 0.2, 0.05], &labels).unwrap();
        assert_eq!(prediction.label, "iloveyou");
        assert_eq!(prediction.class_index, 2);
        assert_relative_eq!(prediction.confidence, 0.6);
    }

    #[test]
    fn test_argmax_first_index_wins_ties() {
        let labels = GestureLabels::default();
        let prediction = Prediction::from_scores(&[0.1, 0.4, 0.4, 0.05, 0.05], &labels).unwrap();
        assert_eq!(prediction.class_index, 1);
    }

    #[test]
    fn test_argmax_skips_nan() {
        let labels = GestureLabels::default();
        let prediction =
            Prediction::from_scores(&[f32::NAN, 0.2, 0.3, 0.1, 0.1], &labels).unwrap();
        assert_eq!(prediction.label, "iloveyou");
    }

    #[test]
    fn test_class_count_must_match_labels() {
        let labels = GestureLabels::default();
        assert!(Prediction::from_scores(&[0.5, 0.5], &labels).is_err());
    }

    #[rstest]
    #[case(&[1, 30, 1662], true)]
    #[case(&[-1, 30, 1662], true)]
    #[case(&[-1, -1, -1], true)]
    #[case(&[1, 30, 63], false)]
    #[case(&[1, 20, 1662], false)]
    #[case(&[30, 1662], false)]
    fn test_static_input_dims_are_checked(#[case] model: &[i64], #[case] ok: bool) {
        assert_eq!(check_static_dims("input", model, &[1, 30, 1662]).is_ok(), ok);
    }

    #[test]
    fn test_output_class_count_is_checked() {
        assert!(check_static_dims("output", &[-1, 5], &[1, 5]).is_ok());
        let err = check_static_dims("output", &[1, 3], &[1, 5]).unwrap_err();
        assert!(err.to_string().contains("output shape [1, 3]"));
    }

    #[test]
    fn test_low_confidence_is_returned_verbatim() {
        let labels = GestureLabels::default();
        let prediction = Prediction::from_scores(&[0.21, 0.2, 0.2, 0.2, 0.19], &labels).unwrap();
        assert_eq!(prediction.label, "hello");
        assert_relative_eq!(prediction.confidence, 0.21);
    }
}
