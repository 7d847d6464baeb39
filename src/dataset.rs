//! On-disk training data: `<root>/<action>/<sequence>/<frame>.npy`, one
//! flattened keypoint vector per file.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array3, Axis, s};
use ndarray_npy::{ReadNpyError, read_npy, write_npy};

use crate::{
    classifier::{GestureLabels, Prediction, SequenceClassifier},
    keypoints::KeypointVector,
    pipeline::{landmarks::KeypointExtractor, source::recv_latest_frame},
    types::Frame,
};

pub fn sequence_dir(root: &Path, action: &str, sequence: usize) -> PathBuf {
    root.join(action).join(sequence.to_string())
}

pub fn frame_path(root: &Path, action: &str, sequence: usize, frame: usize) -> PathBuf {
    sequence_dir(root, action, sequence).join(format!("{frame}.npy"))
}

pub fn save_frame(
    root: &Path,
    action: &str,
    sequence: usize,
    frame: usize,
    vector: &KeypointVector,
) -> Result<()> {
    let path = frame_path(root, action, sequence, frame);
    let array = Array1::from(vector.as_slice().to_vec());
    write_npy(&path, &array).with_context(|| format!("failed to write {}", path.display()))
}

/// Stacked sequences and their class indices.
#[derive(Debug)]
pub struct Dataset {
    pub sequences: Array3<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Numbered sequence directories of one action, in numeric order.
fn list_sequences(action_dir: &Path) -> Result<Vec<usize>> {
    let mut sequences: Vec<usize> = fs::read_dir(action_dir)
        .with_context(|| format!("failed to list {}", action_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();
    sequences.sort_unstable();
    Ok(sequences)
}

/// Reads one frame vector. Files written by numpy default to float64 and are
/// narrowed to `f32`.
fn read_frame(path: &Path) -> Result<Array1<f32>> {
    match read_npy::<_, Array1<f32>>(path) {
        Ok(values) => Ok(values),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let values: Array1<f64> = read_npy(path)?;
            Ok(values.mapv(|v| v as f32))
        }
        Err(err) => Err(err.into()),
    }
}

fn load_sequence(
    root: &Path,
    action: &str,
    sequence: usize,
    sequence_len: usize,
    feature_len: usize,
) -> Result<Array3<f32>> {
    let mut window = Array3::<f32>::zeros((1, sequence_len, feature_len));
    for frame in 0..sequence_len {
        let path = frame_path(root, action, sequence, frame);
        let values =
            read_frame(&path).with_context(|| format!("failed to read {}", path.display()))?;
        if values.len() != feature_len {
            return Err(anyhow!(
                "{} holds {} values, expected {feature_len}",
                path.display(),
                values.len()
            ));
        }
        window.slice_mut(s![0, frame, ..]).assign(&values);
    }
    Ok(window)
}

/// Loads every complete sequence of the labelled actions. Sequences with
/// missing or malformed frames are skipped with a warning.
pub fn load_dataset(
    root: &Path,
    labels: &GestureLabels,
    sequence_len: usize,
    feature_len: usize,
) -> Result<Dataset> {
    let mut windows = Vec::new();
    let mut classes = Vec::new();

    for (class_index, action) in labels.as_slice().iter().enumerate() {
        let action_dir = root.join(action);
        if !action_dir.is_dir() {
            log::warn!("no recordings for '{action}' in {}", root.display());
            continue;
        }
        for sequence in list_sequences(&action_dir)? {
            match load_sequence(root, action, sequence, sequence_len, feature_len) {
                Ok(window) => {
                    windows.push(window);
                    classes.push(class_index);
                }
                Err(err) => log::warn!("skipping {action}/{sequence}: {err:#}"),
            }
        }
    }

    let sequences = if windows.is_empty() {
        Array3::zeros((0, sequence_len, feature_len))
    } else {
        let views: Vec<_> = windows.iter().map(|w| w.view()).collect();
        ndarray::concatenate(Axis(0), &views).context("failed to stack sequences")?
    };

    log::info!(
        "loaded {} sequences from {}",
        classes.len(),
        root.display()
    );
    Ok(Dataset {
        sequences,
        labels: classes,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActionAccuracy {
    pub label: String,
    pub correct: usize,
    pub total: usize,
}

impl ActionAccuracy {
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationReport {
    pub actions: Vec<ActionAccuracy>,
}

impl EvaluationReport {
    pub fn correct(&self) -> usize {
        self.actions.iter().map(|a| a.correct).sum()
    }

    pub fn total(&self) -> usize {
        self.actions.iter().map(|a| a.total).sum()
    }

    pub fn accuracy(&self) -> f32 {
        match self.total() {
            0 => 0.0,
            total => self.correct() as f32 / total as f32,
        }
    }
}

/// Classifies every stored sequence and tallies hits per action.
pub fn evaluate<C: SequenceClassifier>(
    classifier: &mut C,
    dataset: &Dataset,
    labels: &GestureLabels,
) -> Result<EvaluationReport> {
    let mut actions: Vec<ActionAccuracy> = labels
        .as_slice()
        .iter()
        .map(|label| ActionAccuracy {
            label: label.clone(),
            correct: 0,
            total: 0,
        })
        .collect();

    for (index, &expected) in dataset.labels.iter().enumerate() {
        let window = dataset.sequences.slice(s![index..index + 1, .., ..]);
        let scores = classifier.predict(window)?;
        let prediction = Prediction::from_scores(&scores, labels)?;
        let slot = actions
            .get_mut(expected)
            .ok_or_else(|| anyhow!("class index {expected} has no label"))?;
        slot.total += 1;
        if prediction.class_index == expected {
            slot.correct += 1;
        }
    }

    Ok(EvaluationReport { actions })
}

#[derive(Clone, Debug)]
pub struct CollectionPlan {
    pub root: PathBuf,
    pub actions: Vec<String>,
    pub sequences_per_action: usize,
    pub sequence_len: usize,
    pub countdown: Duration,
    pub mirror: bool,
}

impl CollectionPlan {
    /// Creates every sequence directory before recording starts.
    pub fn prepare_dirs(&self) -> Result<()> {
        for action in &self.actions {
            for sequence in 0..self.sequences_per_action {
                let dir = sequence_dir(&self.root, action, sequence);
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

/// Records the plan from a live frame channel. Returns the number of frames
/// written.
pub fn collect(
    plan: &CollectionPlan,
    extractor: &mut KeypointExtractor,
    frames: &Receiver<Frame>,
) -> Result<usize> {
    plan.prepare_dirs()?;

    let total = (plan.actions.len() * plan.sequences_per_action * plan.sequence_len) as u64;
    let progress = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(style.progress_chars("=>-"));
    }

    let mut written = 0;
    for action in &plan.actions {
        for sequence in 0..plan.sequences_per_action {
            progress.set_message(format!("{action} #{sequence}"));
            progress.println(format!(
                "get ready: '{action}' sequence {sequence} starts in {}s",
                plan.countdown.as_secs()
            ));
            thread::sleep(plan.countdown);

            for frame_index in 0..plan.sequence_len {
                let frame = recv_latest_frame(frames)
                    .ok_or_else(|| anyhow!("video source stopped during collection"))?;
                let frame = if plan.mirror { frame.mirrored() } else { frame };
                let vector = extractor.extract(&frame);
                if vector.is_all_zero() {
                    log::debug!("{action}/{sequence}/{frame_index}: no landmarks detected");
                }
                save_frame(&plan.root, action, sequence, frame_index, &vector)?;
                written += 1;
                progress.inc(1);
            }
        }
    }

    progress.finish_with_message("collection complete");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keypoints::KeypointLayout,
        pipeline::landmarks::LandmarkDetector,
        types::{HAND_LANDMARKS, LandmarkSet},
    };
    use crossbeam_channel::{bounded, unbounded};
    use ndarray::ArrayView3;
    use std::time::Instant;
    use tempfile::TempDir;

    const FEATURES: usize = 4;

    fn labels() -> GestureLabels {
        GestureLabels::new(["hello", "thanks"]).unwrap()
    }

    fn write_sequence(root: &Path, action: &str, sequence: usize, frames: usize, value: f32) {
        fs::create_dir_all(sequence_dir(root, action, sequence)).unwrap();
        for frame in 0..frames {
            let vector = KeypointVector::from(vec![value; FEATURES]);
            save_frame(root, action, sequence, frame, &vector).unwrap();
        }
    }

    #[test]
    fn test_frame_path_layout() {
        let path = frame_path(Path::new("MP_Data"), "hello", 3, 17);
        assert_eq!(path, Path::new("MP_Data/hello/3/17.npy"));
    }

    #[test]
    fn test_save_and_load_one_sequence() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "thanks", 0, 30, 0.25);

        let dataset = load_dataset(dir.path(), &labels(), 30, FEATURES).unwrap();
        assert_eq!(dataset.sequences.shape(), &[1, 30, FEATURES]);
        assert_eq!(dataset.labels, vec![1]);
        assert!(dataset.sequences.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_loads_float64_frames() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(sequence_dir(dir.path(), "hello", 0)).unwrap();
        for frame in 0..30 {
            let values = Array1::<f64>::from_elem(FEATURES, 0.5);
            write_npy(frame_path(dir.path(), "hello", 0, frame), &values).unwrap();
        }

        let dataset = load_dataset(dir.path(), &labels(), 30, FEATURES).unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.labels, vec![0]);
        assert!(dataset.sequences.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_incomplete_sequences_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "hello", 0, 30, 1.0);
        write_sequence(dir.path(), "hello", 1, 12, 1.0);
        fs::create_dir_all(dir.path().join("hello").join("notes")).unwrap();

        let dataset = load_dataset(dir.path(), &labels(), 30, FEATURES).unwrap();
        assert_eq!(dataset.len(), 1);
    }

    #[test]
    fn test_wrong_feature_length_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "hello", 0, 30, 1.0);
        let dataset = load_dataset(dir.path(), &labels(), 30, FEATURES + 1).unwrap();
        assert!(dataset.is_empty());
        assert_eq!(dataset.sequences.shape(), &[0, 30, FEATURES + 1]);
    }

    /// Predicts "hello" when the first feature is above 0.5.
    struct ThresholdClassifier;

    impl SequenceClassifier for ThresholdClassifier {
        fn predict(&mut self, window: ArrayView3<'_, f32>) -> Result<Vec<f32>> {
            if window[[0, 0, 0]] > 0.5 {
                Ok(vec![0.9, 0.1])
            } else {
                Ok(vec![0.1, 0.9])
            }
        }
    }

    #[test]
    fn test_evaluate_reports_per_action_accuracy() {
        let dir = TempDir::new().unwrap();
        write_sequence(dir.path(), "hello", 0, 30, 1.0);
        write_sequence(dir.path(), "hello", 1, 30, 0.0);
        write_sequence(dir.path(), "thanks", 0, 30, 0.0);
        let labels = labels();
        let dataset = load_dataset(dir.path(), &labels, 30, FEATURES).unwrap();

        let report = evaluate(&mut ThresholdClassifier, &dataset, &labels).unwrap();
        assert_eq!(report.actions[0].correct, 1);
        assert_eq!(report.actions[0].total, 2);
        assert_eq!(report.actions[1].correct, 1);
        assert_eq!(report.total(), 3);
        approx::assert_relative_eq!(report.accuracy(), 2.0 / 3.0);
    }

    struct RightHandDetector;

    impl LandmarkDetector for RightHandDetector {
        fn detect(&mut self, _frame: &Frame) -> LandmarkSet {
            LandmarkSet {
                right_hand: Some(vec![[0.1, 0.2, 0.3]; HAND_LANDMARKS]),
                ..LandmarkSet::default()
            }
        }
    }

    fn blank_frame() -> Frame {
        Frame {
            rgba: vec![0; 4 * 4 * 4],
            width: 4,
            height: 4,
            timestamp: Instant::now(),
        }
    }

    fn plan(root: &Path) -> CollectionPlan {
        CollectionPlan {
            root: root.to_path_buf(),
            actions: vec!["yes".to_string(), "no".to_string()],
            sequences_per_action: 2,
            sequence_len: 3,
            countdown: Duration::ZERO,
            mirror: true,
        }
    }

    #[test]
    fn test_collect_writes_every_frame() {
        let dir = TempDir::new().unwrap();
        let plan = plan(dir.path());

        // keeps the channel topped up until the receiver goes away
        let (tx, rx) = bounded(1);
        let feeder = std::thread::spawn(move || {
            while tx.send(blank_frame()).is_ok() {}
        });

        let mut extractor =
            KeypointExtractor::new(Box::new(RightHandDetector), KeypointLayout::HandOnly);
        let written = collect(&plan, &mut extractor, &rx).unwrap();
        drop(rx);
        feeder.join().unwrap();

        assert_eq!(written, 2 * 2 * 3);
        for action in ["yes", "no"] {
            for sequence in 0..2 {
                for frame in 0..3 {
                    assert!(frame_path(dir.path(), action, sequence, frame).exists());
                }
            }
        }
        let dataset = load_dataset(
            dir.path(),
            &GestureLabels::new(["yes", "no"]).unwrap(),
            3,
            KeypointLayout::HandOnly.len(),
        )
        .unwrap();
        assert_eq!(dataset.len(), 4);
    }

    #[test]
    fn test_collect_fails_when_source_stops() {
        let dir = TempDir::new().unwrap();
        let mut plan = plan(dir.path());
        plan.actions.truncate(1);
        let (tx, rx) = unbounded();
        for _ in 0..6 {
            tx.send(blank_frame()).unwrap();
        }
        drop(tx);

        // recv_latest_frame drains the queue, so only the first frame is
        // available; the rest of the plan must fail once the channel closes
        let mut extractor =
            KeypointExtractor::new(Box::new(RightHandDetector), KeypointLayout::HandOnly);
        let err = collect(&plan, &mut extractor, &rx).unwrap_err();
        assert!(err.to_string().contains("video source stopped"));
        assert!(frame_path(dir.path(), "yes", 0, 0).exists());
        assert!(sequence_dir(dir.path(), "yes", 1).is_dir());

        let saved: Array1<f32> = read_npy(frame_path(dir.path(), "yes", 0, 0)).unwrap();
        assert_eq!(saved.len(), 63);
        approx::assert_relative_eq!(saved[2], 0.3);
    }
}
