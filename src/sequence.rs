use std::collections::VecDeque;

use ndarray::Array3;
use thiserror::Error;

use crate::keypoints::KeypointVector;

pub const DEFAULT_WINDOW_LEN: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("keypoint vector has {got} values, window holds vectors of {expected}")]
    FeatureMismatch { expected: usize, got: usize },

    #[error("window is not full: {len}/{capacity}")]
    NotReady { len: usize, capacity: usize },
}

/// Sliding window of the most recent keypoint vectors, oldest first.
#[derive(Clone, Debug)]
pub struct SequenceWindow {
    frames: VecDeque<KeypointVector>,
    capacity: usize,
}

impl SequenceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// The same vector repeated `capacity` times. Used when only a single image
    /// is available; it carries no motion information.
    pub fn replicated(vector: KeypointVector, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        for _ in 0..window.capacity {
            window.frames.push_back(vector.clone());
        }
        window
    }

    pub fn append(&mut self, vector: KeypointVector) -> Result<(), SequenceError> {
        if let Some(front) = self.frames.front() {
            if front.len() != vector.len() {
                return Err(SequenceError::FeatureMismatch {
                    expected: front.len(),
                    got: vector.len(),
                });
            }
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(vector);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.frames.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn feature_len(&self) -> Option<usize> {
        self.frames.front().map(KeypointVector::len)
    }

    pub fn snapshot(&self) -> Vec<&KeypointVector> {
        self.frames.iter().collect()
    }

    /// Stacks the full window into a `(1, capacity, features)` tensor.
    pub fn to_tensor(&self) -> Result<Array3<f32>, SequenceError> {
        if !self.is_ready() {
            return Err(SequenceError::NotReady {
                len: self.frames.len(),
                capacity: self.capacity,
            });
        }
        let features = self.feature_len().unwrap_or(0);
        let mut data = Vec::with_capacity(self.capacity * features);
        for frame in &self.frames {
            data.extend_from_slice(frame.as_slice());
        }
        // Lengths are checked on append, so the shape always matches.
        Array3::from_shape_vec((1, self.capacity, features), data).map_err(|_| {
            SequenceError::FeatureMismatch {
                expected: features,
                got: 0,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoints::{HOLISTIC_LEN, KeypointLayout};
    use ndarray::s;

    fn marked(marker: f32) -> KeypointVector {
        KeypointVector::from(vec![marker; 4])
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut window = SequenceWindow::new(DEFAULT_WINDOW_LEN);
        for i in 1..=31 {
            window.append(marked(i as f32)).unwrap();
        }
        assert_eq!(window.len(), 30);
        let markers: Vec<f32> = window.snapshot().iter().map(|v| v.as_slice()[0]).collect();
        let expected: Vec<f32> = (2..=31).map(|i| i as f32).collect();
        assert_eq!(markers, expected);
    }

    #[test]
    fn test_is_ready_only_at_capacity() {
        let mut window = SequenceWindow::new(DEFAULT_WINDOW_LEN);
        for i in 0..29 {
            window.append(marked(i as f32)).unwrap();
            assert!(!window.is_ready());
        }
        window.append(marked(29.0)).unwrap();
        assert!(window.is_ready());
        window.append(marked(30.0)).unwrap();
        assert!(window.is_ready());
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut window = SequenceWindow::new(3);
        window.append(marked(1.0)).unwrap();
        window.append(marked(2.0)).unwrap();
        let first = window.snapshot().len();
        let second = window.snapshot().len();
        assert_eq!(first, 2);
        assert_eq!(second, 2);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_rejects_mismatched_vector() {
        let mut window = SequenceWindow::new(3);
        window.append(marked(1.0)).unwrap();
        let err = window.append(KeypointVector::from(vec![0.0; 5])).unwrap_err();
        assert_eq!(err, SequenceError::FeatureMismatch { expected: 4, got: 5 });
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_tensor_requires_full_window() {
        let mut window = SequenceWindow::new(3);
        window.append(marked(1.0)).unwrap();
        assert_eq!(
            window.to_tensor().unwrap_err(),
            SequenceError::NotReady { len: 1, capacity: 3 }
        );
    }

    #[test]
    fn test_replicated_window_has_identical_steps() {
        let mut values = vec![0.0; HOLISTIC_LEN];
        values[0] = 0.25;
        values[HOLISTIC_LEN - 1] = 0.75;
        let window = SequenceWindow::replicated(KeypointVector::from(values), DEFAULT_WINDOW_LEN);
        let tensor = window.to_tensor().unwrap();
        assert_eq!(tensor.shape(), &[1, 30, 1662]);
        let first = tensor.slice(s![0, 0, ..]).to_owned();
        for step in 1..30 {
            assert_eq!(tensor.slice(s![0, step, ..]), first);
        }
    }

    #[test]
    fn test_tensor_keeps_chronological_order() {
        let mut window = SequenceWindow::new(2);
        window.append(KeypointVector::zeros(KeypointLayout::HandOnly)).unwrap();
        window
            .append(KeypointVector::from(vec![1.0; KeypointLayout::HandOnly.len()]))
            .unwrap();
        let tensor = window.to_tensor().unwrap();
        assert_eq!(tensor[[0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 1, 0]], 1.0);
    }
}
