//! One-shot prediction and the dedicated inference worker that serves it.
//!
//! Requests never run models inline: they are queued on a bounded channel and
//! a single worker thread owning the extractor and classifier answers them.
//! A full queue is reported immediately as [`ServiceError::Busy`].

use std::thread;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    classifier::{GestureLabels, OrtSequenceClassifier, Prediction, SequenceClassifier},
    config::{ModelSource, ModelsConfig, RecognitionConfig},
    model_download::{ModelKind, ensure_model_ready},
    pipeline::{
        landmarks::{HolisticDetector, KeypointExtractor},
        skeleton,
    },
    sequence::SequenceWindow,
    types::{Frame, LandmarkSet},
};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("inference queue is full")]
    Busy,

    #[error("inference worker is not running")]
    Unavailable,

    #[error("Could not read image.")]
    InvalidImage,

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Loads the landmark models and the classifier. The classifier is trained
/// locally and never downloaded.
pub fn load_models(
    models: &ModelsConfig,
    recognition: &RecognitionConfig,
) -> Result<(KeypointExtractor, OrtSequenceClassifier)> {
    let classifier_source = ModelSource {
        path: models.classifier.clone(),
        url: None,
    };
    let classifier_path =
        ensure_model_ready(ModelKind::SequenceClassifier, &classifier_source, |_evt| {})?;
    let detector = HolisticDetector::load(
        models,
        recognition.min_detection_confidence,
        recognition.layout,
    )?;
    let classifier = OrtSequenceClassifier::new(
        &classifier_path,
        recognition.window_len,
        recognition.layout.len(),
        recognition.gesture_labels()?.len(),
        models.intra_threads,
    )?;
    Ok((
        KeypointExtractor::new(Box::new(detector), recognition.layout),
        classifier,
    ))
}

/// Everything needed to answer one request, owned by the worker thread.
pub struct PredictionService<C: SequenceClassifier> {
    extractor: KeypointExtractor,
    classifier: C,
    labels: GestureLabels,
    window_len: usize,
}

impl<C: SequenceClassifier> PredictionService<C> {
    pub fn new(
        extractor: KeypointExtractor,
        classifier: C,
        labels: GestureLabels,
        window_len: usize,
    ) -> Self {
        Self {
            extractor,
            classifier,
            labels,
            window_len,
        }
    }

    /// Replicates the frame's keypoints across the whole window and returns
    /// the arg-max class, ungated by any confidence threshold.
    pub fn predict_frame(&mut self, frame: &Frame) -> Result<Prediction> {
        self.predict_with_landmarks(frame)
            .map(|(prediction, _)| prediction)
    }

    pub fn predict_with_landmarks(&mut self, frame: &Frame) -> Result<(Prediction, LandmarkSet)> {
        let (landmarks, vector) = self.extractor.detect_and_extract(frame);
        let window = SequenceWindow::replicated(vector, self.window_len);
        let tensor = window.to_tensor()?;
        let scores = self.classifier.predict(tensor.view())?;
        let prediction = Prediction::from_scores(&scores, &self.labels)?;
        Ok((prediction, landmarks))
    }

    pub fn predict_image(&mut self, image: &[u8]) -> Result<Prediction, ServiceError> {
        let frame = Frame::from_image_bytes(image).map_err(|err| {
            log::debug!("rejecting upload: {err:#}");
            ServiceError::InvalidImage
        })?;
        self.predict_frame(&frame)
            .map_err(|err| ServiceError::Inference(format!("{err:#}")))
    }

    /// Landmark overlay of the image, JPEG encoded.
    pub fn visualize_image(&mut self, image: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let mut frame = Frame::from_image_bytes(image).map_err(|_| ServiceError::InvalidImage)?;
        let landmarks = self.extractor.detect(&frame);
        skeleton::draw_landmarks(&mut frame, &landmarks);
        skeleton::encode_jpeg(&frame).map_err(|err| ServiceError::Inference(format!("{err:#}")))
    }
}

impl PredictionService<OrtSequenceClassifier> {
    pub fn from_config(
        models: &ModelsConfig,
        recognition: &RecognitionConfig,
    ) -> Result<Self> {
        let labels = recognition.gesture_labels()?;
        let (extractor, classifier) = load_models(models, recognition)?;
        Ok(Self::new(
            extractor,
            classifier,
            labels,
            recognition.window_len,
        ))
    }
}

enum Job {
    Predict {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Prediction, ServiceError>>,
    },
    Visualize {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct InferenceHandle {
    jobs: Sender<Job>,
}

impl InferenceHandle {
    pub async fn predict(&self, image: Vec<u8>) -> Result<Prediction, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.submit(Job::Predict { image, reply })?;
        response.await.map_err(|_| ServiceError::Unavailable)?
    }

    pub async fn visualize(&self, image: Vec<u8>) -> Result<Vec<u8>, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.submit(Job::Visualize { image, reply })?;
        response.await.map_err(|_| ServiceError::Unavailable)?
    }

    fn submit(&self, job: Job) -> Result<(), ServiceError> {
        self.jobs.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => ServiceError::Busy,
            TrySendError::Disconnected(_) => ServiceError::Unavailable,
        })
    }
}

/// Builds the engine on a new worker thread and waits until it is ready, so
/// model loading errors surface before the server starts accepting requests.
pub fn start_inference_worker<C, F>(
    build_engine: F,
    queue_capacity: usize,
) -> Result<(InferenceHandle, thread::JoinHandle<()>)>
where
    C: SequenceClassifier,
    F: FnOnce() -> Result<PredictionService<C>> + Send + 'static,
{
    let (jobs_tx, jobs_rx) = bounded(queue_capacity.max(1));
    let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

    let handle = thread::Builder::new()
        .name("inference".to_string())
        .spawn(move || {
            let engine = match build_engine() {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    engine
                }
                Err(err) => {
                    log::error!("failed to start inference worker: {err:?}");
                    let _ = ready_tx.send(Err(format!("{err:#}")));
                    return;
                }
            };
            run_worker_loop(engine, jobs_rx);
        })
        .context("failed to spawn inference worker")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            log::info!("inference worker ready (queue capacity {queue_capacity})");
            Ok((InferenceHandle { jobs: jobs_tx }, handle))
        }
        Ok(Err(err)) => Err(anyhow!(err)),
        Err(_) => Err(anyhow!("inference worker exited during start-up")),
    }
}

fn run_worker_loop<C: SequenceClassifier>(mut engine: PredictionService<C>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Predict { image, reply } => {
                let result = engine.predict_image(&image);
                match &result {
                    Ok(p) => log::info!("predicted {} ({:.2})", p.label, p.confidence),
                    Err(err) => log::warn!("prediction failed: {err}"),
                }
                let _ = reply.send(result);
            }
            Job::Visualize { image, reply } => {
                let _ = reply.send(engine.visualize_image(&image));
            }
        }
    }
    log::info!("inference worker stopped");
}
