use std::{
    path::{Path, PathBuf},
    process,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;

use signspeak::{
    classifier::OrtSequenceClassifier,
    config::Config,
    dataset::{self, CollectionPlan},
    live,
    model_download::{ModelKind, ensure_model_ready},
    pipeline::{
        landmarks::{HolisticDetector, KeypointExtractor},
        skeleton,
        source::{VideoSource, start_capture},
    },
    server,
    service::PredictionService,
    types::Frame,
};

/// Sign language gesture recognition from body, face and hand landmarks.
#[derive(Parser)]
#[command(name = "signspeak", version)]
struct Cli {
    /// TOML config file; defaults are used when it does not exist.
    #[arg(long, short, default_value = "signspeak.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        /// Listen address, overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Recognize gestures from a live camera or MJPEG stream.
    Live {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Record training sequences into the dataset directory.
    Collect {
        /// Only record this action; all configured labels otherwise.
        #[arg(long)]
        action: Option<String>,
        /// Sequences per action, overrides `dataset.sequences_per_action`.
        #[arg(long)]
        sequences: Option<usize>,
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Classify every stored sequence and report accuracy.
    Evaluate {
        /// Dataset root, overrides `dataset.path`.
        #[arg(long)]
        data: Option<PathBuf>,
    },
    /// Classify a single image.
    Predict {
        image: PathBuf,
        /// Also write the landmark overlay as JPEG.
        #[arg(long)]
        overlay: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    ShowConfig,
    /// List local cameras.
    #[cfg(feature = "camera-nokhwa")]
    Cameras,
}

#[derive(clap::Args)]
struct SourceArgs {
    /// MJPEG stream URL, e.g. a phone webcam app.
    #[arg(long, conflicts_with = "camera")]
    url: Option<String>,
    /// Local camera index.
    #[arg(long)]
    camera: Option<u32>,
}

impl SourceArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.source.url = Some(url.clone());
        }
        if let Some(index) = self.camera {
            config.source.url = None;
            config.source.camera_index = index;
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(&cli.config)?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
            runtime.block_on(server::serve(config))
        }
        Command::Live { source } => {
            source.apply(&mut config);
            live::run_live(&config, &VideoSource::from_config(&config.source))
        }
        Command::Collect {
            action,
            sequences,
            source,
        } => {
            source.apply(&mut config);
            run_collect(&config, action, sequences)
        }
        Command::Evaluate { data } => run_evaluate(&config, data),
        Command::Predict { image, overlay } => run_predict(&config, &image, overlay),
        Command::ShowConfig => {
            if !config.auth.jwt_secret.is_empty() {
                config.auth.jwt_secret = "<redacted>".to_string();
            }
            print!("{}", config.to_toml()?);
            Ok(())
        }
        #[cfg(feature = "camera-nokhwa")]
        Command::Cameras => {
            for (index, name) in signspeak::pipeline::camera::list_cameras()? {
                println!("{index}: {name}");
            }
            Ok(())
        }
    }
}

fn run_collect(config: &Config, action: Option<String>, sequences: Option<usize>) -> Result<()> {
    let labels = config.recognition.gesture_labels()?;
    let actions = match action {
        Some(action) if labels.as_slice().contains(&action) => vec![action],
        Some(action) => {
            return Err(anyhow!(
                "unknown action '{action}', expected one of {:?}",
                labels.as_slice()
            ));
        }
        None => labels.as_slice().to_vec(),
    };

    let recognition = &config.recognition;
    let detector = HolisticDetector::load(
        &config.models,
        recognition.min_detection_confidence,
        recognition.layout,
    )?;
    let mut extractor = KeypointExtractor::new(Box::new(detector), recognition.layout);

    let plan = CollectionPlan {
        root: config.dataset.path.clone(),
        actions,
        sequences_per_action: sequences.unwrap_or(config.dataset.sequences_per_action),
        sequence_len: recognition.window_len,
        countdown: Duration::from_secs(config.dataset.countdown_secs),
        mirror: config.source.mirror,
    };

    let source = VideoSource::from_config(&config.source);
    let (frame_tx, frame_rx) = bounded(1);
    let _capture = start_capture(&source, frame_tx)
        .with_context(|| format!("failed to open video source {source}"))?;

    let written = dataset::collect(&plan, &mut extractor, &frame_rx)?;
    println!("saved {written} frames to {}", plan.root.display());
    Ok(())
}

fn run_evaluate(config: &Config, data: Option<PathBuf>) -> Result<()> {
    let recognition = &config.recognition;
    let labels = recognition.gesture_labels()?;
    let root = data.unwrap_or_else(|| config.dataset.path.clone());
    let recorded = dataset::load_dataset(
        &root,
        &labels,
        recognition.window_len,
        recognition.layout.len(),
    )?;
    if recorded.is_empty() {
        return Err(anyhow!("no complete sequences found in {}", root.display()));
    }

    let classifier_path = ensure_model_ready(
        ModelKind::SequenceClassifier,
        &signspeak::config::ModelSource {
            path: config.models.classifier.clone(),
            url: None,
        },
        |_evt| {},
    )?;
    let mut classifier = OrtSequenceClassifier::new(
        &classifier_path,
        recognition.window_len,
        recognition.layout.len(),
        labels.len(),
        config.models.intra_threads,
    )?;

    let report = dataset::evaluate(&mut classifier, &recorded, &labels)?;
    for action in &report.actions {
        println!(
            "{:<12} {:>3}/{:<3} {:>6.1}%",
            action.label,
            action.correct,
            action.total,
            action.accuracy() * 100.0
        );
    }
    println!(
        "{:<12} {:>3}/{:<3} {:>6.1}%",
        "overall",
        report.correct(),
        report.total(),
        report.accuracy() * 100.0
    );
    Ok(())
}

fn run_predict(config: &Config, image: &Path, overlay: Option<PathBuf>) -> Result<()> {
    let bytes =
        std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let mut frame = Frame::from_image_bytes(&bytes)?;

    let mut service = PredictionService::from_config(&config.models, &config.recognition)?;
    let (prediction, landmarks) = service.predict_with_landmarks(&frame)?;
    println!("{}", serde_json::to_string(&prediction)?);

    if let Some(path) = overlay {
        skeleton::draw_landmarks(&mut frame, &landmarks);
        let jpeg = skeleton::encode_jpeg(&frame)?;
        std::fs::write(&path, jpeg)
            .with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("overlay written to {}", path.display());
    }
    Ok(())
}
