use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};

use crate::{config::SourceConfig, types::Frame};

/// Where live frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoSource {
    Camera { index: u32 },
    Mjpeg { url: String },
}

impl VideoSource {
    /// A configured URL wins over the camera index.
    pub fn from_config(config: &SourceConfig) -> Self {
        match config.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => VideoSource::Mjpeg {
                url: url.to_string(),
            },
            _ => VideoSource::Camera {
                index: config.camera_index,
            },
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Camera { index } => write!(f, "camera {index}"),
            VideoSource::Mjpeg { url } => write!(f, "stream {url}"),
        }
    }
}

/// Consecutive failed reads a capture thread tolerates before it gives up and
/// closes its channel.
pub const MAX_READ_FAILURES: u32 = 30;

#[cfg(feature = "camera-nokhwa")]
pub(crate) const READ_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Counts consecutive read failures. A successful read resets the count.
#[derive(Debug)]
pub(crate) struct ReadFailures {
    limit: u32,
    consecutive: u32,
}

impl ReadFailures {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the limit is reached.
    pub(crate) fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }
}

/// Running capture thread. Stops and joins on drop.
#[derive(Debug)]
pub struct CaptureStream {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureStream {
    pub(crate) fn new(stop: Arc<AtomicBool>, handle: thread::JoinHandle<()>) -> Self {
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Starts capturing into `frame_tx`. Frames are dropped, never queued, while
/// the consumer is busy, so pair this with a `bounded(1)` channel.
pub fn start_capture(source: &VideoSource, frame_tx: Sender<Frame>) -> Result<CaptureStream> {
    match source {
        VideoSource::Mjpeg { url } => super::mjpeg::start_mjpeg_stream(url, frame_tx),
        #[cfg(feature = "camera-nokhwa")]
        VideoSource::Camera { index } => super::camera::start_camera_stream(*index, frame_tx),
        #[cfg(not(feature = "camera-nokhwa"))]
        VideoSource::Camera { index } => {
            let _ = frame_tx;
            anyhow::bail!("camera {index} requested but built without the camera-nokhwa feature")
        }
    }
}

/// Blocks for the next frame and then skips to the newest one queued.
/// `None` once the capture thread has stopped.
pub fn recv_latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    let mut frame = frame_rx.recv().ok()?;
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn frame(width: u32) -> Frame {
        Frame {
            rgba: vec![0; width as usize * 4],
            width,
            height: 1,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_url_takes_precedence() {
        let config = SourceConfig {
            camera_index: 2,
            url: Some(" http://phone.local:8080/video ".to_string()),
            mirror: true,
        };
        assert_eq!(
            VideoSource::from_config(&config),
            VideoSource::Mjpeg {
                url: "http://phone.local:8080/video".to_string()
            }
        );
    }

    #[test]
    fn test_blank_url_falls_back_to_camera() {
        let config = SourceConfig {
            camera_index: 1,
            url: Some("  ".to_string()),
            mirror: false,
        };
        assert_eq!(
            VideoSource::from_config(&config),
            VideoSource::Camera { index: 1 }
        );
    }

    #[test]
    fn test_read_failures_give_up_after_limit() {
        let mut failures = ReadFailures::new(3);
        assert!(!failures.record());
        assert!(!failures.record());
        failures.reset();
        assert!(!failures.record());
        assert!(!failures.record());
        assert!(failures.record());
    }

    #[test]
    fn test_capture_thread_exit_ends_frame_stream() {
        let (tx, rx) = unbounded::<Frame>();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn(move || {
            let mut failures = ReadFailures::new(MAX_READ_FAILURES);
            // a source that never delivers a frame
            while !failures.record() {}
            drop(tx);
        });
        let _capture = CaptureStream::new(stop, handle);
        assert!(recv_latest_frame(&rx).is_none());
    }

    #[test]
    fn test_recv_latest_skips_stale_frames() {
        let (tx, rx) = unbounded();
        tx.send(frame(1)).unwrap();
        tx.send(frame(2)).unwrap();
        tx.send(frame(3)).unwrap();
        assert_eq!(recv_latest_frame(&rx).unwrap().width, 3);
        drop(tx);
        assert!(recv_latest_frame(&rx).is_none());
    }
}
