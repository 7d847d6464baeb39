use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Sender, TrySendError};
use nokhwa::{
    Buffer, Camera,
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
};

use super::{
    rgba_converter::{self, PixelFormat},
    source::{CaptureStream, MAX_READ_FAILURES, READ_RETRY_DELAY, ReadFailures},
};
use crate::types::Frame;

// Built-in macOS cameras often reject YUYV even though Nokhwa reports it.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

fn requested_formats() -> [RequestedFormat<'static>; 3] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

/// `(index, human readable name)` of every camera the OS reports.
pub fn list_cameras() -> Result<Vec<(u32, String)>> {
    let cameras = query(ApiBackend::Auto).context("failed to query cameras")?;
    Ok(cameras
        .into_iter()
        .filter_map(|info| {
            let index = info.index().as_index().ok()?;
            Some((index, info.human_name()))
        })
        .collect())
}

fn open_camera(index: u32) -> Result<Camera> {
    let mut last_err = None;
    for requested in requested_formats() {
        match Camera::new(CameraIndex::Index(index), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(anyhow!(err)),
            },
            Err(err) => last_err = Some(anyhow!(err)),
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow!("no supported format"))
        .context(format!("failed to open camera {index}")))
}

fn buffer_to_frame(buffer: &Buffer) -> Result<Frame> {
    let format = match buffer.source_frame_format() {
        FrameFormat::NV12 => PixelFormat::Nv12,
        FrameFormat::YUYV => PixelFormat::Yuyv,
        FrameFormat::MJPEG => PixelFormat::Jpeg,
        FrameFormat::RAWRGB => PixelFormat::Rgb,
        FrameFormat::RAWBGR => PixelFormat::Bgr,
        FrameFormat::GRAY => PixelFormat::Gray,
    };
    let resolution = buffer.resolution();
    rgba_converter::to_frame(
        format,
        buffer.buffer(),
        resolution.width_x,
        resolution.height_y,
    )
}

/// Probes the camera on the calling thread so a missing device is reported
/// immediately, then reopens it on the capture thread.
pub fn start_camera_stream(index: u32, frame_tx: Sender<Frame>) -> Result<CaptureStream> {
    {
        let probe = open_camera(index)?;
        log::info!(
            "camera {index} opened at {}x{}",
            probe.resolution().width_x,
            probe.resolution().height_y
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = thread::Builder::new()
        .name(format!("camera-{index}"))
        .spawn(move || {
            let mut camera = match open_camera(index) {
                Ok(camera) => camera,
                Err(err) => {
                    log::error!("{err:?}");
                    return;
                }
            };

            let mut failures = ReadFailures::new(MAX_READ_FAILURES);
            while !stop_flag.load(Ordering::Relaxed) {
                let buffer = match camera.frame() {
                    Ok(buffer) => {
                        failures.reset();
                        buffer
                    }
                    Err(err) => {
                        if failures.record() {
                            log::error!(
                                "camera {index}: {MAX_READ_FAILURES} reads failed in a row, giving up: {err:?}"
                            );
                            break;
                        }
                        log::warn!("camera frame read failed: {err:?}");
                        thread::sleep(READ_RETRY_DELAY);
                        continue;
                    }
                };
                match buffer_to_frame(&buffer) {
                    // drop the frame when the consumer is still busy
                    Ok(frame) => {
                        if let Err(TrySendError::Disconnected(_)) = frame_tx.try_send(frame) {
                            break;
                        }
                    }
                    Err(err) => log::warn!("failed to decode camera frame: {err:?}"),
                }
            }
            let _ = camera.stop_stream();
        })
        .context("failed to spawn camera thread")?;

    Ok(CaptureStream::new(stop, handle))
}
