//! `multipart/x-mixed-replace` JPEG streams as served by IP-camera and phone
//! webcam apps.

use std::{
    io::Read,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use reqwest::blocking::Client;

use super::{
    rgba_converter,
    source::{CaptureStream, MAX_READ_FAILURES, ReadFailures},
};
use crate::types::Frame;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Splits a byte stream into complete JPEG images by their start/end markers.
/// Multipart boundaries and part headers fall between images and are skipped.
#[derive(Default)]
pub struct JpegSplitter {
    buffer: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFERED_BYTES {
            log::warn!(
                "dropping {} buffered bytes without a complete image",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Next complete image, if one has fully arrived.
    pub fn next_image(&mut self) -> Option<Vec<u8>> {
        let Some(start) = find(&self.buffer, &SOI, 0) else {
            // keep a trailing 0xFF, it may be the first half of a marker
            let keep_from = self.buffer.len().saturating_sub(1);
            self.buffer.drain(..keep_from);
            return None;
        };
        let end = find(&self.buffer, &EOI, start + SOI.len())? + EOI.len();
        let image = self.buffer[start..end].to_vec();
        self.buffer.drain(..end);
        Some(image)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Connects on the calling thread so an unreachable URL fails immediately,
/// then decodes frames on a reader thread.
pub fn start_mjpeg_stream(url: &str, frame_tx: Sender<Frame>) -> Result<CaptureStream> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .context("failed to build http client")?;
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to connect to video stream {url}"))?
        .error_for_status()
        .with_context(|| format!("video stream {url} returned error status"))?;

    if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
        log::info!("video stream {url} opened ({content_type:?})");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let url = url.to_string();

    let handle = thread::Builder::new()
        .name("mjpeg-reader".to_string())
        .spawn(move || {
            let mut splitter = JpegSplitter::new();
            let mut chunk = vec![0u8; 64 * 1024];
            let mut failures = ReadFailures::new(MAX_READ_FAILURES);
            while !stop_flag.load(Ordering::Relaxed) {
                let read = match response.read(&mut chunk) {
                    Ok(0) => {
                        log::warn!("video stream {url} ended");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        log::error!("video stream {url} read failed: {err}");
                        break;
                    }
                };
                splitter.push(&chunk[..read]);

                // only the newest complete image is worth decoding
                let mut latest = None;
                while let Some(image) = splitter.next_image() {
                    latest = Some(image);
                }
                let Some(jpeg) = latest else { continue };

                match rgba_converter::decode_jpeg(&jpeg) {
                    Ok(frame) => {
                        failures.reset();
                        if let Err(TrySendError::Disconnected(_)) = frame_tx.try_send(frame) {
                            break;
                        }
                    }
                    Err(err) if failures.record() => {
                        log::error!(
                            "video stream {url}: {MAX_READ_FAILURES} frames undecodable in a row, giving up: {err:?}"
                        );
                        break;
                    }
                    Err(err) => log::warn!("skipping undecodable stream frame: {err:?}"),
                }
            }
        })
        .context("failed to spawn stream reader thread")?;

    Ok(CaptureStream::new(stop, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(payload: &[u8]) -> Vec<u8> {
        let mut bytes = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .into_bytes();
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(b"\r\n");
        bytes
    }

    #[test]
    fn test_splits_consecutive_parts() {
        let first = [0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let second = [0xFF, 0xD8, 4, 0xFF, 0xD9];
        let mut splitter = JpegSplitter::new();
        splitter.push(&[part(&first), part(&second)].concat());

        assert_eq!(splitter.next_image().unwrap(), first);
        assert_eq!(splitter.next_image().unwrap(), second);
        assert!(splitter.next_image().is_none());
    }

    #[test]
    fn test_image_split_across_chunks() {
        let image = [0xFF, 0xD8, 9, 9, 9, 0xFF, 0xD9];
        let stream = part(&image);
        let (head, tail) = stream.split_at(stream.len() - 4);

        let mut splitter = JpegSplitter::new();
        splitter.push(head);
        assert!(splitter.next_image().is_none());
        splitter.push(tail);
        assert_eq!(splitter.next_image().unwrap(), image);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut splitter = JpegSplitter::new();
        splitter.push(b"--frame\r\n\r\n\xFF");
        assert!(splitter.next_image().is_none());
        assert_eq!(splitter.buffered(), 1);
        splitter.push(&[0xD8, 5, 0xFF, 0xD9]);
        assert_eq!(splitter.next_image().unwrap(), [0xFF, 0xD8, 5, 0xFF, 0xD9]);
    }

    #[test]
    fn test_real_jpeg_decodes_after_split() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([1, 2, 3]));
        let mut jpeg = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let mut splitter = JpegSplitter::new();
        splitter.push(&part(&jpeg));
        let extracted = splitter.next_image().unwrap();
        let frame = rgba_converter::decode_jpeg(&extracted).unwrap();
        assert_eq!((frame.width, frame.height), (8, 4));
    }

    #[test]
    fn test_unreachable_url_fails_fast() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        assert!(start_mjpeg_stream("http://127.0.0.1:9/video", tx).is_err());
    }
}
