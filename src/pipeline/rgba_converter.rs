use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

use crate::types::Frame;

/// Pixel layouts produced by the capture backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
    Yuyv,
    Jpeg,
    Rgb,
    Bgr,
    Gray,
}

/// Converts one captured buffer to an RGBA frame. `width`/`height` are ignored
/// for JPEG, whose size comes from the stream header.
pub fn to_frame(format: PixelFormat, data: &[u8], width: u32, height: u32) -> Result<Frame> {
    let rgba = match format {
        PixelFormat::Jpeg => return decode_jpeg(data),
        PixelFormat::Nv12 => nv12_to_rgba(data, width, height)?,
        PixelFormat::Yuyv => yuyv_to_rgba(data, width, height)?,
        PixelFormat::Rgb => packed_to_rgba(data, width, height, false)?,
        PixelFormat::Bgr => packed_to_rgba(data, width, height, true)?,
        PixelFormat::Gray => gray_to_rgba(data, width, height)?,
    };
    Ok(Frame {
        rgba,
        width,
        height,
        timestamp: std::time::Instant::now(),
    })
}

pub fn decode_jpeg(data: &[u8]) -> Result<Frame> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let mut rgba = decoder
        .decode()
        .map_err(|err| anyhow!("JPEG decode failed: {err:?}"))?;
    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("JPEG decoder returned no header info"))?;

    let width = u32::try_from(info.width).map_err(|_| anyhow!("JPEG width out of range"))?;
    let height = u32::try_from(info.height).map_err(|_| anyhow!("JPEG height out of range"))?;
    let expected_len = width as usize * height as usize * 4;
    if rgba.len() < expected_len {
        return Err(anyhow!(
            "JPEG decode produced too few bytes: got {}, expected {expected_len}",
            rgba.len()
        ));
    }
    rgba.truncate(expected_len);

    Ok(Frame {
        rgba,
        width,
        height,
        timestamp: std::time::Instant::now(),
    })
}

fn ensure_len(what: &str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(anyhow!(
            "{what} buffer too small: got {}, expected {expected}",
            data.len()
        ));
    }
    Ok(())
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let y_len = width as usize * height as usize;
    let uv_len = y_len / 2;
    ensure_len("NV12", data, y_len + uv_len)?;

    let image = YuvBiPlanarImage {
        y_plane: &data[..y_len],
        y_stride: width,
        uv_plane: &data[y_len..y_len + uv_len],
        uv_stride: width,
        width,
        height,
    };
    let mut rgba = vec![0u8; y_len * 4];
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len("YUYV", data, pixels * 2)?;

    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    let mut rgba = vec![0u8; pixels * 4];
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGBA failed: {err:?}"))?;
    Ok(rgba)
}

fn packed_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len(if swap_rb { "BGR" } else { "RGB" }, data, pixels * 3)?;

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(3))
        .for_each(|(dst, src)| {
            let (r, b) = if swap_rb { (src[2], src[0]) } else { (src[0], src[2]) };
            dst.copy_from_slice(&[r, src[1], b, 255]);
        });
    Ok(rgba)
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixels = width as usize * height as usize;
    ensure_len("GRAY", data, pixels)?;

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_iter().copied())
        .for_each(|(dst, v)| dst.copy_from_slice(&[v, v, v, 255]));
    Ok(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgr_swaps_channels() {
        let frame = to_frame(PixelFormat::Bgr, &[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(frame.rgba, vec![3, 2, 1, 255, 6, 5, 4, 255]);
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_gray_expands_to_opaque_rgba() {
        let frame = to_frame(PixelFormat::Gray, &[7, 9], 1, 2).unwrap();
        assert_eq!(frame.rgba, vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let err = to_frame(PixelFormat::Rgb, &[0; 5], 2, 1).unwrap_err();
        assert!(err.to_string().contains("RGB buffer too small"));
    }

    #[test]
    fn test_jpeg_size_comes_from_header() {
        let img = image::RgbImage::from_pixel(12, 6, image::Rgb([10, 200, 30]));
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Jpeg,
        )
        .unwrap();
        let frame = to_frame(PixelFormat::Jpeg, &bytes, 0, 0).unwrap();
        assert_eq!((frame.width, frame.height), (12, 6));
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_garbage_jpeg_is_an_error() {
        assert!(decode_jpeg(b"not a jpeg").is_err());
    }
}
