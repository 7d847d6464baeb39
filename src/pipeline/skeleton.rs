use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ExtendedColorType, ImageEncoder, codecs::jpeg::JpegEncoder};

use crate::types::{Frame, LandmarkSet, PalmRegion};

pub const HAND_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    (0, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    (0, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
    (5, 9),
    (9, 13),
    (13, 17),
];

pub const POSE_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

const POSE_VISIBILITY_THRESHOLD: f32 = 0.5;
const PALM_SCORE_THRESHOLD: f32 = 0.25;
const JPEG_QUALITY: u8 = 90;

const LEFT_HAND_COLOR: [u8; 4] = [121, 22, 76, 255];
const RIGHT_HAND_COLOR: [u8; 4] = [245, 117, 66, 255];
const JOINT_COLOR: [u8; 4] = [248, 113, 113, 255];
const POSE_COLOR: [u8; 4] = [80, 44, 121, 255];
const FACE_COLOR: [u8; 4] = [80, 210, 121, 255];
const PALM_BOX_COLOR: [u8; 4] = [16, 185, 129, 200];

/// Mutable RGBA view used by the drawing helpers; all writes are clipped.
struct Canvas<'a> {
    buffer: &'a mut [u8],
    width: u32,
    height: u32,
}

impl Canvas<'_> {
    fn put_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return;
        }
        let idx = ((y as u32 * self.width + x as u32) as usize) * 4;
        if let Some(px) = self.buffer.get_mut(idx..idx + 4) {
            px.copy_from_slice(&color);
        }
    }

    fn to_pixel(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.width as f32, y * self.height as f32)
    }

    fn line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 4], thickness: i32) {
        let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
        let (x1, y1) = (p1.0 as i32, p1.1 as i32);
        let dx = (x1 - x0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let dy = -(y1 - y0).abs();
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (thickness.max(1) - 1) / 2;

        loop {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox.abs() + oy.abs() <= radius {
                        self.put_pixel(x0 + ox, y0 + oy, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn circle(&mut self, center: (f32, f32), radius: i32, color: [u8; 4]) {
        let (cx, cy) = (center.0 as i32, center.1 as i32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn rect(&mut self, [x1, y1, x2, y2]: [f32; 4], color: [u8; 4], thickness: i32) {
        self.line((x1, y1), (x2, y1), color, thickness);
        self.line((x2, y1), (x2, y2), color, thickness);
        self.line((x2, y2), (x1, y2), color, thickness);
        self.line((x1, y2), (x1, y1), color, thickness);
    }

    /// Joints and bones of one landmark group, skipping points that fail `keep`.
    fn skeleton<P>(
        &mut self,
        points: &[P],
        connections: &[(usize, usize)],
        xy: impl Fn(&P) -> (f32, f32),
        keep: impl Fn(&P) -> bool,
        bone_color: [u8; 4],
        thickness: i32,
    ) {
        for &(a, b) in connections {
            if let (Some(pa), Some(pb)) = (points.get(a), points.get(b)) {
                if keep(pa) && keep(pb) {
                    let (ax, ay) = xy(pa);
                    let (bx, by) = xy(pb);
                    self.line(self.to_pixel(ax, ay), self.to_pixel(bx, by), bone_color, thickness);
                }
            }
        }
        let radius = (thickness / 2).max(2) + 1;
        for point in points.iter().filter(|p| keep(p)) {
            let (x, y) = xy(point);
            self.circle(self.to_pixel(x, y), radius, JOINT_COLOR);
        }
    }
}

/// Line thickness that stays visible on both thumbnails and HD frames.
fn stroke_for(width: u32, height: u32) -> i32 {
    (width.min(height) / 160).clamp(1, 8) as i32
}

/// Draws every detected landmark group onto the frame in place.
pub fn draw_landmarks(frame: &mut Frame, landmarks: &LandmarkSet) {
    let thickness = stroke_for(frame.width, frame.height);
    let mut canvas = Canvas {
        buffer: &mut frame.rgba,
        width: frame.width,
        height: frame.height,
    };

    if let Some(face) = landmarks.face.as_deref() {
        for p in face {
            let center = canvas.to_pixel(p[0], p[1]);
            canvas.circle(center, (thickness / 2).max(1), FACE_COLOR);
        }
    }

    if let Some(pose) = landmarks.pose.as_deref() {
        canvas.skeleton(
            pose,
            POSE_CONNECTIONS,
            |p| (p[0], p[1]),
            |p| p[3] >= POSE_VISIBILITY_THRESHOLD,
            POSE_COLOR,
            thickness,
        );
    }

    for (hand, color) in [
        (landmarks.left_hand.as_deref(), LEFT_HAND_COLOR),
        (landmarks.right_hand.as_deref(), RIGHT_HAND_COLOR),
    ] {
        if let Some(points) = hand {
            canvas.skeleton(points, HAND_CONNECTIONS, |p| (p[0], p[1]), |_| true, color, thickness);
        }
    }

    draw_palm_regions(&mut canvas, &landmarks.palm_regions, thickness);
}

fn draw_palm_regions(canvas: &mut Canvas<'_>, regions: &[PalmRegion], thickness: i32) {
    for region in regions.iter().filter(|r| r.score >= PALM_SCORE_THRESHOLD) {
        canvas.rect(region.bbox, PALM_BOX_COLOR, thickness);
    }
}

/// Baseline JPEG of the frame; alpha is dropped.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let rgb: Vec<u8> = frame
        .rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .write_image(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("failed to encode overlay jpeg")?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HAND_LANDMARKS;
    use std::time::Instant;

    fn blank(width: u32, height: u32) -> Frame {
        Frame {
            rgba: vec![0; (width * height * 4) as usize],
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * frame.width + x) * 4) as usize;
        frame.rgba[idx..idx + 4].try_into().unwrap()
    }

    #[test]
    fn test_empty_landmarks_leave_frame_untouched() {
        let mut frame = blank(32, 32);
        draw_landmarks(&mut frame, &LandmarkSet::default());
        assert!(frame.rgba.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hand_is_drawn_at_normalized_position() {
        let mut frame = blank(100, 100);
        let mut points = vec![[0.5, 0.5, 0.0]; HAND_LANDMARKS];
        points[4] = [0.9, 0.5, 0.0];
        let set = LandmarkSet {
            right_hand: Some(points),
            ..LandmarkSet::default()
        };
        draw_landmarks(&mut frame, &set);
        assert_eq!(pixel(&frame, 50, 50), JOINT_COLOR);
        assert_eq!(pixel(&frame, 70, 50), RIGHT_HAND_COLOR);
        assert_eq!(pixel(&frame, 5, 95), [0, 0, 0, 0]);
    }

    #[test]
    fn test_invisible_pose_points_are_skipped() {
        let mut frame = blank(64, 64);
        let set = LandmarkSet {
            pose: Some(vec![[0.5, 0.5, 0.0, 0.1]; 33]),
            ..LandmarkSet::default()
        };
        draw_landmarks(&mut frame, &set);
        assert!(frame.rgba.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_frame_points_are_clipped() {
        let mut frame = blank(16, 16);
        let set = LandmarkSet {
            left_hand: Some(vec![[-3.0, 7.0, 0.0]; HAND_LANDMARKS]),
            ..LandmarkSet::default()
        };
        draw_landmarks(&mut frame, &set);
        assert_eq!(frame.rgba.len(), 16 * 16 * 4);
    }

    #[test]
    fn test_encode_jpeg_decodes_back_to_same_size() {
        let frame = blank(40, 24);
        let jpeg = encode_jpeg(&frame).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 24));
    }
}
