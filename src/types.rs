use std::time::Instant;

use anyhow::{Context, Result};

pub const POSE_LANDMARKS: usize = 33;
pub const FACE_LANDMARKS: usize = 468;
pub const HAND_LANDMARKS: usize = 21;

#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    /// Decodes any image format enabled on the `image` crate (PNG, JPEG).
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes).context("failed to decode image bytes")?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            rgba: rgba.into_raw(),
            width,
            height,
            timestamp: Instant::now(),
        })
    }

    /// Horizontal flip, the selfie view used while recording datasets.
    pub fn mirrored(&self) -> Self {
        let stride = self.width as usize * 4;
        let mut rgba = Vec::with_capacity(self.rgba.len());
        for row in self.rgba.chunks_exact(stride) {
            for px in row.chunks_exact(4).rev() {
                rgba.extend_from_slice(px);
            }
        }
        Self {
            rgba,
            width: self.width,
            height: self.height,
            timestamp: self.timestamp,
        }
    }

    pub fn is_consistent(&self) -> bool {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(4)
            == self.rgba.len()
    }
}

#[derive(Clone, Debug)]
pub struct PalmRegion {
    pub bbox: [f32; 4],
    pub landmarks: Vec<(f32, f32)>,
    pub score: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "left",
            Handedness::Right => "right",
        }
    }
}

/// One detected hand in normalized image coordinates.
#[derive(Clone, Debug)]
pub struct HandLandmarks {
    pub points: Vec<[f32; 3]>,
    pub handedness: Handedness,
    pub score: f32,
}

/// Landmarks of a single frame before flattening. Coordinates are normalized
/// to `[0, 1]` by frame width/height, `z` uses the same scale as `x`.
#[derive(Clone, Debug, Default)]
pub struct LandmarkSet {
    pub pose: Option<Vec<[f32; 4]>>,
    pub face: Option<Vec<[f32; 3]>>,
    pub left_hand: Option<Vec<[f32; 3]>>,
    pub right_hand: Option<Vec<[f32; 3]>>,
    /// Slot holding the best scored hand, set by [`LandmarkSet::assign_hands`].
    pub primary_hand: Option<Handedness>,
    pub palm_regions: Vec<PalmRegion>,
}

impl LandmarkSet {
    pub fn is_empty(&self) -> bool {
        self.pose.is_none()
            && self.face.is_none()
            && self.left_hand.is_none()
            && self.right_hand.is_none()
    }

    /// Places hands into the left/right slots. When both claim the same side
    /// the better scored one keeps it and the other takes the free slot.
    pub fn assign_hands(&mut self, mut hands: Vec<HandLandmarks>) {
        hands.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for hand in hands.into_iter().take(2) {
            let left_free = self.left_hand.is_none();
            let right_free = self.right_hand.is_none();
            let side = match (hand.handedness, left_free, right_free) {
                (Handedness::Left, true, _) => Handedness::Left,
                (Handedness::Right, _, true) => Handedness::Right,
                (_, true, _) => Handedness::Left,
                (_, _, true) => Handedness::Right,
                _ => continue,
            };
            match side {
                Handedness::Left => self.left_hand = Some(hand.points),
                Handedness::Right => self.right_hand = Some(hand.points),
            }
            self.primary_hand.get_or_insert(side);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hand(handedness: Handedness, score: f32, marker: f32) -> HandLandmarks {
        HandLandmarks {
            points: vec![[marker, 0.0, 0.0]; HAND_LANDMARKS],
            handedness,
            score,
        }
    }

    #[test]
    fn test_mirrored_flips_rows() {
        let frame = Frame {
            rgba: vec![1, 1, 1, 255, 2, 2, 2, 255, 3, 3, 3, 255, 4, 4, 4, 255],
            width: 2,
            height: 2,
            timestamp: Instant::now(),
        };
        let flipped = frame.mirrored();
        assert_eq!(flipped.rgba[0], 2);
        assert_eq!(flipped.rgba[4], 1);
        assert_eq!(flipped.rgba[8], 4);
        assert_eq!(flipped.rgba[12], 3);
    }

    #[test]
    fn test_from_image_bytes_rejects_garbage() {
        assert!(Frame::from_image_bytes(b"not an image").is_err());
    }

    #[test]
    fn test_from_image_bytes_decodes_png() {
        let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        let frame = Frame::from_image_bytes(&bytes).unwrap();
        assert_eq!((frame.width, frame.height), (3, 2));
        assert!(frame.is_consistent());
    }

    #[test]
    fn test_assign_hands_uses_handedness() {
        let mut set = LandmarkSet::default();
        set.assign_hands(vec![
            hand(Handedness::Right, 0.9, 1.0),
            hand(Handedness::Left, 0.8, 2.0),
        ]);
        assert_eq!(set.primary_hand, Some(Handedness::Right));
        assert_eq!(set.right_hand.unwrap()[0][0], 1.0);
        assert_eq!(set.left_hand.unwrap()[0][0], 2.0);
    }

    #[test]
    fn test_primary_hand_is_best_scored() {
        let mut set = LandmarkSet::default();
        set.assign_hands(vec![
            hand(Handedness::Right, 0.55, 1.0),
            hand(Handedness::Left, 0.95, 2.0),
        ]);
        assert_eq!(set.primary_hand, Some(Handedness::Left));
    }

    #[test]
    fn test_assign_hands_resolves_conflict_by_score() {
        let mut set = LandmarkSet::default();
        set.assign_hands(vec![
            hand(Handedness::Right, 0.6, 1.0),
            hand(Handedness::Right, 0.9, 2.0),
        ]);
        assert_eq!(set.right_hand.unwrap()[0][0], 2.0);
        assert_eq!(set.left_hand.unwrap()[0][0], 1.0);
    }
}
