use std::sync::OnceLock;

use super::super::PALM_INPUT_SIZE;

const STRIDES: [u32; 4] = [8, 16, 16, 16];
const ANCHORS_PER_LAYER: usize = 2;
const ANCHOR_OFFSET: f32 = 0.5;

/// SSD anchor centres `[cx, cy]` in normalized input coordinates. Layers that
/// share a stride are merged, matching the order of the model's outputs.
pub fn anchors() -> &'static [[f32; 2]] {
    static ANCHORS: OnceLock<Vec<[f32; 2]>> = OnceLock::new();
    ANCHORS.get_or_init(generate)
}

fn generate() -> Vec<[f32; 2]> {
    let mut anchors = Vec::new();
    let mut layer = 0;
    while layer < STRIDES.len() {
        let stride = STRIDES[layer];
        let mut repeats = 0;
        while layer < STRIDES.len() && STRIDES[layer] == stride {
            repeats += ANCHORS_PER_LAYER;
            layer += 1;
        }

        let size = PALM_INPUT_SIZE.div_ceil(stride);
        for y in 0..size {
            for x in 0..size {
                let cx = (x as f32 + ANCHOR_OFFSET) / size as f32;
                let cy = (y as f32 + ANCHOR_OFFSET) / size as f32;
                for _ in 0..repeats {
                    anchors.push([cx, cy]);
                }
            }
        }
    }
    anchors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_count_matches_model() {
        assert_eq!(anchors().len(), 2016);
    }

    #[test]
    fn test_anchors_are_normalized() {
        assert!(
            anchors()
                .iter()
                .all(|[x, y]| *x > 0.0 && *x < 1.0 && *y > 0.0 && *y < 1.0)
        );
        assert_eq!(anchors()[0], [0.5 / 24.0, 0.5 / 24.0]);
        assert_eq!(anchors()[1152], [0.5 / 12.0, 0.5 / 12.0]);
    }
}
