//! Image sharpness metrics.
//!
//! Pure functions over a grayscale frame; no state, no knowledge of
//! where the frame came from. Both metrics grow monotonically with
//! in-focus high-frequency content, which is all the sweep needs — the
//! absolute value is meaningless across exposure changes.

use serde::Deserialize;

use crate::camera::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMetric {
    /// Variance of the 4-neighbour Laplacian. Cheap, robust default.
    #[default]
    LaplacianVariance,
    /// Mean squared Sobel gradient magnitude. More tolerant of noise,
    /// slightly slower.
    Tenengrad,
}

impl FocusMetric {
    /// Score a frame; higher is sharper. Frames smaller than 3x3 score 0.
    pub fn score(&self, frame: &Frame) -> f64 {
        if frame.width < 3 || frame.height < 3 {
            return 0.0;
        }
        match self {
            FocusMetric::LaplacianVariance => laplacian_variance(frame),
            FocusMetric::Tenengrad => tenengrad(frame),
        }
    }
}

fn laplacian_variance(frame: &Frame) -> f64 {
    let w = frame.width as usize;
    let data = &frame.data;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;

    for y in 1..(frame.height as usize - 1) {
        for x in 1..(w - 1) {
            let idx = y * w + x;
            let lap = 4.0 * data[idx] as f64
                - data[idx - 1] as f64
                - data[idx + 1] as f64
                - data[idx - w] as f64
                - data[idx + w] as f64;
            sum += lap;
            sum_sq += lap * lap;
            n += 1;
        }
    }

    let mean = sum / n as f64;
    sum_sq / n as f64 - mean * mean
}

fn tenengrad(frame: &Frame) -> f64 {
    let w = frame.width as usize;
    let data = &frame.data;
    let px = |x: usize, y: usize| data[y * w + x] as f64;
    let mut acc = 0.0f64;
    let mut n = 0usize;

    for y in 1..(frame.height as usize - 1) {
        for x in 1..(w - 1) {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            acc += gx * gx + gy * gy;
            n += 1;
        }
    }

    acc / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8) -> Frame {
        Frame::new(16, 16, vec![value; 256])
    }

    fn checkerboard() -> Frame {
        let mut data = Vec::with_capacity(256);
        for y in 0..16u32 {
            for x in 0..16u32 {
                data.push(if (x + y) % 2 == 0 { 255 } else { 0 });
            }
        }
        Frame::new(16, 16, data)
    }

    #[test]
    fn uniform_frame_scores_zero() {
        assert_eq!(FocusMetric::LaplacianVariance.score(&uniform(128)), 0.0);
        assert_eq!(FocusMetric::Tenengrad.score(&uniform(128)), 0.0);
    }

    #[test]
    fn sharper_content_scores_higher() {
        let sharp = checkerboard();
        // Blur the checkerboard with a 3x3 box filter.
        let mut blurred = vec![0u8; 256];
        for y in 1..15usize {
            for x in 1..15usize {
                let mut acc = 0u32;
                for dy in 0..3usize {
                    for dx in 0..3usize {
                        acc += sharp.data[(y + dy - 1) * 16 + (x + dx - 1)] as u32;
                    }
                }
                blurred[y * 16 + x] = (acc / 9) as u8;
            }
        }
        let blurred = Frame::new(16, 16, blurred);

        for metric in [FocusMetric::LaplacianVariance, FocusMetric::Tenengrad] {
            assert!(
                metric.score(&sharp) > metric.score(&blurred),
                "{metric:?} did not rank sharp above blurred"
            );
        }
    }

    #[test]
    fn tiny_frames_score_zero() {
        let frame = Frame::new(2, 2, vec![0, 255, 255, 0]);
        assert_eq!(FocusMetric::LaplacianVariance.score(&frame), 0.0);
    }
}
