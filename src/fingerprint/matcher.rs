//! Image-to-image fingerprint comparison.
//!
//! `DescriptorMatcher` is the built-in fallback: FAST corners over a small image
//! pyramid, 128-d gradient orientation histograms around each corner, and a
//! brute-force nearest-neighbour ratio test. A vendor matcher can replace it by
//! implementing `FingerprintMatcher`.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use std::f32::consts::PI;
use std::path::Path;

pub const DESCRIPTOR_LEN: usize = 128;

pub type Descriptor = [f32; DESCRIPTOR_LEN];

#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict {
    pub ok: bool,
    pub good_matches: usize,
    pub threshold: usize,
    pub detail: String,
}

impl MatchVerdict {
    fn rejected(threshold: usize, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            good_matches: 0,
            threshold,
            detail: detail.into(),
        }
    }
}

/// Never fails: unreadable input is a rejected verdict with the reason in `detail`.
pub trait FingerprintMatcher: Send + Sync {
    fn verify(&self, live: &Path, enrolled: &Path, threshold: usize, ratio: f32) -> MatchVerdict;
}

#[derive(Debug, Clone)]
pub struct DescriptorMatcher {
    pub fast_threshold: u8,
    pub pyramid_levels: u32,
    pub max_keypoints: usize,
}

impl Default for DescriptorMatcher {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            pyramid_levels: 3,
            max_keypoints: 500,
        }
    }
}

const PATCH_RADIUS: u32 = 8;
const CELL: usize = 4;
const ORIENTATION_BINS: usize = 8;
const DOMINANT_BINS: usize = 36;

impl DescriptorMatcher {
    pub fn describe(&self, image: &GrayImage) -> Vec<Descriptor> {
        let mut descriptors = Vec::new();
        let mut level = image.clone();
        let mut budget = self.max_keypoints;

        for depth in 0..self.pyramid_levels {
            if level.width() <= 2 * PATCH_RADIUS || level.height() <= 2 * PATCH_RADIUS || budget == 0 {
                break;
            }
            // Finer levels get the larger share of the keypoint budget.
            let share = if depth + 1 == self.pyramid_levels { budget } else { budget / 2 };
            let found = describe_level(&level, self.fast_threshold, share);
            budget = budget.saturating_sub(found.len());
            descriptors.extend(found);

            level = imageops::resize(&level, level.width() / 2, level.height() / 2, FilterType::Triangle);
        }

        descriptors
    }

    /// Count live descriptors whose nearest enrolled neighbour is clearly closer than the second.
    pub fn count_good_matches(live: &[Descriptor], enrolled: &[Descriptor], ratio: f32) -> usize {
        if enrolled.len() < 2 {
            return 0;
        }

        live.iter()
            .filter(|query| {
                let mut best = f32::INFINITY;
                let mut second = f32::INFINITY;
                for candidate in enrolled {
                    let d = distance(query, candidate);
                    if d < best {
                        second = best;
                        best = d;
                    } else if d < second {
                        second = d;
                    }
                }
                best < ratio * second
            })
            .count()
    }
}

impl FingerprintMatcher for DescriptorMatcher {
    fn verify(&self, live: &Path, enrolled: &Path, threshold: usize, ratio: f32) -> MatchVerdict {
        if !live.exists() {
            return MatchVerdict::rejected(threshold, format!("live image not found: {}", live.display()));
        }
        if !enrolled.exists() {
            return MatchVerdict::rejected(threshold, format!("enrolled image not found: {}", enrolled.display()));
        }

        let (live_img, enrolled_img) = match (image::open(live), image::open(enrolled)) {
            (Ok(a), Ok(b)) => (a.to_luma8(), b.to_luma8()),
            (a, b) => {
                if let Err(e) = a.and(b) {
                    tracing::debug!("Fingerprint image decode failed: {}", e);
                }
                return MatchVerdict::rejected(threshold, "failed to read images");
            }
        };

        let live_desc = self.describe(&live_img);
        let enrolled_desc = self.describe(&enrolled_img);
        if live_desc.is_empty() || enrolled_desc.is_empty() {
            return MatchVerdict::rejected(threshold, "insufficient features");
        }

        let good = Self::count_good_matches(&live_desc, &enrolled_desc, ratio);
        let ok = good >= threshold;
        tracing::debug!(
            "Fingerprint match: {} live / {} enrolled descriptors, {} good",
            live_desc.len(),
            enrolled_desc.len(),
            good
        );

        MatchVerdict {
            ok,
            good_matches: good,
            threshold,
            detail: if ok {
                format!("good={} >= {}", good, threshold)
            } else {
                format!("good={} < {}", good, threshold)
            },
        }
    }
}

fn describe_level(image: &GrayImage, fast_threshold: u8, limit: usize) -> Vec<Descriptor> {
    let blurred = gaussian_blur_f32(image, 1.0);
    let mut corners = corners_fast9(&blurred, fast_threshold);
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));

    let gx = horizontal_sobel(&blurred);
    let gy = vertical_sobel(&blurred);
    let (width, height) = blurred.dimensions();

    let mut out = Vec::new();
    for corner in corners {
        if out.len() >= limit {
            break;
        }
        if corner.x < PATCH_RADIUS
            || corner.y < PATCH_RADIUS
            || corner.x + PATCH_RADIUS > width
            || corner.y + PATCH_RADIUS > height
        {
            continue;
        }

        let x0 = corner.x - PATCH_RADIUS;
        let y0 = corner.y - PATCH_RADIUS;
        let side = 2 * PATCH_RADIUS;
        let sample = |dx: u32, dy: u32| {
            let h = gx.get_pixel(x0 + dx, y0 + dy)[0] as f32;
            let v = gy.get_pixel(x0 + dx, y0 + dy)[0] as f32;
            (h.hypot(v), v.atan2(h))
        };

        let mut dominant = [0f32; DOMINANT_BINS];
        for dy in 0..side {
            for dx in 0..side {
                let (magnitude, angle) = sample(dx, dy);
                dominant[angle_bin(angle, DOMINANT_BINS)] += magnitude;
            }
        }
        let peak = dominant
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let reference = (peak as f32 + 0.5) * 2.0 * PI / DOMINANT_BINS as f32;

        let mut descriptor = [0f32; DESCRIPTOR_LEN];
        for dy in 0..side {
            for dx in 0..side {
                let (magnitude, angle) = sample(dx, dy);
                if magnitude == 0.0 {
                    continue;
                }
                let cell = (dy as usize / CELL) * (side as usize / CELL) + dx as usize / CELL;
                let bin = angle_bin(angle - reference, ORIENTATION_BINS);
                descriptor[cell * ORIENTATION_BINS + bin] += magnitude;
            }
        }

        if normalize(&mut descriptor) {
            for value in descriptor.iter_mut() {
                *value = value.min(0.2);
            }
            normalize(&mut descriptor);
            out.push(descriptor);
        }
    }
    out
}

fn angle_bin(angle: f32, bins: usize) -> usize {
    let turn = angle.rem_euclid(2.0 * PI) / (2.0 * PI);
    ((turn * bins as f32) as usize).min(bins - 1)
}

/// Returns false for an all-zero vector.
fn normalize(v: &mut Descriptor) -> bool {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return false;
    }
    for value in v.iter_mut() {
        *value /= norm;
    }
    true
}

fn distance(a: &Descriptor, b: &Descriptor) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn blocks(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<u8> = (0..256).map(|_| rng.gen()).collect();
        GrayImage::from_fn(160, 160, |x, y| Luma([values[((y / 10) * 16 + x / 10) as usize]]))
    }

    #[test]
    fn identical_images_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("print.bmp");
        blocks(7).save(&path).unwrap();

        let verdict = DescriptorMatcher::default().verify(&path, &path, 15, 0.8);
        assert!(verdict.ok, "{}", verdict.detail);
        assert!(verdict.good_matches >= 15);
        assert!(verdict.detail.starts_with(&format!("good={} >= 15", verdict.good_matches)));
    }

    #[test]
    fn blank_images_have_no_features() {
        let dir = tempdir().unwrap();
        let blank = dir.path().join("blank.bmp");
        GrayImage::from_pixel(64, 64, Luma([128])).save(&blank).unwrap();
        let textured = dir.path().join("textured.bmp");
        blocks(3).save(&textured).unwrap();

        let verdict = DescriptorMatcher::default().verify(&blank, &textured, 15, 0.8);
        assert!(!verdict.ok);
        assert_eq!(verdict.detail, "insufficient features");
    }

    #[test]
    fn missing_and_unreadable_files_are_reported() {
        let dir = tempdir().unwrap();
        let present = dir.path().join("present.bmp");
        blocks(1).save(&present).unwrap();
        let missing = dir.path().join("missing.bmp");

        let verdict = DescriptorMatcher::default().verify(&missing, &present, 15, 0.8);
        assert_eq!(verdict.detail, format!("live image not found: {}", missing.display()));

        let verdict = DescriptorMatcher::default().verify(&present, &missing, 15, 0.8);
        assert!(verdict.detail.starts_with("enrolled image not found"));

        let garbage = dir.path().join("garbage.bmp");
        std::fs::write(&garbage, b"not an image").unwrap();
        let verdict = DescriptorMatcher::default().verify(&garbage, &present, 15, 0.8);
        assert_eq!(verdict.detail, "failed to read images");
    }

    #[test]
    fn failing_verdict_reports_count_and_threshold() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bmp");
        blocks(11).save(&a).unwrap();

        let verdict = DescriptorMatcher::default().verify(&a, &a, 100_000, 0.8);
        assert!(!verdict.ok);
        assert_eq!(verdict.detail, format!("good={} < 100000", verdict.good_matches));
    }

    #[test]
    fn ratio_test_needs_two_candidates_and_clear_winner() {
        let mut a = [0f32; DESCRIPTOR_LEN];
        a[0] = 1.0;
        let mut b = [0f32; DESCRIPTOR_LEN];
        b[1] = 1.0;

        assert_eq!(DescriptorMatcher::count_good_matches(&[a], &[a], 0.8), 0);
        assert_eq!(DescriptorMatcher::count_good_matches(&[a], &[a, b], 0.8), 1);
        // Equidistant candidates are ambiguous.
        assert_eq!(DescriptorMatcher::count_good_matches(&[a], &[b, b], 0.8), 0);
    }
}
