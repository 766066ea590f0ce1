//! Perceptual image hashing.
//!
//! Three interchangeable algorithms, all producing a 64-bit fingerprint:
//!
//! - **Frequency** (default): resize, 2D DCT, threshold the low-frequency
//!   block against its median. Most resistant to false positives.
//! - **Gradient**: resize to 9×8, threshold horizontal neighbor
//!   differences.
//! - **BlurDiff**: resize, Gaussian blur, threshold the residual against
//!   its median.
//!
//! Fingerprints are compared by Hamming distance:
//! `similarity = 1 - distance/64`, clamped to `[0, 1]`.

use crate::error::Result;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Number of bits in a fingerprint (8×8 bit matrix).
pub const FINGERPRINT_BITS: u32 = 64;

const HASH_SIZE: u32 = 8;

/// Perceptual hash algorithm selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    #[default]
    Frequency,
    Gradient,
    BlurDiff,
}

impl HashMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashMethod::Frequency => "frequency",
            HashMethod::Gradient => "gradient",
            HashMethod::BlurDiff => "blur_diff",
        }
    }
}

/// A 64-bit perceptual fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    bits: u64,
}

impl Fingerprint {
    pub fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Render as a 16-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bits.to_be_bytes())
    }

    /// Parse a fingerprint previously rendered with [`Fingerprint::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| crate::KassenbonError::ImageProcessing {
            message: format!("invalid fingerprint hex: {}", e),
            source: Some(Box::new(e)),
        })?;
        if bytes.len() != 8 {
            return Err(crate::KassenbonError::image(format!(
                "fingerprint must be 8 bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(Self {
            bits: u64::from_be_bytes(buf),
        })
    }

    /// Similarity to another fingerprint in `[0, 1]`.
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        let distance = (self.bits ^ other.bits).count_ones();
        (1.0 - f64::from(distance) / f64::from(FINGERPRINT_BITS)).clamp(0.0, 1.0)
    }
}

/// Decode image bytes into an 8-bit grayscale image.
pub fn load_grayscale(bytes: &[u8]) -> Result<GrayImage> {
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_luma8())
}

/// Compute the perceptual fingerprint of raw image bytes.
pub fn hash_bytes(bytes: &[u8], method: HashMethod) -> Result<Fingerprint> {
    let gray = load_grayscale(bytes)?;
    Ok(hash_grayscale(&gray, method))
}

/// Compute the perceptual fingerprint of an already-decoded grayscale image.
pub fn hash_grayscale(gray: &GrayImage, method: HashMethod) -> Fingerprint {
    match method {
        HashMethod::Frequency => frequency_hash(gray),
        HashMethod::Gradient => gradient_hash(gray),
        HashMethod::BlurDiff => blur_diff_hash(gray),
    }
}

/// DCT-based hash: low frequencies capture overall structure, so receipts
/// photographed twice land on the same bits even with noise and skew.
fn frequency_hash(gray: &GrayImage) -> Fingerprint {
    let size = HASH_SIZE * 4;
    let resized = imageops::resize(gray, size, size, FilterType::Triangle);

    let pixels: Vec<f64> = resized.pixels().map(|p| f64::from(p.0[0])).collect();
    let dct = dct_2d(&pixels, size as usize);

    // Top-left block holds the low-frequency coefficients.
    let mut low = Vec::with_capacity((HASH_SIZE * HASH_SIZE) as usize);
    for y in 0..HASH_SIZE as usize {
        for x in 0..HASH_SIZE as usize {
            low.push(dct[y * size as usize + x]);
        }
    }

    let median = median_of(&low);
    bits_above_threshold(&low, median)
}

/// Gradient hash: one bit per horizontal neighbor comparison on a 9×8 grid.
fn gradient_hash(gray: &GrayImage) -> Fingerprint {
    let resized = imageops::resize(gray, HASH_SIZE + 1, HASH_SIZE, FilterType::Triangle);

    let mut bits = 0u64;
    let mut bit = 0u32;
    for y in 0..HASH_SIZE {
        for x in 0..HASH_SIZE {
            if resized.get_pixel(x + 1, y).0[0] > resized.get_pixel(x, y).0[0] {
                bits |= 1u64 << (FINGERPRINT_BITS - 1 - bit);
            }
            bit += 1;
        }
    }
    Fingerprint::from_bits(bits)
}

/// Blur-difference hash: the residual between an image and its blur is a
/// cheap band-pass; thresholding it against its median keeps edges.
fn blur_diff_hash(gray: &GrayImage) -> Fingerprint {
    let size = HASH_SIZE * 2;
    let resized = imageops::resize(gray, size, size, FilterType::Triangle);
    let blurred = imageops::blur(&resized, 1.0);

    let mut diff = vec![0.0f64; (size * size) as usize];
    for (i, (orig, blur)) in resized.pixels().zip(blurred.pixels()).enumerate() {
        diff[i] = f64::from(orig.0[0]) - f64::from(blur.0[0]);
    }

    // Average-pool 16×16 down to the 8×8 hash grid.
    let mut pooled = Vec::with_capacity((HASH_SIZE * HASH_SIZE) as usize);
    for y in 0..HASH_SIZE as usize {
        for x in 0..HASH_SIZE as usize {
            let mut sum = 0.0;
            for dy in 0..2 {
                for dx in 0..2 {
                    sum += diff[(y * 2 + dy) * size as usize + (x * 2 + dx)];
                }
            }
            pooled.push(sum / 4.0);
        }
    }

    let median = median_of(&pooled);
    bits_above_threshold(&pooled, median)
}

fn bits_above_threshold(values: &[f64], threshold: f64) -> Fingerprint {
    let mut bits = 0u64;
    for (i, &v) in values.iter().enumerate() {
        if v > threshold {
            bits |= 1u64 << (FINGERPRINT_BITS as usize - 1 - i);
        }
    }
    Fingerprint::from_bits(bits)
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Naive separable 2D DCT-II over a square grid. Grids here are tiny
/// (32x32), so the O(n^3) row/column passes are fine without an FFT.
fn dct_2d(input: &[f64], n: usize) -> Vec<f64> {
    let mut rows = vec![0.0f64; n * n];
    for y in 0..n {
        for u in 0..n {
            let mut sum = 0.0;
            for x in 0..n {
                sum += input[y * n + x]
                    * ((std::f64::consts::PI * (2.0 * x as f64 + 1.0) * u as f64) / (2.0 * n as f64)).cos();
            }
            rows[y * n + u] = sum;
        }
    }

    let mut out = vec![0.0f64; n * n];
    for u in 0..n {
        for v in 0..n {
            let mut sum = 0.0;
            for y in 0..n {
                sum += rows[y * n + u]
                    * ((std::f64::consts::PI * (2.0 * y as f64 + 1.0) * v as f64) / (2.0 * n as f64)).cos();
            }
            out[v * n + u] = sum;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn horizontal_gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 255 / width.max(1)) as u8]))
    }

    fn vertical_gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| Luma([(y * 255 / height.max(1)) as u8]))
    }

    #[test]
    fn test_similarity_identity() {
        let fp = Fingerprint::from_bits(0xDEAD_BEEF_0123_4567);
        assert!((fp.similarity(&fp) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_similarity_counts_differing_bits() {
        let a = Fingerprint::from_bits(0);
        let b = Fingerprint::from_bits(0b1111); // 4 of 64 bits differ
        let expected = 1.0 - 4.0 / 64.0;
        assert!((a.similarity(&b) - expected).abs() < 1e-12);

        let c = Fingerprint::from_bits(u64::MAX);
        assert!((a.similarity(&c) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::from_bits(0x00FF_00FF_ABCD_0001);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), fp);
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(Fingerprint::from_hex("abcd").is_err());
        assert!(Fingerprint::from_hex("not hex!").is_err());
    }

    #[test]
    fn test_gradient_hash_separates_orientations() {
        let horizontal = horizontal_gradient(64, 64);
        let vertical = vertical_gradient(64, 64);

        let h = hash_grayscale(&horizontal, HashMethod::Gradient);
        let v = hash_grayscale(&vertical, HashMethod::Gradient);

        // Monotone horizontal ramp: every neighbor comparison is true.
        assert_eq!(h.bits(), u64::MAX);
        // Constant rows: no horizontal edges at all.
        assert_eq!(v.bits(), 0);
        assert!(h.similarity(&v) < 0.1);
    }

    #[test]
    fn test_same_image_hashes_identically_for_all_methods() {
        let img = horizontal_gradient(120, 200);
        for method in [HashMethod::Frequency, HashMethod::Gradient, HashMethod::BlurDiff] {
            let a = hash_grayscale(&img, method);
            let b = hash_grayscale(&img, method);
            assert_eq!(a, b, "method {:?} not deterministic", method);
        }
    }

    #[test]
    fn test_frequency_hash_differs_for_different_structure() {
        let a = hash_grayscale(&horizontal_gradient(64, 64), HashMethod::Frequency);
        let b = hash_grayscale(&vertical_gradient(64, 64), HashMethod::Frequency);
        assert!(a.similarity(&b) < 0.95);
    }

    #[test]
    fn test_hash_bytes_decodes_png() {
        let img = horizontal_gradient(32, 32);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let from_bytes = hash_bytes(&bytes, HashMethod::Gradient).unwrap();
        let direct = hash_grayscale(&img, HashMethod::Gradient);
        assert_eq!(from_bytes, direct);
    }

    #[test]
    fn test_hash_bytes_rejects_garbage() {
        assert!(hash_bytes(b"definitely not an image", HashMethod::Frequency).is_err());
    }
}
