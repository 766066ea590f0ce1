//! Duplicate detection over batches of receipt images.
//!
//! Two-stage gate per pair: perceptual-hash similarity first, then a cheap
//! structural re-check for pairs that clear the threshold. Hash similarity
//! alone produces false positives on visually distinct but structurally
//! similar receipts (same template, different numbers), so a pair is
//! accepted only if `max(hash, structural) >= threshold`.
//!
//! Comparison is O(n²) per batch. Batches are small windows of freshly
//! ingested files, not the whole corpus; optimizing beyond that scale is a
//! non-goal.

use crate::error::Result;
use crate::image::hash::{self, Fingerprint, HashMethod};
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One image in a deduplication batch.
#[derive(Debug, Clone)]
pub struct BatchImage {
    pub logical_id: String,
    pub bytes: Vec<u8>,
}

impl BatchImage {
    pub fn new(logical_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            logical_id: logical_id.into(),
            bytes,
        }
    }
}

/// A pair of images judged to be duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub logical_id_a: String,
    pub logical_id_b: String,
    /// `max(hash similarity, structural similarity)` for the pair.
    pub similarity: f64,
    /// Which gate produced the score, e.g. `"phash"` or `"phash+structural"`.
    pub method: String,
}

/// A connected component of duplicate matches, size >= 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<String>,
}

/// Pairwise duplicate detector.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    threshold: f64,
    method: HashMethod,
}

impl DuplicateDetector {
    pub fn new(threshold: f64, method: HashMethod) -> Self {
        Self { threshold, method }
    }

    /// Fingerprint every decodable image in the batch.
    ///
    /// Undecodable images are logged and skipped; a corrupt upload must not
    /// abort duplicate detection for the rest of the batch.
    pub fn fingerprints(&self, images: &[BatchImage]) -> Vec<(String, Fingerprint)> {
        images
            .iter()
            .filter_map(|img| match hash::hash_bytes(&img.bytes, self.method) {
                Ok(fp) => Some((img.logical_id.clone(), fp)),
                Err(e) => {
                    tracing::warn!(logical_id = %img.logical_id, "skipping unhashable image: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Find all duplicate pairs within a batch.
    pub fn find_duplicates(&self, images: &[BatchImage]) -> Result<Vec<DuplicateMatch>> {
        let mut decoded: Vec<(usize, Fingerprint, GrayImage)> = Vec::with_capacity(images.len());
        for (idx, img) in images.iter().enumerate() {
            match hash::load_grayscale(&img.bytes) {
                Ok(gray) => {
                    let fp = hash::hash_grayscale(&gray, self.method);
                    decoded.push((idx, fp, gray));
                }
                Err(e) => {
                    tracing::warn!(logical_id = %img.logical_id, "skipping undecodable image: {}", e);
                }
            }
        }

        let mut matches = Vec::new();
        for i in 0..decoded.len() {
            for j in (i + 1)..decoded.len() {
                let (idx_a, fp_a, gray_a) = &decoded[i];
                let (idx_b, fp_b, gray_b) = &decoded[j];

                let hash_sim = fp_a.similarity(fp_b);
                if hash_sim < self.threshold {
                    continue;
                }

                let structural = structural_similarity(gray_a, gray_b);
                let similarity = hash_sim.max(structural);
                if similarity < self.threshold {
                    continue;
                }

                let method = if structural > hash_sim {
                    "phash+structural"
                } else {
                    "phash"
                };
                matches.push(DuplicateMatch {
                    logical_id_a: images[*idx_a].logical_id.clone(),
                    logical_id_b: images[*idx_b].logical_id.clone(),
                    similarity,
                    method: method.to_string(),
                });
            }
        }

        tracing::info!(
            pairs = matches.len(),
            batch = images.len(),
            "duplicate detection finished"
        );
        Ok(matches)
    }
}

/// Cheap structural comparison: mean squared difference at common
/// dimensions, mapped through a PSNR-style curve onto `[0, 1]`.
///
/// This is a rough approximation, not SSIM; only the thresholded decision
/// feeds the duplicate gate.
pub fn structural_similarity(a: &GrayImage, b: &GrayImage) -> f64 {
    let width = a.width().min(b.width());
    let height = a.height().min(b.height());
    if width == 0 || height == 0 {
        return 0.0;
    }

    let a = imageops::resize(a, width, height, FilterType::Triangle);
    let b = imageops::resize(b, width, height, FilterType::Triangle);

    let mut sum_sq = 0.0f64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let diff = f64::from(pa.0[0]) - f64::from(pb.0[0]);
        sum_sq += diff * diff;
    }
    let mse = sum_sq / f64::from(width * height);
    if mse == 0.0 {
        return 1.0;
    }

    let psnr = 20.0 * (255.0 / mse.sqrt()).log10();
    (psnr / 50.0).clamp(0.0, 1.0)
}

/// Union matches into connected components of size >= 2.
///
/// Iterative DFS with an explicit stack; pathological batches must not be
/// able to overflow the call stack.
pub fn group_duplicates(matches: &[DuplicateMatch]) -> Vec<DuplicateGroup> {
    let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for m in matches {
        adjacency
            .entry(m.logical_id_a.as_str())
            .or_default()
            .insert(m.logical_id_b.as_str());
        adjacency
            .entry(m.logical_id_b.as_str())
            .or_default()
            .insert(m.logical_id_a.as_str());
    }

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut groups = Vec::new();

    for &start in adjacency.keys() {
        if visited.contains(start) {
            continue;
        }

        let mut members = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            members.push(node.to_string());
            if let Some(neighbors) = adjacency.get(node) {
                stack.extend(neighbors.iter().filter(|n| !visited.contains(*n)).copied());
            }
        }

        if members.len() >= 2 {
            members.sort();
            groups.push(DuplicateGroup { members });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn horizontal_gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 255 / width) as u8]))
    }

    fn vertical_gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| Luma([(y * 255 / height) as u8]))
    }

    fn matched(a: &str, b: &str, similarity: f64) -> DuplicateMatch {
        DuplicateMatch {
            logical_id_a: a.to_string(),
            logical_id_b: b.to_string(),
            similarity,
            method: "phash".to_string(),
        }
    }

    #[test]
    fn test_structural_similarity_identical_is_one() {
        let img = horizontal_gradient(40, 40);
        assert!((structural_similarity(&img, &img) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_structural_similarity_distinct_is_low() {
        let a = horizontal_gradient(40, 40);
        let b = vertical_gradient(40, 40);
        assert!(structural_similarity(&a, &b) < 0.95);
    }

    #[test]
    fn test_find_duplicates_identical_bytes() {
        let img = horizontal_gradient(64, 64);
        let bytes = png_bytes(&img);
        let batch = vec![
            BatchImage::new("a", bytes.clone()),
            BatchImage::new("b", bytes),
            BatchImage::new("c", png_bytes(&vertical_gradient(64, 64))),
        ];

        let detector = DuplicateDetector::new(0.95, HashMethod::Gradient);
        let matches = detector.find_duplicates(&batch).unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].logical_id_a, "a");
        assert_eq!(matches[0].logical_id_b, "b");
        assert!((matches[0].similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_find_duplicates_skips_undecodable() {
        let img = horizontal_gradient(64, 64);
        let batch = vec![
            BatchImage::new("ok", png_bytes(&img)),
            BatchImage::new("broken", b"not an image".to_vec()),
        ];

        let detector = DuplicateDetector::new(0.95, HashMethod::Frequency);
        let matches = detector.find_duplicates(&batch).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_group_duplicates_transitive_chain() {
        let matches = vec![matched("A", "B", 0.97), matched("B", "C", 0.96)];
        let groups = group_duplicates(&matches);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_group_duplicates_disjoint_pairs() {
        let matches = vec![matched("A", "B", 0.97), matched("C", "D", 0.96)];
        let groups = group_duplicates(&matches);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec!["A", "B"]);
        assert_eq!(groups[1].members, vec!["C", "D"]);
    }

    #[test]
    fn test_group_duplicates_empty() {
        assert!(group_duplicates(&[]).is_empty());
    }

    #[test]
    fn test_fingerprints_skip_bad_images() {
        let detector = DuplicateDetector::new(0.95, HashMethod::Gradient);
        let batch = vec![
            BatchImage::new("good", png_bytes(&horizontal_gradient(32, 32))),
            BatchImage::new("bad", vec![0, 1, 2, 3]),
        ];
        let fps = detector.fingerprints(&batch);
        assert_eq!(fps.len(), 1);
        assert_eq!(fps[0].0, "good");
    }
}
