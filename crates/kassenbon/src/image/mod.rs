//! Image fingerprinting and duplicate detection.

pub mod dedup;
pub mod hash;

pub use dedup::{
    group_duplicates, structural_similarity, BatchImage, DuplicateDetector, DuplicateGroup, DuplicateMatch,
};
pub use hash::{hash_bytes, hash_grayscale, load_grayscale, Fingerprint, HashMethod, FINGERPRINT_BITS};
