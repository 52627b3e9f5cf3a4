//! Similarity scores in the range 0..=100.

use crate::core::image::ImageRecord;

const LANES: usize = 8;

/// Which representation produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBasis {
    Embedding,
    Hash,
}

/// `(1 - hamming / 64) * 100`.
pub fn hash_similarity(a: u64, b: u64) -> f32 {
    let distance = (a ^ b).count_ones();
    (1.0 - distance as f32 / 64.0) * 100.0
}

/// Dot product with eight independent partial sums and a scalar tail.
///
/// Returns `None` when the lengths differ.
pub fn dot(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }

    let mut partial = [0.0f32; LANES];
    let chunks_a = a.chunks_exact(LANES);
    let chunks_b = b.chunks_exact(LANES);
    let tail_a = chunks_a.remainder();
    let tail_b = chunks_b.remainder();

    for (ca, cb) in chunks_a.zip(chunks_b) {
        for lane in 0..LANES {
            partial[lane] += ca[lane] * cb[lane];
        }
    }

    let mut sum: f32 = partial.iter().sum();
    for (x, y) in tail_a.iter().zip(tail_b) {
        sum += x * y;
    }
    Some(sum)
}

/// Cosine similarity of two unit vectors mapped from [-1, 1] to [0, 100].
///
/// Empty or mismatched vectors score zero.
pub fn embedding_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    match dot(a, b) {
        Some(cosine) => (cosine.clamp(-1.0, 1.0) + 1.0) * 50.0,
        None => {
            log::debug!("Embedding length mismatch: {} vs {}", a.len(), b.len());
            0.0
        }
    }
}

/// Score two records: embeddings when both have equal-length non-empty
/// vectors, otherwise hashes when both have one, otherwise `None`.
pub fn score_records(a: &ImageRecord, b: &ImageRecord) -> Option<(f32, ScoreBasis)> {
    if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
        if !ea.is_empty() && ea.len() == eb.len() {
            return Some((embedding_similarity(ea, eb), ScoreBasis::Embedding));
        }
    }
    match (a.hash, b.hash) {
        (Some(ha), Some(hb)) => Some((hash_similarity(ha, hb), ScoreBasis::Hash)),
        _ => None,
    }
}

/// L2-normalize in place. Vectors with a near-zero norm are left as is.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = dot(vector, vector).unwrap_or(0.0).sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::FileStamp;
    use std::path::PathBuf;
    use std::time::UNIX_EPOCH;

    fn unit(values: &[f32]) -> Vec<f32> {
        let mut v = values.to_vec();
        l2_normalize(&mut v);
        v
    }

    fn record(embedding: Option<Vec<f32>>, hash: Option<u64>) -> ImageRecord {
        let mut record = ImageRecord::new(
            PathBuf::from("x.png"),
            FileStamp {
                size: 0,
                modified: UNIX_EPOCH,
            },
        );
        record.embedding = embedding;
        record.hash = hash;
        record
    }

    #[test]
    fn test_hash_similarity_bounds_and_symmetry() {
        let a = 0xDEAD_BEEF_0123_4567u64;
        let b = 0x0F0F_F0F0_AAAA_5555u64;
        assert_eq!(hash_similarity(a, a), 100.0);
        assert_eq!(hash_similarity(a, !a), 0.0);
        assert_eq!(hash_similarity(a, b), hash_similarity(b, a));
        assert_eq!(hash_similarity(0, 0b1111), (1.0 - 4.0 / 64.0) * 100.0);
    }

    #[test]
    fn test_dot_matches_naive_with_remainder() {
        let a: Vec<f32> = (0..21).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..21).map(|i| 1.0 - i as f32 * 0.1).collect();
        let naive: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot(&a, &b).unwrap() - naive).abs() < 1e-3);
        assert!(dot(&a, &b[..20]).is_none());
    }

    #[test]
    fn test_embedding_similarity_properties() {
        let v1 = unit(&[0.3, -1.2, 0.5, 2.0, 0.1, 0.0, -0.7, 0.9, 1.1]);
        let v2 = unit(&[1.0, 0.2, -0.5, 0.4, 0.3, 0.8, 0.1, -0.2, 0.0]);

        assert!((embedding_similarity(&v1, &v1) - 100.0).abs() < 1e-3);
        assert_eq!(embedding_similarity(&v1, &v2), embedding_similarity(&v2, &v1));

        let opposite: Vec<f32> = v1.iter().map(|x| -x).collect();
        assert!(embedding_similarity(&v1, &opposite).abs() < 1e-3);
    }

    #[test]
    fn test_mismatched_lengths_score_zero() {
        assert_eq!(embedding_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(embedding_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_normalize_leaves_zero_vector() {
        let mut zero = vec![0.0f32; 4];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0; 4]);

        let v = unit(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_record_precedence() {
        let e = unit(&[1.0, 2.0, 3.0]);

        let both = record(Some(e.clone()), Some(0));
        let other = record(Some(e.clone()), Some(u64::MAX));
        assert_eq!(
            score_records(&both, &other).map(|(_, basis)| basis),
            Some(ScoreBasis::Embedding)
        );

        let short = record(Some(vec![1.0]), Some(u64::MAX));
        let (score, basis) = score_records(&both, &short).unwrap();
        assert_eq!(basis, ScoreBasis::Hash);
        assert_eq!(score, 0.0);

        let bare = record(None, None);
        assert!(score_records(&both, &bare).is_none());
    }
}
