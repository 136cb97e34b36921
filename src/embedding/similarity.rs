use super::ScoredDocument;

/// Cosine similarity; mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

/// Descending score, ties broken by ascending document id, truncated to `k`.
/// NaN scores rank last.
pub fn rank(mut scored: Vec<ScoredDocument>, k: usize) -> Vec<ScoredDocument> {
    scored.sort_by(|a, b| {
        sort_key(b.score)
            .total_cmp(&sort_key(a.score))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    scored.truncate(k);
    scored
}

fn sort_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Document;

    fn approx_eq(left: f32, right: f32) -> bool {
        (left - right).abs() < 1e-5
    }

    fn scored(id: &str, score: f32) -> ScoredDocument {
        ScoredDocument {
            document: Document::new(id, "text"),
            score,
        }
    }

    #[test]
    fn cosine_is_one_for_identical_vectors() {
        let vec = vec![1.0, 2.0, 3.0, 4.0];
        assert!(approx_eq(cosine_similarity(&vec, &vec), 1.0));
    }

    #[test]
    fn cosine_is_zero_for_orthogonal_or_mismatched() {
        assert!(approx_eq(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert!(approx_eq(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0));
        assert!(approx_eq(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0));
    }

    #[test]
    fn rank_breaks_ties_by_id() {
        let ranked = rank(
            vec![scored("b", 0.5), scored("c", 0.9), scored("a", 0.5)],
            2,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.document.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn nan_scores_rank_last_without_panicking() {
        let ranked = rank(
            vec![
                scored("n2", f32::NAN),
                scored("low", -0.2),
                scored("n1", f32::NAN),
                scored("high", 0.7),
            ],
            4,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.document.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low", "n1", "n2"]);
    }
}
