//! Pluggable string similarity strategies
//!
//! With the `fast-similarity` feature (default) the detector binds a
//! normalized Levenshtein ratio backed by `strsim`. Without it the word-set
//! Jaccard fallback is bound instead, so the detector always has a strategy.

use std::collections::HashSet;

/// Similarity on a 0-100 scale, 100 meaning identical
pub trait SimilarityStrategy: Send + Sync {
    /// Short identifier for logs and reports
    fn name(&self) -> &'static str;

    /// Similarity of `a` and `b` in `[0, 100]`
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Character edit-distance ratio
#[cfg(feature = "fast-similarity")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinRatio;

#[cfg(feature = "fast-similarity")]
impl SimilarityStrategy for LevenshteinRatio {
    fn name(&self) -> &'static str {
        "levenshtein-ratio"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        (strsim::normalized_levenshtein(a, b) * 100.0).clamp(0.0, 100.0)
    }
}

/// Word-set Jaccard similarity (case-insensitive, whitespace tokenized)
#[derive(Debug, Clone, Copy, Default)]
pub struct JaccardSimilarity;

impl SimilarityStrategy for JaccardSimilarity {
    fn name(&self) -> &'static str {
        "jaccard"
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a_lower = a.to_lowercase();
        let b_lower = b.to_lowercase();
        let words_a: HashSet<&str> = a_lower.split_whitespace().collect();
        let words_b: HashSet<&str> = b_lower.split_whitespace().collect();

        match (words_a.is_empty(), words_b.is_empty()) {
            (true, true) => return 100.0,
            (true, false) | (false, true) => return 0.0,
            _ => {}
        }

        let intersection = words_a.intersection(&words_b).count();
        let union = words_a.union(&words_b).count();
        intersection as f64 / union as f64 * 100.0
    }
}

/// Strategy selected for this build
pub fn default_strategy() -> Box<dyn SimilarityStrategy> {
    #[cfg(feature = "fast-similarity")]
    {
        Box::new(LevenshteinRatio)
    }
    #[cfg(not(feature = "fast-similarity"))]
    {
        Box::new(JaccardSimilarity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard_edge_cases() {
        let j = JaccardSimilarity;
        assert_eq!(j.similarity("", ""), 100.0);
        assert_eq!(j.similarity("alpha", ""), 0.0);
        assert_eq!(j.similarity("", "   "), 100.0);
    }

    #[test]
    fn test_jaccard_overlap() {
        let j = JaccardSimilarity;
        // {a, b, c} vs {b, c, d}: 2 shared of 4
        assert!((j.similarity("a b c", "B C D") - 50.0).abs() < 1e-9);
    }

    #[cfg(feature = "fast-similarity")]
    #[test]
    fn test_levenshtein_ratio() {
        let l = LevenshteinRatio;
        assert_eq!(l.similarity("kitten", "kitten"), 100.0);
        let s = l.similarity("kitten", "sitting");
        assert!(s > 50.0 && s < 100.0);
        assert_eq!(default_strategy().name(), "levenshtein-ratio");
    }

    #[cfg(not(feature = "fast-similarity"))]
    #[test]
    fn test_fallback_bound() {
        assert_eq!(default_strategy().name(), "jaccard");
    }
}
