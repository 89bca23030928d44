//! Content change detection
//!
//! Decides whether previously seen content changed, from the cheapest
//! signal to the most expensive one:
//!
//! 1. HTTP metadata (ETag, Last-Modified, Content-Length)
//! 2. Normalized content hash
//! 3. Similarity of the content itself
//!
//! Nothing here touches storage. Probe failures fail open: the content is
//! reported as changed so the pipeline re-fetches rather than stalls.

pub mod similarity;

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::utils::{normalize_whitespace, truncate_chars};

pub use similarity::{default_strategy, JaccardSimilarity, SimilarityStrategy};

#[cfg(feature = "fast-similarity")]
pub use similarity::LevenshteinRatio;

/// Characters of each input considered by [`ChangeDetector::similarity_score`]
pub const SIMILARITY_SAMPLE_CHARS: usize = 1000;

/// Vocabulary that nudges [`ChangeDetector::estimate_quality`] upward
const QUALITY_TERMS: &[&str] = &[
    "analysis",
    "research",
    "study",
    "conclusion",
    "methodology",
    "algorithm",
    "strategy",
    "implementation",
    "framework",
];

// ============================================================================
// Types
// ============================================================================

/// HTTP metadata captured for a fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<u64>,
    /// Content hash of the fetched body, if it was fetched
    pub content_hash: Option<String>,
}

impl HttpMeta {
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, value: impl Into<String>) -> Self {
        self.last_modified = Some(value.into());
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

/// Why a verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeReason {
    EtagChanged,
    LastModifiedChanged,
    ContentLengthChanged,
    HeadersUnchanged,
    HashChanged,
    HashUnchanged,
    /// Neither headers nor hashes were available on both sides
    NoSignal,
    ProbeFailed,
    Identical,
    NewContent,
    LengthDelta,
    SimilarityBelowThreshold,
    WithinThreshold,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EtagChanged => "etag-changed",
            Self::LastModifiedChanged => "last-modified-changed",
            Self::ContentLengthChanged => "content-length-changed",
            Self::HeadersUnchanged => "headers-unchanged",
            Self::HashChanged => "hash-changed",
            Self::HashUnchanged => "hash-unchanged",
            Self::NoSignal => "no-signal",
            Self::ProbeFailed => "probe-failed",
            Self::Identical => "identical",
            Self::NewContent => "new-content",
            Self::LengthDelta => "length-delta",
            Self::SimilarityBelowThreshold => "similarity-below-threshold",
            Self::WithinThreshold => "within-threshold",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a change check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeVerdict {
    pub changed: bool,
    pub reason: ChangeReason,
}

impl ChangeVerdict {
    fn changed(reason: ChangeReason) -> Self {
        Self {
            changed: true,
            reason,
        }
    }

    fn unchanged(reason: ChangeReason) -> Self {
        Self {
            changed: false,
            reason,
        }
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Stateless change detector with a similarity strategy bound at construction
pub struct ChangeDetector {
    strategy: Box<dyn SimilarityStrategy>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl ChangeDetector {
    /// Detector bound to the best strategy available in this build
    pub fn new() -> Self {
        let strategy = default_strategy();
        tracing::debug!(strategy = strategy.name(), "Change detector initialized");
        Self { strategy }
    }

    pub fn with_strategy(strategy: Box<dyn SimilarityStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// SHA-256 (lowercase hex) of the normalized content
    pub fn hash(content: &str) -> String {
        let cleaned = normalize_for_hash(content);
        let digest = Sha256::digest(cleaned.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Compare HTTP metadata of two fetches
    ///
    /// ETag, Last-Modified and Content-Length are compared in that order,
    /// only where both sides carry a value; the first mismatch wins. If no
    /// pair is comparable the content hashes decide, and with no hashes
    /// either the content is assumed changed.
    pub fn headers_changed(&self, old: &HttpMeta, new: &HttpMeta) -> ChangeVerdict {
        let mut compared = false;

        if let (Some(a), Some(b)) = (&old.etag, &new.etag) {
            compared = true;
            if a != b {
                return ChangeVerdict::changed(ChangeReason::EtagChanged);
            }
        }
        if let (Some(a), Some(b)) = (&old.last_modified, &new.last_modified) {
            compared = true;
            if a != b {
                return ChangeVerdict::changed(ChangeReason::LastModifiedChanged);
            }
        }
        if let (Some(a), Some(b)) = (old.content_length, new.content_length) {
            compared = true;
            if a != b {
                return ChangeVerdict::changed(ChangeReason::ContentLengthChanged);
            }
        }
        if compared {
            return ChangeVerdict::unchanged(ChangeReason::HeadersUnchanged);
        }

        match (&old.content_hash, &new.content_hash) {
            (Some(a), Some(b)) if a == b => ChangeVerdict::unchanged(ChangeReason::HashUnchanged),
            (Some(_), Some(_)) => ChangeVerdict::changed(ChangeReason::HashChanged),
            _ => ChangeVerdict::changed(ChangeReason::NoSignal),
        }
    }

    /// [`headers_changed`](Self::headers_changed) for a probe that may have failed
    pub fn headers_changed_probe<E: fmt::Display>(
        &self,
        old: &HttpMeta,
        probe: std::result::Result<HttpMeta, E>,
    ) -> ChangeVerdict {
        match probe {
            Ok(new) => self.headers_changed(old, &new),
            Err(e) => {
                tracing::warn!(error = %e, "Metadata probe failed, assuming content changed");
                ChangeVerdict::changed(ChangeReason::ProbeFailed)
            }
        }
    }

    /// Similarity of two documents on a 0-100 scale
    pub fn similarity_score(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 100.0;
        }
        let a = truncate_chars(a, SIMILARITY_SAMPLE_CHARS);
        let b = truncate_chars(b, SIMILARITY_SAMPLE_CHARS);
        self.strategy.similarity(a, b).clamp(0.0, 100.0)
    }

    /// Whether `new` differs from `old` by more than `threshold` (0.0 - 1.0)
    pub fn semantic_change(&self, old: &str, new: &str, threshold: f64) -> ChangeVerdict {
        if old == new {
            return ChangeVerdict::unchanged(ChangeReason::Identical);
        }

        let old_len = old.chars().count();
        if old_len == 0 {
            return ChangeVerdict::changed(ChangeReason::NewContent);
        }

        let new_len = new.chars().count();
        let length_delta = old_len.abs_diff(new_len) as f64 / old_len as f64;
        if length_delta > threshold {
            tracing::debug!(length_delta, threshold, "Length delta exceeds threshold");
            return ChangeVerdict::changed(ChangeReason::LengthDelta);
        }

        let similarity = self.similarity_score(old, new);
        if 1.0 - similarity / 100.0 > threshold {
            tracing::debug!(similarity, threshold, "Similarity below threshold");
            return ChangeVerdict::changed(ChangeReason::SimilarityBelowThreshold);
        }

        ChangeVerdict::unchanged(ChangeReason::WithinThreshold)
    }

    /// Advisory 0-100 quality heuristic
    pub fn estimate_quality(content: &str) -> u8 {
        if content.trim().is_empty() {
            return 0;
        }

        let mut score: i32 = 50;

        let length = content.chars().count();
        score += match length {
            l if l > 1000 => 20,
            l if l > 500 => 10,
            l if l < 100 => -20,
            _ => 0,
        };

        let words: Vec<&str> = content.split_whitespace().collect();
        score += match words.len() {
            w if w > 200 => 15,
            w if w > 100 => 10,
            w if w < 20 => -15,
            _ => 0,
        };

        let sentences = content.split('.').count();
        score += match sentences {
            s if s > 5 => 10,
            s if s < 2 => -10,
            _ => 0,
        };

        let lower = content.to_lowercase();
        let term_hits = QUALITY_TERMS.iter().filter(|t| lower.contains(*t)).count() as i32;
        score += (term_hits * 5).min(15);

        let unique: HashSet<&str> = lower.split_whitespace().collect();
        let unique_ratio = unique.len() as f64 / words.len() as f64;
        if unique_ratio < 0.3 {
            score -= 20;
        } else if unique_ratio > 0.7 {
            score += 10;
        }

        score.clamp(0, 100) as u8
    }
}

/// Strip volatile boilerplate so semantically equal pages hash equally
fn normalize_for_hash(content: &str) -> String {
    static VOLATILE: OnceLock<Vec<Regex>> = OnceLock::new();

    let patterns = VOLATILE.get_or_init(|| {
        [
            // ISO datetimes, optional fraction and offset
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            r"\b\d{4}-\d{2}-\d{2}\b",
            r"\b\d{1,2}/\d{1,2}/\d{4}\b",
            r#"data-[\w-]+="[^"]*""#,
            r#"\bid="[^"]*""#,
        ]
        .iter()
        .map(|p| Regex::new(p).expect("Invalid regex pattern"))
        .collect()
    });

    let mut text = normalize_whitespace(content);
    for re in patterns {
        text = re.replace_all(&text, "").into_owned();
    }
    normalize_whitespace(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = ChangeDetector::hash("hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(h, ChangeDetector::hash("hello"));
    }

    #[test]
    fn test_hash_ignores_volatile_fields() {
        let a = r#"<div id="x1" data-track="abc">Posted 2024-01-02T10:00:00Z on 1/2/2024  body</div>"#;
        let b = r#"<div id="y9" data-track="zzz">Posted 2025-06-30T23:59:59.123+02:00 on 12/31/2025 body</div>"#;
        assert_eq!(ChangeDetector::hash(a), ChangeDetector::hash(b));
        assert_ne!(ChangeDetector::hash(a), ChangeDetector::hash("Posted body changed"));
    }

    #[test]
    fn test_hash_collapses_whitespace() {
        assert_eq!(
            ChangeDetector::hash("a   b\n\tc"),
            ChangeDetector::hash(" a b c ")
        );
    }

    #[test]
    fn test_headers_priority_order() {
        let d = ChangeDetector::new();
        let old = HttpMeta::default()
            .with_etag("v1")
            .with_last_modified("Mon")
            .with_content_length(10);

        let new = old.clone().with_etag("v2").with_content_length(20);
        assert_eq!(d.headers_changed(&old, &new).reason, ChangeReason::EtagChanged);

        let new = old.clone().with_last_modified("Tue").with_content_length(20);
        assert_eq!(
            d.headers_changed(&old, &new).reason,
            ChangeReason::LastModifiedChanged
        );

        let verdict = d.headers_changed(&old, &old.clone());
        assert!(!verdict.changed);
        assert_eq!(verdict.reason, ChangeReason::HeadersUnchanged);
    }

    #[test]
    fn test_headers_fall_back_to_hash() {
        let d = ChangeDetector::new();
        let old = HttpMeta::default().with_etag("v1").with_hash("aaa");
        let new = HttpMeta::default().with_last_modified("Tue").with_hash("aaa");
        assert_eq!(d.headers_changed(&old, &new).reason, ChangeReason::HashUnchanged);

        let new = HttpMeta::default().with_hash("bbb");
        assert!(d.headers_changed(&old, &new).changed);

        let verdict = d.headers_changed(&HttpMeta::default(), &HttpMeta::default());
        assert!(verdict.changed);
        assert_eq!(verdict.reason, ChangeReason::NoSignal);
    }

    #[test]
    fn test_probe_failure_fails_open() {
        let d = ChangeDetector::new();
        let verdict = d.headers_changed_probe(&HttpMeta::default(), Err::<HttpMeta, _>("timeout"));
        assert!(verdict.changed);
        assert_eq!(verdict.reason, ChangeReason::ProbeFailed);
    }

    #[test]
    fn test_similarity_short_circuit_and_bounds() {
        let d = ChangeDetector::with_strategy(Box::new(JaccardSimilarity));
        assert_eq!(d.similarity_score("same text", "same text"), 100.0);
        let s = d.similarity_score("one two three", "four five six");
        assert_eq!(s, 0.0);
        assert_eq!(d.strategy_name(), "jaccard");
    }

    #[test]
    fn test_similarity_uses_bounded_sample() {
        let d = ChangeDetector::with_strategy(Box::new(JaccardSimilarity));
        let prefix = "word ".repeat(300);
        let a = format!("{prefix}tail-one");
        let b = format!("{prefix}tail-two");
        // Tails fall outside the sample
        assert_eq!(d.similarity_score(&a, &b), 100.0);
    }

    #[test]
    fn test_semantic_change() {
        let d = ChangeDetector::with_strategy(Box::new(JaccardSimilarity));
        assert_eq!(d.semantic_change("abc", "abc", 0.1).reason, ChangeReason::Identical);
        assert_eq!(d.semantic_change("", "new", 0.1).reason, ChangeReason::NewContent);
        assert_eq!(
            d.semantic_change("short", "a much longer replacement", 0.1).reason,
            ChangeReason::LengthDelta
        );
        assert_eq!(
            d.semantic_change("alpha beta gamma", "delta omega sigma", 0.1).reason,
            ChangeReason::SimilarityBelowThreshold
        );
        let verdict = d.semantic_change("alpha beta gamma", "gamma beta alpha", 0.1);
        assert!(!verdict.changed);
    }

    #[test]
    fn test_estimate_quality_bounds() {
        assert_eq!(ChangeDetector::estimate_quality(""), 0);
        assert_eq!(ChangeDetector::estimate_quality("   "), 0);

        let spam = "buy ".repeat(500);
        let rich = (0..300)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ")
            + ". Analysis. Research. Methodology. Conclusion. Strategy. End.";
        let spam_score = ChangeDetector::estimate_quality(&spam);
        let rich_score = ChangeDetector::estimate_quality(&rich);
        assert!(rich_score > spam_score);
        assert!(rich_score <= 100);
    }

    #[test]
    fn test_estimate_quality_exact() {
        // 11 chars: -20, 2 words: -15, 1 sentence: -10, unique ratio 1.0: +10
        assert_eq!(ChangeDetector::estimate_quality("hello world"), 15);
    }
}
