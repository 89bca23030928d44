//! Shared value types
//!
//! [`Metadata`] is the typed key-value map attached to discovered URLs. The
//! recognized keys (version [`METADATA_SCHEMA_VERSION`]) are:
//!
//! | key                | type   | used by                                  |
//! |--------------------|--------|------------------------------------------|
//! | `title`            | string | keyword bonus, content-type detection    |
//! | `description`      | string | keyword bonus                            |
//! | `strategy_density` | number | content bonus                            |
//! | `content_type`     | string | content-type detection (`article_type`)  |
//!
//! Any other key is preserved verbatim in [`Metadata::extra`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version of the recognized metadata key set
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Typed metadata map with opaque passthrough for unknown keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Share of strategy-related vocabulary in the page, 0.0 - 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_density: Option<f64>,

    #[serde(default, alias = "article_type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Unrecognized keys
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_strategy_density(mut self, density: f64) -> Self {
        self.strategy_density = Some(density);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.strategy_density.is_none()
            && self.content_type.is_none()
            && self.extra.is_empty()
    }

    /// Lowercased title and description joined for keyword matching
    pub fn searchable_text(&self) -> String {
        let title = self.title.as_deref().unwrap_or_default();
        let description = self.description.as_deref().unwrap_or_default();
        format!("{title} {description}").to_lowercase()
    }

    /// Decode a stored metadata column, treating malformed JSON as empty
    pub fn from_stored(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed stored metadata");
                Self::default()
            }
        }
    }

    pub fn to_stored(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_keys_are_preserved() {
        let raw = r#"{"title":"Pairs trading","stars":42,"lang":"python"}"#;
        let meta: Metadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Pairs trading"));
        assert_eq!(meta.extra["stars"], serde_json::json!(42));

        let back: serde_json::Value = serde_json::from_str(&meta.to_stored()).unwrap();
        assert_eq!(back["lang"], "python");
        assert_eq!(back["title"], "Pairs trading");
    }

    #[test]
    fn test_article_type_alias() {
        let meta: Metadata = serde_json::from_str(r#"{"article_type":"tutorial"}"#).unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("tutorial"));
    }

    #[test]
    fn test_malformed_stored_metadata_is_empty() {
        assert!(Metadata::from_stored("{not json").is_empty());
        assert!(Metadata::from_stored("{}").is_empty());
    }

    #[test]
    fn test_searchable_text() {
        let meta = Metadata::default()
            .with_title("Momentum Strategy")
            .with_description("A Backtest");
        assert_eq!(meta.searchable_text(), "momentum strategy a backtest");
    }
}
