//! Category and base-priority inference for newly discovered URLs

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::domain_suffixes;

/// Category assigned when no domain rule matches
pub const DEFAULT_CATEGORY: &str = "general";

/// Base priority when no rule applies (1 = most urgent, 10 = least)
pub const DEFAULT_BASE_PRIORITY: u8 = 5;

const DOMAIN_CATEGORIES: &[(&str, &str)] = &[
    ("quantstart.com", "tutorial"),
    ("quantinsti.com", "education"),
    ("investopedia.com", "reference"),
    ("github.com", "code"),
    ("arxiv.org", "research"),
    ("medium.com", "blog"),
    ("towardsdatascience.com", "blog"),
];

const HIGH_QUALITY_DOMAINS: &[&str] = &[
    "quantstart.com",
    "quantinsti.com",
    "mit.edu",
    "stanford.edu",
    "arxiv.org",
];

const CODE_HOSTING_DOMAINS: &[&str] = &["github.com", "gitlab.com"];

/// Where a candidate URL came from
///
/// Legacy producer labels are folded into the canonical set; anything else
/// is kept verbatim as [`DiscoverySource::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DiscoverySource {
    Manual,
    ApiDiscovery,
    Feed,
    Sitemap,
    Search,
    Other(String),
}

impl DiscoverySource {
    /// Parse a producer label, `None` when it is blank
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        let source = match normalized.as_str() {
            "" => return None,
            "manual" | "operator" | "cli" => Self::Manual,
            "api-discovery" | "api" | "github" | "github-api" => Self::ApiDiscovery,
            "feed" | "rss" | "atom" | "rss-discovery" => Self::Feed,
            "sitemap" | "sitemap-discovery" => Self::Sitemap,
            "search" | "google-search" | "bing-search" | "web-search" => Self::Search,
            _ => Self::Other(normalized),
        };
        Some(source)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Manual => "manual",
            Self::ApiDiscovery => "api-discovery",
            Self::Feed => "feed",
            Self::Sitemap => "sitemap",
            Self::Search => "search",
            Self::Other(label) => label,
        }
    }

    /// Unattended bulk producers rank below curated discovery
    fn is_bulk(&self) -> bool {
        match self {
            Self::Feed => true,
            Self::Other(label) => label == "automated",
            _ => false,
        }
    }
}

impl From<String> for DiscoverySource {
    fn from(raw: String) -> Self {
        Self::parse(&raw).unwrap_or_else(|| Self::Other(String::from("unknown")))
    }
}

impl From<DiscoverySource> for String {
    fn from(source: DiscoverySource) -> Self {
        source.as_str().to_string()
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn matches_any(host: &str, domains: &[&str]) -> bool {
    domain_suffixes(host).any(|suffix| domains.contains(&suffix))
}

/// Category for a host, matched on the host or any parent domain
pub fn infer_category(host: &str) -> &'static str {
    let host = host.to_ascii_lowercase();
    let category = domain_suffixes(&host)
        .find_map(|suffix| {
            DOMAIN_CATEGORIES
                .iter()
                .find(|(domain, _)| *domain == suffix)
                .map(|(_, category)| *category)
        })
        .unwrap_or(DEFAULT_CATEGORY);
    category
}

/// Base priority for a host and source (1 = most urgent)
pub fn infer_base_priority(source: &DiscoverySource, host: &str) -> u8 {
    let host = host.to_ascii_lowercase();
    if *source == DiscoverySource::Manual {
        2
    } else if matches_any(&host, HIGH_QUALITY_DOMAINS) {
        3
    } else if matches_any(&host, CODE_HOSTING_DOMAINS) {
        4
    } else if source.is_bulk() {
        6
    } else {
        DEFAULT_BASE_PRIORITY
    }
}
