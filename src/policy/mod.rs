//! Refresh policies: how long to wait before re-checking a URL
//!
//! The interval is a pure function of two lookup tables (site and content
//! type) plus the page's quality score and observed change frequency. The
//! tables are seeded with defaults, can be overlaid from a JSON document on
//! disk, and are mutable at runtime through [`RefreshPolicyManager::update_policy`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Metadata;
use crate::tracker::UrlTracker;
use crate::utils::{domain_suffixes, site_of, truncate_chars};

/// Global fallback interval in days
pub const DEFAULT_REFRESH_DAYS: u32 = 30;

/// Upper bound for lengthening recommendations
pub const MAX_RECOMMENDED_DAYS: u32 = 90;

/// Content type returned when no rule matches
pub const DEFAULT_CONTENT_TYPE: &str = "article";

const DEFAULT_SITE_POLICIES: &[(&str, u32)] = &[
    ("quantstart.com", 90),
    ("investopedia.com", 30),
    ("blog.quantinsti.com", 7),
    ("quantinsti.com", 14),
    ("reddit.com", 1),
    ("news.ycombinator.com", 1),
    ("stackoverflow.com", 30),
    ("github.com", 7),
    ("arxiv.org", 180),
    ("wikipedia.org", 30),
    ("medium.com", 14),
    ("towardsdatascience.com", 14),
];

const DEFAULT_CONTENT_TYPE_POLICIES: &[(&str, u32)] = &[
    ("tutorial", 90),
    ("documentation", 60),
    ("guide", 60),
    ("reference", 180),
    ("news", 1),
    ("blog", 7),
    ("article", 14),
    ("paper", 180),
    ("discussion", 3),
    ("forum", 3),
    ("code", 14),
    ("api", 30),
    ("changelog", 7),
    ("release", 30),
    ("unknown", 30),
];

/// Change-frequency bands: (changes per day strictly above, interval cap in days)
const FREQUENCY_BANDS: &[(f64, u32)] = &[(1.0, 1), (0.5, 2), (0.2, 5), (0.1, 10), (0.03, 30)];

// ============================================================================
// Tables
// ============================================================================

/// The two lookup tables plus the global default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTables {
    pub default_days: u32,
    pub site_policies: BTreeMap<String, u32>,
    pub content_type_policies: BTreeMap<String, u32>,
}

impl Default for PolicyTables {
    fn default() -> Self {
        Self {
            default_days: DEFAULT_REFRESH_DAYS,
            site_policies: DEFAULT_SITE_POLICIES
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            content_type_policies: DEFAULT_CONTENT_TYPE_POLICIES
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }
}

impl PolicyTables {
    /// Site policy for a host, walking up parent domains; the matched key is returned
    pub fn site_policy(&self, host: &str) -> Option<(&str, u32)> {
        domain_suffixes(host).find_map(|candidate| {
            self.site_policies
                .get_key_value(candidate)
                .map(|(k, v)| (k.as_str(), *v))
        })
    }

    /// Site policy or the global default
    pub fn site_days(&self, host: &str) -> u32 {
        self.site_policy(host)
            .map(|(_, days)| days)
            .unwrap_or(self.default_days)
    }
}

/// Which table entry an update targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyTarget {
    Site(String),
    ContentType(String),
    Default,
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Site(s) => write!(f, "site:{s}"),
            Self::ContentType(c) => write!(f, "content-type:{c}"),
            Self::Default => f.write_str("default"),
        }
    }
}

/// Computed interval plus the contribution of each step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshInterval {
    pub days: u32,
    pub trail: Vec<String>,
}

impl RefreshInterval {
    pub fn reason_trail(&self) -> String {
        self.trail.join(" | ")
    }
}

/// Shortening recommendation for a site whose pages change faster than its policy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteAdjustment {
    pub current: u32,
    pub recommended: u32,
    pub days_per_change: f64,
    pub example_url: String,
}

/// Lengthening recommendation for a site whose crawls are mostly unique
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RarelyChangingSite {
    pub site: String,
    pub current: u32,
    pub recommended: u32,
    pub unique_crawl_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyRecommendations {
    pub site_adjustments: BTreeMap<String, SiteAdjustment>,
    pub rarely_changing: Vec<RarelyChangingSite>,
    pub generated_at: DateTime<Utc>,
}

/// Aggregate of intervals handed out since startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyUsageSummary {
    pub distinct_keys: usize,
    pub lookups: u64,
    pub average_interval: f64,
    pub interval_histogram: BTreeMap<u32, u64>,
}

/// On-disk document
#[derive(Debug, Serialize, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    default_days: Option<u32>,
    #[serde(default)]
    site_policies: BTreeMap<String, u32>,
    #[serde(default)]
    content_type_policies: BTreeMap<String, u32>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    usage_summary: Option<PolicyUsageSummary>,
}

// ============================================================================
// Manager
// ============================================================================

/// Holds the policy tables and computes refresh intervals
pub struct RefreshPolicyManager {
    tables: RwLock<PolicyTables>,
    path: Option<PathBuf>,
    usage: Mutex<HashMap<String, Vec<u32>>>,
}

impl RefreshPolicyManager {
    pub fn new(tables: PolicyTables) -> Self {
        Self {
            tables: RwLock::new(tables),
            path: None,
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PolicyTables::default())
    }

    /// Defaults overlaid with the document at `path`; updates persist there
    ///
    /// A missing file is not an error. A malformed one is, so a later save
    /// cannot silently overwrite operator edits.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut tables = PolicyTables::default();

        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let doc: PolicyDocument = serde_json::from_str(&raw).map_err(|e| {
                Error::config(format!("invalid policy file {}: {e}", path.display()))
            })?;
            if let Some(days) = doc.default_days {
                tables.default_days = days.max(1);
            }
            tables.site_policies.extend(doc.site_policies);
            tables.content_type_policies.extend(doc.content_type_policies);
            tracing::info!(path = %path.display(), "Loaded refresh policies");
        } else {
            tracing::debug!(path = %path.display(), "No policy file, using defaults");
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            ..Self::new(tables)
        })
    }

    /// Copy of the current tables
    pub fn snapshot(&self) -> PolicyTables {
        match self.tables.read() {
            Ok(t) => t.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Refresh interval in days for `url`, with a reason per step
    ///
    /// 1. site policy (parent domains included) or the global default
    /// 2. minimum with the content-type policy
    /// 3. quality adjustment
    /// 4. change-frequency adjustment, replacing step 3's output
    /// 5. floor at one day
    pub fn get_refresh_interval(
        &self,
        url: &str,
        content_type: Option<&str>,
        quality_score: Option<u8>,
        changes_per_day: Option<f64>,
    ) -> RefreshInterval {
        let tables = self.snapshot();
        let host = site_of(url);
        let mut trail = Vec::with_capacity(4);

        let site_days = match tables.site_policy(&host) {
            Some((key, days)) => {
                trail.push(format!("site:{key}={days}"));
                days
            }
            None => {
                trail.push(format!("site:default={}", tables.default_days));
                tables.default_days
            }
        };

        let mut days = site_days;
        if let Some(ct) = content_type {
            let ct = ct.to_ascii_lowercase();
            match tables.content_type_policies.get(&ct) {
                Some(&ct_days) => {
                    days = days.min(ct_days);
                    trail.push(format!("content-type:{ct}={ct_days} -> {days}"));
                }
                None => trail.push(format!("content-type:{ct}=unlisted")),
            }
        }

        let quality_adjusted = apply_quality(days, quality_score);
        if let (Some(q), true) = (quality_score, quality_adjusted != days) {
            trail.push(format!("quality:{q} -> {quality_adjusted}"));
        }

        let mut final_days = quality_adjusted;
        if let Some(freq) = changes_per_day {
            let freq = if freq.is_finite() { freq.max(0.0) } else { 0.0 };
            let frequency_adjusted = apply_frequency(quality_adjusted, freq);
            if frequency_adjusted != quality_adjusted {
                trail.push(format!("frequency:{freq:.3}/day -> {frequency_adjusted}"));
            }
            final_days = frequency_adjusted;
        }

        if final_days < 1 {
            trail.push(String::from("floor -> 1"));
            final_days = 1;
        }

        self.track_usage(&host, content_type, final_days);
        RefreshInterval {
            days: final_days,
            trail,
        }
    }

    /// Best-effort content type from URL, title, body and metadata; never empty
    pub fn detect_content_type(
        &self,
        url: &str,
        title: Option<&str>,
        content: Option<&str>,
        metadata: Option<&Metadata>,
    ) -> String {
        detect_content_type(url, title, content, metadata)
    }

    /// Set a table entry and persist the tables when backed by a file
    pub fn update_policy(&self, target: PolicyTarget, days: u32) -> Result<()> {
        if days < 1 {
            return Err(Error::invalid("days", "refresh interval must be at least 1 day"));
        }
        {
            let mut tables = self
                .tables
                .write()
                .map_err(|_| Error::LockPoisoned("policy tables"))?;
            match &target {
                PolicyTarget::Site(site) => {
                    tables
                        .site_policies
                        .insert(normalize_key(site, true), days);
                }
                PolicyTarget::ContentType(ct) => {
                    tables
                        .content_type_policies
                        .insert(normalize_key(ct, false), days);
                }
                PolicyTarget::Default => tables.default_days = days,
            }
        }
        tracing::info!(target = %target, days, "Refresh policy updated");
        self.persist()
    }

    /// Remove a table entry; `true` if it existed
    pub fn remove_policy(&self, target: PolicyTarget) -> Result<bool> {
        let removed = {
            let mut tables = self
                .tables
                .write()
                .map_err(|_| Error::LockPoisoned("policy tables"))?;
            match &target {
                PolicyTarget::Site(site) => tables
                    .site_policies
                    .remove(&normalize_key(site, true))
                    .is_some(),
                PolicyTarget::ContentType(ct) => tables
                    .content_type_policies
                    .remove(&normalize_key(ct, false))
                    .is_some(),
                PolicyTarget::Default => {
                    return Err(Error::invalid("target", "the default policy cannot be removed"))
                }
            }
        };
        if removed {
            tracing::info!(target = %target, "Refresh policy removed");
            self.persist()?;
        }
        Ok(removed)
    }

    /// Suggest table changes from the tracker's crawl history
    pub fn recommendations(&self, tracker: &UrlTracker) -> Result<PolicyRecommendations> {
        let tables = self.snapshot();
        let mut site_adjustments = BTreeMap::new();

        for changing in tracker.frequently_changing_urls(50)? {
            let current = tables.site_days(&changing.site);
            if changing.days_per_change < f64::from(current) * 0.5 {
                let recommended = ((changing.days_per_change * 1.5) as u32).max(1);
                // Fastest-changing URL of the site comes first and wins
                site_adjustments
                    .entry(changing.site.clone())
                    .or_insert(SiteAdjustment {
                        current,
                        recommended,
                        days_per_change: changing.days_per_change,
                        example_url: changing.url.clone(),
                    });
            }
        }

        let mut rarely_changing = Vec::new();
        for stats in tracker.site_stats(None)? {
            if stats.unique_crawl_ratio > 0.9 {
                let current = tables.site_days(&stats.site);
                let recommended = MAX_RECOMMENDED_DAYS.min((f64::from(current) * 1.5) as u32);
                if recommended > current {
                    rarely_changing.push(RarelyChangingSite {
                        site: stats.site,
                        current,
                        recommended,
                        unique_crawl_ratio: stats.unique_crawl_ratio,
                    });
                }
            }
        }

        Ok(PolicyRecommendations {
            site_adjustments,
            rarely_changing,
            generated_at: Utc::now(),
        })
    }

    /// Summary of intervals computed since startup
    pub fn usage_summary(&self) -> PolicyUsageSummary {
        let usage = match self.usage.lock() {
            Ok(u) => u,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut summary = PolicyUsageSummary {
            distinct_keys: usage.len(),
            ..Default::default()
        };
        let mut total: u64 = 0;
        for intervals in usage.values() {
            for &days in intervals {
                summary.lookups += 1;
                total += u64::from(days);
                *summary.interval_histogram.entry(days).or_insert(0) += 1;
            }
        }
        if summary.lookups > 0 {
            summary.average_interval = total as f64 / summary.lookups as f64;
        }
        summary
    }

    /// Write the tables to the backing file, if any
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tables = self.snapshot();
        let doc = PolicyDocument {
            default_days: Some(tables.default_days),
            site_policies: tables.site_policies,
            content_type_policies: tables.content_type_policies,
            last_updated: Some(Utc::now()),
            usage_summary: Some(self.usage_summary()),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write to temp file first, then rename (atomic)
        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &doc)?;
        writer.flush()?;
        fs::rename(&temp_path, path)?;

        tracing::info!(path = %path.display(), "Saved refresh policies");
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if self.path.is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn track_usage(&self, site: &str, content_type: Option<&str>, days: u32) {
        const MAX_SAMPLES_PER_KEY: usize = 1000;

        let Ok(mut usage) = self.usage.lock() else {
            return;
        };
        let key = format!("{site}:{}", content_type.unwrap_or("unknown"));
        let samples = usage.entry(key).or_default();
        samples.push(days);
        if samples.len() > MAX_SAMPLES_PER_KEY {
            let excess = samples.len() - MAX_SAMPLES_PER_KEY;
            samples.drain(..excess);
        }
    }
}

fn normalize_key(raw: &str, is_site: bool) -> String {
    let key = raw.trim().to_ascii_lowercase();
    if is_site {
        key.strip_prefix("www.").map(str::to_string).unwrap_or(key)
    } else {
        key
    }
}

fn apply_quality(days: u32, quality: Option<u8>) -> u32 {
    let Some(q) = quality else {
        return days;
    };
    let scaled = |factor: f64| (f64::from(days) * factor) as u32;
    match q {
        q if q >= 80 => scaled(0.8).max(1),
        q if q >= 60 => scaled(0.9).max(1),
        q if q <= 20 => scaled(1.5),
        q if q <= 40 => scaled(1.25),
        _ => days,
    }
}

/// Frequency bands cap the interval; below every band the interval grows by half
///
/// A matching band does not replace the interval outright: the band value is
/// an upper bound on the grown interval. With a 7 day base and 0.05
/// changes/day the result is 10, not the band's 30, so the result never
/// rises as the observed change frequency rises.
fn apply_frequency(days: u32, changes_per_day: f64) -> u32 {
    let grown = (f64::from(days) * 1.5) as u32;
    FREQUENCY_BANDS
        .iter()
        .find(|(above, _)| changes_per_day > *above)
        .map_or(grown, |(_, cap)| (*cap).min(grown))
}

fn detect_content_type(
    url: &str,
    title: Option<&str>,
    content: Option<&str>,
    metadata: Option<&Metadata>,
) -> String {
    let url_lower = url.to_lowercase();
    let title_lower = title
        .or_else(|| metadata.and_then(|m| m.title.as_deref()))
        .unwrap_or_default()
        .to_lowercase();

    if has(&["/blog/", "/news/", "/articles/"], &url_lower) {
        return if has(&["tutorial", "guide"], &title_lower) {
            "tutorial"
        } else if title_lower.contains("news") || url_lower.contains("/news/") {
            "news"
        } else {
            "blog"
        }
        .to_string();
    }
    if has(&["/docs/", "/documentation/", "/api/"], &url_lower) {
        return "documentation".to_string();
    }
    if has(&["/forum/", "/discussion/", "/reddit"], &url_lower) {
        return "discussion".to_string();
    }
    if has(&["/releases/", "/changelog/", "/changes/"], &url_lower) {
        return "changelog".to_string();
    }
    if has(&["github.com", "gitlab.com"], &url_lower) {
        return "code".to_string();
    }
    if url_lower.contains("arxiv.org") || title_lower.contains("paper") {
        return "paper".to_string();
    }

    if !title_lower.is_empty() {
        let by_title = if has(&["tutorial", "guide", "how to", "step by step"], &title_lower) {
            Some("tutorial")
        } else if has(&["news", "breaking", "update", "announcement"], &title_lower) {
            Some("news")
        } else if has(&["reference", "api", "documentation"], &title_lower) {
            Some("reference")
        } else if has(&["discussion", "forum", "comment"], &title_lower) {
            Some("discussion")
        } else {
            None
        };
        if let Some(ct) = by_title {
            return ct.to_string();
        }
    }

    if let Some(body) = content {
        let sample = truncate_chars(body, 1000).to_lowercase();
        let tutorial = tally(&sample, &["step", "tutorial", "example"]);
        let news = tally(&sample, &["today", "yesterday", "breaking"]);
        let reference = tally(&sample, &["api", "reference", "documentation"]);
        let best = tutorial.max(news).max(reference);
        if best > 0 {
            return if tutorial == best {
                "tutorial"
            } else if news == best {
                "news"
            } else {
                "reference"
            }
            .to_string();
        }
    }

    if let Some(ct) = metadata
        .and_then(|m| m.content_type.as_deref())
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
    {
        return ct.to_lowercase();
    }

    DEFAULT_CONTENT_TYPE.to_string()
}

fn has(needles: &[&str], hay: &str) -> bool {
    needles.iter().any(|n| hay.contains(n))
}

fn tally(sample: &str, words: &[&str]) -> usize {
    words.iter().map(|w| sample.matches(w).count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::tracker::CrawlOutcome;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager() -> RefreshPolicyManager {
        RefreshPolicyManager::with_defaults()
    }

    #[test]
    fn test_site_then_content_type_minimum() {
        let m = manager();
        let r = m.get_refresh_interval("https://www.quantstart.com/articles/x", Some("blog"), None, None);
        assert_eq!(r.days, 7);
        assert_eq!(r.trail[0], "site:quantstart.com=90");
        assert!(r.reason_trail().contains("content-type:blog=7"));
    }

    #[test]
    fn test_unknown_site_uses_default() {
        let m = manager();
        let r = m.get_refresh_interval("https://unknown.example/x", None, None, None);
        assert_eq!(r.days, DEFAULT_REFRESH_DAYS);
        assert_eq!(r.trail, vec!["site:default=30".to_string()]);
    }

    #[test]
    fn test_parent_domain_lookup() {
        let m = manager();
        let r = m.get_refresh_interval("https://en.wikipedia.org/wiki/Alpha", None, None, None);
        assert_eq!(r.trail[0], "site:wikipedia.org=30");
        let r = m.get_refresh_interval("https://blog.quantinsti.com/post", None, None, None);
        assert_eq!(r.days, 7);
    }

    #[test]
    fn test_quality_adjustment() {
        assert_eq!(apply_quality(30, Some(90)), 24);
        assert_eq!(apply_quality(30, Some(65)), 27);
        assert_eq!(apply_quality(30, Some(50)), 30);
        assert_eq!(apply_quality(30, Some(35)), 37);
        assert_eq!(apply_quality(30, Some(10)), 45);
        assert_eq!(apply_quality(1, Some(95)), 1);
        assert_eq!(apply_quality(30, None), 30);
    }

    #[test]
    fn test_frequency_adjustment() {
        assert_eq!(apply_frequency(30, 2.0), 1);
        assert_eq!(apply_frequency(30, 0.6), 2);
        assert_eq!(apply_frequency(30, 0.3), 5);
        assert_eq!(apply_frequency(30, 0.15), 10);
        assert_eq!(apply_frequency(30, 0.05), 30);
        assert_eq!(apply_frequency(30, 0.01), 45);
        // A band never lengthens beyond the rare-change growth
        assert_eq!(apply_frequency(7, 0.05), 10);
    }

    #[test]
    fn test_frequency_overrides_quality_and_floors() {
        let m = manager();
        let r = m.get_refresh_interval("https://reddit.com/r/algotrading", Some("discussion"), Some(95), Some(3.0));
        assert_eq!(r.days, 1);
        let r = m.get_refresh_interval("https://reddit.com/r/algotrading", None, Some(95), Some(0.0));
        assert_eq!(r.days, 1);
    }

    #[test]
    fn test_detect_content_type_rules() {
        let m = manager();
        let d = |url: &str, title: Option<&str>, content: Option<&str>| {
            m.detect_content_type(url, title, content, None)
        };
        assert_eq!(d("https://x.example/blog/intro", Some("A Guide to pairs"), None), "tutorial");
        assert_eq!(d("https://x.example/news/today", None, None), "news");
        assert_eq!(d("https://x.example/blog/thoughts", None, None), "blog");
        assert_eq!(d("https://x.example/docs/setup", None, None), "documentation");
        assert_eq!(d("https://x.example/forum/thread", None, None), "discussion");
        assert_eq!(d("https://x.example/changelog/", None, None), "changelog");
        assert_eq!(d("https://github.com/o/r/releases/tag/v1", None, None), "changelog");
        assert_eq!(d("https://github.com/o/r", None, None), "code");
        assert_eq!(d("https://arxiv.org/abs/1234", None, None), "paper");
        assert_eq!(d("https://x.example/p", Some("How to backtest"), None), "tutorial");
        assert_eq!(d("https://x.example/p", Some("Release announcement"), None), "news");
        assert_eq!(
            d("https://x.example/p", None, Some("Today, yesterday and breaking: today")),
            "news"
        );
        assert_eq!(d("https://x.example/p", None, None), "article");
    }

    #[test]
    fn test_detect_content_type_from_metadata() {
        let m = manager();
        let meta: Metadata = serde_json::from_str(r#"{"article_type":"Guide"}"#).unwrap();
        assert_eq!(
            m.detect_content_type("https://x.example/p", None, Some("nothing relevant"), Some(&meta)),
            "guide"
        );
        let meta = Metadata::default().with_title("Trading tutorial");
        assert_eq!(
            m.detect_content_type("https://x.example/p", None, None, Some(&meta)),
            "tutorial"
        );
    }

    #[test]
    fn test_update_policy_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policies").join("refresh.json");

        let m = RefreshPolicyManager::load(&path).unwrap();
        m.update_policy(PolicyTarget::Site("www.Example.com".into()), 3).unwrap();
        m.update_policy(PolicyTarget::ContentType("podcast".into()), 21).unwrap();
        assert!(m.update_policy(PolicyTarget::Default, 0).is_err());
        assert!(path.exists());

        let reloaded = RefreshPolicyManager::load(&path).unwrap();
        let tables = reloaded.snapshot();
        assert_eq!(tables.site_policies.get("example.com"), Some(&3));
        assert_eq!(tables.content_type_policies.get("podcast"), Some(&21));
        // Defaults survive the overlay
        assert_eq!(tables.site_policies.get("arxiv.org"), Some(&180));

        assert!(reloaded.remove_policy(PolicyTarget::Site("example.com".into())).unwrap());
        assert!(!reloaded.remove_policy(PolicyTarget::Site("example.com".into())).unwrap());
    }

    #[test]
    fn test_malformed_policy_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refresh.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(RefreshPolicyManager::load(&path).is_err());
    }

    #[test]
    fn test_usage_summary() {
        let m = manager();
        m.get_refresh_interval("https://a.example/1", None, None, None);
        m.get_refresh_interval("https://a.example/2", None, None, None);
        m.get_refresh_interval("https://github.com/x", Some("code"), None, None);
        let summary = m.usage_summary();
        assert_eq!(summary.lookups, 3);
        assert_eq!(summary.distinct_keys, 2);
        assert_eq!(summary.interval_histogram.get(&30), Some(&2));
    }

    #[test]
    fn test_recommendations() {
        let db = Arc::new(Database::in_memory().unwrap());
        let tracker = UrlTracker::new(db);
        let now = Utc::now();

        // Changes roughly daily on a 90-day site
        let fast = "https://quantstart.com/fast";
        for i in (0..5).rev() {
            tracker
                .record_crawl_at(&CrawlOutcome::success(fast, "h", 1), now - Duration::days(i))
                .unwrap();
        }
        // Single-crawl pages on a 14-day site
        for i in 0..5 {
            tracker
                .record_crawl_at(
                    &CrawlOutcome::success(format!("https://medium.com/p/{i}"), "h", 1),
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                )
                .unwrap();
        }

        let recs = manager().recommendations(&tracker).unwrap();
        let adj = recs.site_adjustments.get("quantstart.com").unwrap();
        assert_eq!(adj.current, 90);
        assert!(adj.recommended >= 1 && adj.recommended < 45);

        let rare = recs
            .rarely_changing
            .iter()
            .find(|r| r.site == "medium.com")
            .unwrap();
        assert_eq!(rare.current, 14);
        assert_eq!(rare.recommended, 21);
    }
}
