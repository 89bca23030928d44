//! Common utilities and helper functions
//!
//! URL and site helpers shared by the tracker, the refresh policies and the
//! queue, plus small text helpers.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

use crate::error::{Error, Result};

/// Normalize whitespace in text
pub fn normalize_whitespace(text: &str) -> String {
    static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();

    let re = WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("Invalid regex pattern"));

    re.replace_all(text.trim(), " ").to_string()
}

/// Parse and validate a crawlable URL (absolute http/https with a host)
pub fn parse_crawl_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw.trim()).map_err(|e| Error::invalid("url", format!("'{raw}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::invalid(
            "url",
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(Error::invalid("url", format!("'{raw}' has no host")));
    }

    Ok(parsed)
}

/// Extract the lowercase host from a URL
pub fn extract_domain(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::invalid("url", e.to_string()))?;

    parsed
        .host_str()
        .map(|s| s.to_ascii_lowercase())
        .ok_or_else(|| Error::invalid("url", format!("'{url}' has no host")))
}

/// Site key for a URL: lowercase host without a leading `www.`
///
/// Unparseable URLs map to `"unknown"` so reporting never fails on one bad row.
pub fn site_of(url: &str) -> String {
    match extract_domain(url) {
        Ok(host) => host.strip_prefix("www.").map(str::to_string).unwrap_or(host),
        Err(_) => String::from("unknown"),
    }
}

/// The host followed by each parent domain with at least two labels
///
/// `en.m.wikipedia.org` yields `en.m.wikipedia.org`, `m.wikipedia.org`,
/// `wikipedia.org`.
pub fn domain_suffixes(host: &str) -> impl Iterator<Item = &str> {
    let labels = host.split('.').count();
    let mut rest = Some(host);
    let mut remaining = labels;
    std::iter::from_fn(move || {
        let current = rest?;
        if remaining < 2 && labels >= 2 {
            return None;
        }
        rest = current.split_once('.').map(|(_, tail)| tail);
        remaining = remaining.saturating_sub(1);
        Some(current)
    })
}

/// First `max_chars` characters of `text`, never splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  hello   world  "), "hello world");
        assert_eq!(normalize_whitespace("hello\n\nworld"), "hello world");
    }

    #[test]
    fn test_extract_domain() {
        let domain = extract_domain("https://Blog.QuantInsti.com/post/123");
        assert_eq!(domain.unwrap(), "blog.quantinsti.com");
        assert!(extract_domain("not a url").is_err());
    }

    #[test]
    fn test_site_of_strips_www() {
        assert_eq!(site_of("https://www.quantstart.com/articles/x"), "quantstart.com");
        assert_eq!(site_of("garbage"), "unknown");
    }

    #[test]
    fn test_parse_crawl_url() {
        assert!(parse_crawl_url("https://a.example/post-1").is_ok());
        assert!(parse_crawl_url("ftp://a.example/file").is_err());
        assert!(parse_crawl_url("/relative/path").is_err());
        assert!(parse_crawl_url("").is_err());
    }

    #[test]
    fn test_domain_suffixes() {
        let all: Vec<&str> = domain_suffixes("en.m.wikipedia.org").collect();
        assert_eq!(all, vec!["en.m.wikipedia.org", "m.wikipedia.org", "wikipedia.org"]);

        let single: Vec<&str> = domain_suffixes("localhost").collect();
        assert_eq!(single, vec!["localhost"]);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
    }
}
