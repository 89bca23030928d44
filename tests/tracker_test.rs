//! URL tracker, change detection and refresh policy integration tests

mod common;

use std::collections::HashMap;

use chrono::{Duration, Utc};
use common::{memory_db, t0};
use crawl_scheduler::detector::ChangeDetector;
use crawl_scheduler::policy::{PolicyTarget, RefreshPolicyManager};
use crawl_scheduler::tracker::{CrawlOutcome, CrawlReason, CrawlStatus, UrlTracker};

const URL: &str = "https://news.example.com/markets/rates";

#[test]
fn test_new_url_is_crawlable() {
    let tracker = UrlTracker::new(memory_db());
    let decision = tracker
        .should_crawl_at(URL, 30, &HashMap::new(), t0())
        .unwrap();
    assert!(decision.crawl);
    assert_eq!(decision.reason, CrawlReason::New);
}

#[test]
fn test_recently_seen_after_success() {
    let tracker = UrlTracker::new(memory_db());
    tracker
        .record_crawl_at(&CrawlOutcome::success(URL, "hash-1", 2048), t0())
        .unwrap();

    let decision = tracker
        .should_crawl_at(URL, 30, &HashMap::new(), t0())
        .unwrap();
    assert!(!decision.crawl);
    assert_eq!(decision.reason.as_str(), "recently-seen");

    let due = tracker
        .should_crawl_at(URL, 30, &HashMap::new(), t0() + Duration::days(30))
        .unwrap();
    assert!(due.crawl);
    assert_eq!(due.reason, CrawlReason::RefreshDue);
}

#[test]
fn test_site_override_shortens_refresh() {
    let tracker = UrlTracker::new(memory_db());
    tracker
        .record_crawl_at(&CrawlOutcome::success(URL, "hash-1", 2048), t0())
        .unwrap();
    let overrides = HashMap::from([(String::from("example.com"), 1)]);

    let decision = tracker
        .should_crawl_at(URL, 30, &overrides, t0() + Duration::days(1))
        .unwrap();
    assert!(decision.crawl);
}

#[test]
fn test_failure_backoff_after_three_failures() {
    let tracker = UrlTracker::new(memory_db());
    for day in 0..3 {
        tracker
            .record_crawl_at(&CrawlOutcome::failed(URL), t0() + Duration::days(day))
            .unwrap();
    }
    let last_failure = t0() + Duration::days(2);
    let record = tracker.get_record(URL).unwrap().unwrap();
    assert_eq!(record.failure_count, 3);
    assert_eq!(record.status, CrawlStatus::Failed);

    let early = tracker
        .should_crawl_at(URL, 30, &HashMap::new(), last_failure + Duration::days(6))
        .unwrap();
    assert!(!early.crawl);
    assert_eq!(early.reason, CrawlReason::BackoffPending);

    let due = tracker
        .should_crawl_at(URL, 30, &HashMap::new(), last_failure + Duration::days(7))
        .unwrap();
    assert!(due.crawl);
    assert_eq!(due.reason, CrawlReason::RetryFailed);
}

#[test]
fn test_success_resets_failure_count() {
    let tracker = UrlTracker::new(memory_db());
    tracker
        .record_crawl_at(&CrawlOutcome::failed(URL), t0())
        .unwrap();
    tracker
        .record_crawl_at(&CrawlOutcome::success(URL, "h", 1), t0() + Duration::days(1))
        .unwrap();

    let record = tracker.get_record(URL).unwrap().unwrap();
    assert_eq!(record.failure_count, 0);
    assert_eq!(record.scrape_count, 2);
}

#[test]
fn test_detector_hash_feeds_change_detection() {
    let tracker = UrlTracker::new(memory_db());
    let v1 = "<p>Rates held steady</p> updated 2024-03-01T10:00:00Z";
    let v1_again = "<p>Rates  held steady</p> updated 2024-03-02T08:30:00Z";
    let v2 = "<p>Rates cut by 25bp</p>";

    tracker
        .record_crawl_at(
            &CrawlOutcome::success(URL, ChangeDetector::hash(v1), v1.len() as u64),
            t0(),
        )
        .unwrap();

    assert!(!tracker
        .detect_content_change(URL, &ChangeDetector::hash(v1_again))
        .unwrap());
    assert!(tracker
        .detect_content_change(URL, &ChangeDetector::hash(v2))
        .unwrap());
}

#[test]
fn test_site_stats_and_cleanup() {
    let tracker = UrlTracker::new(memory_db());
    tracker
        .record_crawl_at(&CrawlOutcome::success(URL, "a", 1).with_quality(70), t0())
        .unwrap();
    tracker
        .record_crawl_at(
            &CrawlOutcome::failed("https://news.example.com/gone"),
            t0() - Duration::days(400),
        )
        .unwrap();

    let stats = tracker.site_stats(Some("news.example.com")).unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total_urls, 2);
    assert_eq!(stats[0].success_count, 1);
    assert_eq!(stats[0].failed_count, 1);

    let removed = tracker.cleanup_old_records_at(365, t0()).unwrap();
    assert_eq!(removed, 1);
    assert!(tracker.get_record(URL).unwrap().is_some());
    assert!(tracker
        .get_record("https://news.example.com/gone")
        .unwrap()
        .is_none());
}

#[test]
fn test_policy_recommendations_from_history() {
    let tracker = UrlTracker::new(memory_db());
    let start = Utc::now() - Duration::days(5);
    for day in 0..5 {
        tracker
            .record_crawl_at(
                &CrawlOutcome::success(URL, format!("v{day}"), 100),
                start + Duration::days(day),
            )
            .unwrap();
    }

    let manager = RefreshPolicyManager::with_defaults();
    manager
        .update_policy(PolicyTarget::Site("example.com".into()), 14)
        .unwrap();
    let recommendations = manager.recommendations(&tracker).unwrap();
    let adjustment = recommendations
        .site_adjustments
        .values()
        .next()
        .expect("site adjustment");
    assert!(adjustment.recommended < adjustment.current);
}

#[test]
fn test_refresh_interval_uses_site_policy() {
    let manager = RefreshPolicyManager::with_defaults();
    manager
        .update_policy(PolicyTarget::Site("example.com".into()), 3)
        .unwrap();
    let interval = manager.get_refresh_interval(URL, None, None, None);
    assert_eq!(interval.days, 3);
    assert!(interval.reason_trail().contains("site:example.com=3"));
}
