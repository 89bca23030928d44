//! Configuration loading tests

use std::io::Write;
use std::path::PathBuf;

use crawl_scheduler::config::Config;
use serial_test::serial;

const ENV_KEYS: &[&str] = &[
    "CRAWLSCHED_DB_PATH",
    "CRAWLSCHED_MAX_WORKERS",
    "CRAWLSCHED_DEFAULT_REFRESH_DAYS",
    "CRAWLSCHED_LOG_FORMAT",
    "CRAWLSCHED_POLICY_FILE",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config, Config::default());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_env();
    std::env::set_var("CRAWLSCHED_DB_PATH", "/tmp/crawl-test.db");
    std::env::set_var("CRAWLSCHED_MAX_WORKERS", "4");
    std::env::set_var("CRAWLSCHED_DEFAULT_REFRESH_DAYS", "7");
    std::env::set_var("CRAWLSCHED_POLICY_FILE", "/tmp/policies.json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path, PathBuf::from("/tmp/crawl-test.db"));
    assert_eq!(config.scheduler.max_workers, 4);
    assert_eq!(config.tracker.default_refresh_days, 7);
    assert_eq!(config.policy.file, Some(PathBuf::from("/tmp/policies.json")));

    clear_env();
}

#[test]
#[serial]
fn test_unparseable_env_value_falls_back() {
    clear_env();
    std::env::set_var("CRAWLSCHED_MAX_WORKERS", "many");
    let config = Config::from_env().unwrap();
    assert_eq!(config.scheduler.max_workers, 10);
    clear_env();
}

#[test]
#[serial]
fn test_load_validates() {
    clear_env();
    std::env::set_var("CRAWLSCHED_LOG_FORMAT", "xml");
    assert!(Config::load(None).is_err());
    clear_env();
}

#[test]
fn test_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[database]
path = "var/crawl.db"

[scheduler]
poll_interval_secs = 5
max_workers = 2

[queue.weights.source_bonuses]
manual = 0.5
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.database.path, PathBuf::from("var/crawl.db"));
    assert_eq!(config.scheduler.poll_interval_secs, 5);
    assert_eq!(config.score_weights().source_bonuses["manual"], 0.5);
    assert_eq!(config.queue.batch_size, 10);
}

#[test]
fn test_from_file_rejects_malformed_toml() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[database\npath = ").unwrap();
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse TOML"));
}
