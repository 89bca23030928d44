//! Claim exclusivity across independent database handles

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use common::file_db;
use crawl_scheduler::queue::{BatchFilter, CandidateUrl, DiscoveryQueue};
use crawl_scheduler::scheduler::{JobQueue, NewJob};

const ENTRIES: usize = 200;
const WORKERS: usize = 4;

#[test]
fn test_concurrent_next_batch_never_overlaps() {
    let dir = tempfile::tempdir().unwrap();
    let seed = DiscoveryQueue::new(file_db(dir.path()));
    let candidates: Vec<_> = (0..ENTRIES)
        .map(|i| CandidateUrl::new(format!("https://example.com/article/{i}"), "feed"))
        .collect();
    assert_eq!(seed.add(&candidates).unwrap().added, ENTRIES);

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            // each worker opens its own connection to the same file
            let queue = DiscoveryQueue::new(file_db(dir.path()));
            thread::spawn(move || {
                let mut claimed = Vec::new();
                loop {
                    let batch = queue.next_batch(7, &BatchFilter::default()).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|e| e.url));
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for url in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(url.clone()), "claimed twice: {url}");
        }
    }
    assert_eq!(total, ENTRIES);
}

#[test]
fn test_concurrent_job_claims_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let seed = JobQueue::new(file_db(dir.path()));
    for i in 0..40 {
        let job = NewJob::new(format!("job-{i}"), "noop")
            .run_immediately()
            .into_job(now)
            .unwrap();
        seed.add(&job).unwrap();
    }

    let handles: Vec<_> = (0..WORKERS)
        .map(|_| {
            let jobs = Arc::new(JobQueue::new(file_db(dir.path())));
            thread::spawn(move || {
                let mut ids = Vec::new();
                loop {
                    let claimed = jobs.claim_ready(now, 3).unwrap();
                    if claimed.is_empty() {
                        break;
                    }
                    ids.extend(claimed.into_iter().map(|j| j.id));
                }
                ids
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 40);
}
