// BucketRepo tests: monotonic merge, resume state, retention

mod common;

use common::{bucket, ping_bucket};
use std::time::Duration;
use tempfile::TempDir;
use vstats::bucket_repo::BucketRepo;
use vstats::config::RetentionConfig;
use vstats::models::Granularity;
use vstats::retention_worker;

async fn repo(dir: &TempDir) -> BucketRepo {
    let path = dir.path().join("buckets.db");
    let repo = BucketRepo::connect(path.to_str().unwrap(), 2).await.unwrap();
    repo.init().await.unwrap();
    repo
}

#[tokio::test]
async fn bucket_repo_connect_and_init() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    // Second init is no-op (IF NOT EXISTS)
    repo.init().await.unwrap();
    assert!(repo.last_buckets("srv").await.unwrap().is_empty());
}

#[tokio::test]
async fn same_bucket_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    let rows = [(Granularity::FiveSec, bucket(7, 3))];
    repo.upsert_batch("srv", &rows, &[], 100).await.unwrap();
    let outcome = repo.upsert_batch("srv", &rows, &[], 101).await.unwrap();
    assert_eq!(outcome.applied, 1, "equal sample_count replaces");
    assert_eq!(repo.count_buckets("srv", Granularity::FiveSec).await.unwrap(), 1);
    let stored = repo.get_bucket("srv", Granularity::FiveSec, 7).await.unwrap().unwrap();
    assert_eq!(stored, bucket(7, 3));
}

#[tokio::test]
async fn stale_duplicate_does_not_clobber_fuller_bucket() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    repo.upsert_batch("srv", &[(Granularity::TwoMin, bucket(1, 60))], &[], 100)
        .await
        .unwrap();
    let outcome = repo
        .upsert_batch("srv", &[(Granularity::TwoMin, bucket(1, 20))], &[], 101)
        .await
        .unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.stale, 1);
    let stored = repo.get_bucket("srv", Granularity::TwoMin, 1).await.unwrap().unwrap();
    assert_eq!(stored.sample_count, 60);
}

#[tokio::test]
async fn fuller_bucket_replaces_partial_one() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    repo.upsert_batch("srv", &[(Granularity::TwoMin, bucket(1, 20))], &[], 100)
        .await
        .unwrap();
    repo.upsert_batch("srv", &[(Granularity::TwoMin, bucket(1, 60))], &[], 101)
        .await
        .unwrap();
    let stored = repo.get_bucket("srv", Granularity::TwoMin, 1).await.unwrap().unwrap();
    assert_eq!(stored.sample_count, 60);
    assert_eq!(stored.cpu_sum, 600.0);
}

#[tokio::test]
async fn ping_merge_compares_probe_totals() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    let g = Granularity::TwoMin;
    repo.upsert_batch("srv", &[], &[(g, ping_bucket(4, "gw", 2, 3))], 100)
        .await
        .unwrap();
    let outcome = repo
        .upsert_batch("srv", &[], &[(g, ping_bucket(4, "gw", 1, 0))], 101)
        .await
        .unwrap();
    assert_eq!(outcome.stale, 1);
    let stored = repo.get_ping_bucket("srv", g, "gw", 4).await.unwrap().unwrap();
    assert_eq!((stored.ok_count, stored.fail_count), (2, 3));
    assert_eq!(stored.availability(), Some(0.4));
}

#[tokio::test]
async fn last_buckets_reports_newest_index_per_lane() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    let rows: Vec<_> = (10..15)
        .map(|i| (Granularity::FiveSec, bucket(i, 5)))
        .chain([(Granularity::Hourly, bucket(2, 720))])
        .collect();
    repo.upsert_batch("srv", &rows, &[], 100).await.unwrap();
    repo.upsert_batch("other", &[(Granularity::FiveSec, bucket(99, 1))], &[], 100)
        .await
        .unwrap();
    let last = repo.last_buckets("srv").await.unwrap();
    assert_eq!(last.get(&Granularity::FiveSec), Some(&14));
    assert_eq!(last.get(&Granularity::Hourly), Some(&2));
    assert_eq!(last.get(&Granularity::Daily), None);
}

#[tokio::test]
async fn prune_removes_only_expired_rows() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    let now = 10 * 86_400;
    let old = Granularity::FiveSec.index_for(now - 3 * 3_600);
    let fresh = Granularity::FiveSec.index_for(now - 60);
    repo.upsert_batch(
        "srv",
        &[
            (Granularity::FiveSec, bucket(old, 1)),
            (Granularity::FiveSec, bucket(fresh, 1)),
            (Granularity::Daily, bucket(Granularity::Daily.index_for(now - 86_400), 1)),
        ],
        &[(Granularity::FiveSec, ping_bucket(old, "gw", 1, 0))],
        now,
    )
    .await
    .unwrap();
    let deleted = repo.prune_expired(now).await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(repo.count_buckets("srv", Granularity::FiveSec).await.unwrap(), 1);
    assert_eq!(repo.count_buckets("srv", Granularity::Daily).await.unwrap(), 1);
    repo.vacuum().await.unwrap();
}

#[tokio::test]
async fn retention_tick_uses_clock() {
    let dir = TempDir::new().unwrap();
    let repo = repo(&dir).await;
    repo.upsert_batch("srv", &[(Granularity::FiveSec, bucket(0, 1))], &[], 0)
        .await
        .unwrap();
    let clock = common::ManualClock::new(3 * 3_600);
    let deleted = retention_worker::run_one_tick(&repo, &clock).await.unwrap();
    assert_eq!(deleted, 1);
}

#[test]
fn vacuum_delay_follows_interval_or_cron() {
    let mut config = RetentionConfig::default();
    let now = chrono::Local::now();
    assert_eq!(
        retention_worker::next_vacuum_delay(&config, now).unwrap(),
        Duration::from_secs(86_400)
    );
    config.vacuum_schedule = Some("0 0 3 * * *".into());
    let delay = retention_worker::next_vacuum_delay(&config, now).unwrap();
    assert!(delay <= Duration::from_secs(86_400));
    config.vacuum_schedule = Some("not a cron".into());
    assert!(retention_worker::next_vacuum_delay(&config, now).is_err());
}
