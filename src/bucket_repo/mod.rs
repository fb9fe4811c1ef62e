// SQLite bucket store. Rows are keyed by (server_id, granularity, bucket) and only ever
// replaced by an incoming row carrying at least as many samples.

mod ping;

use crate::models::{Bucket, Granularity, PingBucket};
use crate::protocol::LastBuckets;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

/// How many rows of an upsert replaced or created a stored bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub applied: u64,
    /// Incoming rows ignored because the stored row already had more samples.
    pub stale: u64,
}

pub struct BucketRepo {
    pool: SqlitePool,
}

impl BucketRepo {
    pub async fn connect(path: &str, max_pool_size: u32) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_pool_size)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metric_buckets (
                server_id TEXT NOT NULL,
                granularity TEXT NOT NULL,
                bucket INTEGER NOT NULL,
                cpu_sum REAL NOT NULL,
                cpu_max REAL NOT NULL,
                memory_sum REAL NOT NULL,
                memory_max REAL NOT NULL,
                disk_sum REAL NOT NULL,
                disk_max REAL NOT NULL,
                load_sum REAL NOT NULL,
                load_max REAL NOT NULL,
                net_rx INTEGER NOT NULL,
                net_tx INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (server_id, granularity, bucket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_metric_buckets_granularity_bucket ON metric_buckets(granularity, bucket)",
        )
        .execute(&self.pool)
        .await?;

        ping::init_ping_table(&self.pool).await?;

        Ok(())
    }

    /// Writes a whole batch in one transaction. Each row is applied only when its sample
    /// count is >= the stored one, so redelivery and reordering never lose samples.
    #[instrument(
        skip(self, metrics, pings),
        fields(repo = "buckets", operation = "upsert_batch", metrics = metrics.len(), pings = pings.len())
    )]
    pub async fn upsert_batch(
        &self,
        server_id: &str,
        metrics: &[(Granularity, Bucket)],
        pings: &[(Granularity, PingBucket)],
        updated_at: i64,
    ) -> anyhow::Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        if metrics.is_empty() && pings.is_empty() {
            return Ok(outcome);
        }
        let mut tx = self.pool.begin().await?;

        for (g, b) in metrics {
            let result = sqlx::query(
                r#"
                INSERT INTO metric_buckets
                (server_id, granularity, bucket, cpu_sum, cpu_max, memory_sum, memory_max,
                 disk_sum, disk_max, load_sum, load_max, net_rx, net_tx, sample_count, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT(server_id, granularity, bucket) DO UPDATE SET
                    cpu_sum = excluded.cpu_sum,
                    cpu_max = excluded.cpu_max,
                    memory_sum = excluded.memory_sum,
                    memory_max = excluded.memory_max,
                    disk_sum = excluded.disk_sum,
                    disk_max = excluded.disk_max,
                    load_sum = excluded.load_sum,
                    load_max = excluded.load_max,
                    net_rx = excluded.net_rx,
                    net_tx = excluded.net_tx,
                    sample_count = excluded.sample_count,
                    updated_at = excluded.updated_at
                WHERE excluded.sample_count >= metric_buckets.sample_count
                "#,
            )
            .bind(server_id)
            .bind(g.as_str())
            .bind(b.index)
            .bind(b.cpu_sum)
            .bind(b.cpu_max)
            .bind(b.memory_sum)
            .bind(b.memory_max)
            .bind(b.disk_sum)
            .bind(b.disk_max)
            .bind(b.load_sum)
            .bind(b.load_max)
            .bind(b.net_rx as i64)
            .bind(b.net_tx as i64)
            .bind(b.sample_count as i64)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                outcome.applied += 1;
            } else {
                outcome.stale += 1;
            }
        }

        for (g, p) in pings {
            if ping::upsert_ping(&mut tx, server_id, *g, p, updated_at).await? {
                outcome.applied += 1;
            } else {
                outcome.stale += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Newest stored metric bucket index per lane for one agent.
    #[instrument(skip(self), fields(repo = "buckets", operation = "last_buckets"))]
    pub async fn last_buckets(&self, server_id: &str) -> anyhow::Result<LastBuckets> {
        let rows = sqlx::query(
            "SELECT granularity, MAX(bucket) AS last FROM metric_buckets WHERE server_id = $1 GROUP BY granularity",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = LastBuckets::new();
        for row in rows {
            let name: String = row.try_get("granularity")?;
            let last: i64 = row.try_get("last")?;
            match Granularity::from_str(&name) {
                Ok(g) => {
                    out.insert(g, last);
                }
                Err(e) => tracing::warn!(error = %e, "skipping stored rows of unknown granularity"),
            }
        }
        Ok(out)
    }

    pub async fn get_bucket(
        &self,
        server_id: &str,
        granularity: Granularity,
        index: i64,
    ) -> anyhow::Result<Option<Bucket>> {
        let row = sqlx::query(
            "SELECT bucket, cpu_sum, cpu_max, memory_sum, memory_max, disk_sum, disk_max, load_sum, load_max, net_rx, net_tx, sample_count
             FROM metric_buckets WHERE server_id = $1 AND granularity = $2 AND bucket = $3",
        )
        .bind(server_id)
        .bind(granularity.as_str())
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_bucket_row).transpose()
    }

    pub async fn get_ping_bucket(
        &self,
        server_id: &str,
        granularity: Granularity,
        target_name: &str,
        index: i64,
    ) -> anyhow::Result<Option<PingBucket>> {
        ping::get_ping_bucket(&self.pool, server_id, granularity, target_name, index).await
    }

    pub async fn count_buckets(
        &self,
        server_id: &str,
        granularity: Granularity,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM metric_buckets WHERE server_id = $1 AND granularity = $2",
        )
        .bind(server_id)
        .bind(granularity.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Deletes buckets that fell out of their lane's retention window. Returns rows deleted.
    #[instrument(skip(self), fields(repo = "buckets", operation = "prune_expired"))]
    pub async fn prune_expired(&self, now_secs: i64) -> anyhow::Result<u64> {
        let mut deleted = 0;
        for g in Granularity::ALL {
            let cutoff = g.index_for(now_secs - g.retention().as_secs() as i64);
            let r = sqlx::query("DELETE FROM metric_buckets WHERE granularity = $1 AND bucket < $2")
                .bind(g.as_str())
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
            deleted += r.rows_affected();
            deleted += ping::prune_ping(&self.pool, g, cutoff).await?;
        }
        Ok(deleted)
    }

    #[instrument(skip(self), fields(repo = "buckets", operation = "vacuum"))]
    pub async fn vacuum(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    fn parse_bucket_row(row: &SqliteRow) -> anyhow::Result<Bucket> {
        let net_rx: i64 = row.try_get("net_rx")?;
        let net_tx: i64 = row.try_get("net_tx")?;
        let sample_count: i64 = row.try_get("sample_count")?;
        Ok(Bucket {
            index: row.try_get("bucket")?,
            cpu_sum: row.try_get("cpu_sum")?,
            cpu_max: row.try_get("cpu_max")?,
            memory_sum: row.try_get("memory_sum")?,
            memory_max: row.try_get("memory_max")?,
            disk_sum: row.try_get("disk_sum")?,
            disk_max: row.try_get("disk_max")?,
            load_sum: row.try_get("load_sum")?,
            load_max: row.try_get("load_max")?,
            net_rx: net_rx.max(0) as u64,
            net_tx: net_tx.max(0) as u64,
            sample_count: sample_count.clamp(0, u32::MAX as i64) as u32,
        })
    }
}
