// Ping bucket table: one row per (server_id, granularity, bucket, target_name)

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Sqlite, Transaction};

use crate::models::{Granularity, PingBucket};

pub(super) async fn init_ping_table(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ping_buckets (
            server_id TEXT NOT NULL,
            granularity TEXT NOT NULL,
            bucket INTEGER NOT NULL,
            target_name TEXT NOT NULL,
            target_host TEXT NOT NULL,
            latency_sum REAL NOT NULL,
            latency_max REAL NOT NULL,
            latency_count INTEGER NOT NULL,
            ok_count INTEGER NOT NULL,
            fail_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (server_id, granularity, bucket, target_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ping_buckets_granularity_bucket ON ping_buckets(granularity, bucket)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Same precedence as metric rows, comparing total probes. Returns whether the row was written.
pub(super) async fn upsert_ping(
    tx: &mut Transaction<'_, Sqlite>,
    server_id: &str,
    granularity: Granularity,
    p: &PingBucket,
    updated_at: i64,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO ping_buckets
        (server_id, granularity, bucket, target_name, target_host, latency_sum, latency_max,
         latency_count, ok_count, fail_count, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT(server_id, granularity, bucket, target_name) DO UPDATE SET
            target_host = excluded.target_host,
            latency_sum = excluded.latency_sum,
            latency_max = excluded.latency_max,
            latency_count = excluded.latency_count,
            ok_count = excluded.ok_count,
            fail_count = excluded.fail_count,
            updated_at = excluded.updated_at
        WHERE excluded.ok_count + excluded.fail_count >= ping_buckets.ok_count + ping_buckets.fail_count
        "#,
    )
    .bind(server_id)
    .bind(granularity.as_str())
    .bind(p.index)
    .bind(&p.target_name)
    .bind(&p.target_host)
    .bind(p.latency_sum)
    .bind(p.latency_max)
    .bind(p.latency_count as i64)
    .bind(p.ok_count as i64)
    .bind(p.fail_count as i64)
    .bind(updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn get_ping_bucket(
    pool: &SqlitePool,
    server_id: &str,
    granularity: Granularity,
    target_name: &str,
    index: i64,
) -> anyhow::Result<Option<PingBucket>> {
    let row = sqlx::query(
        "SELECT bucket, target_name, target_host, latency_sum, latency_max, latency_count, ok_count, fail_count
         FROM ping_buckets WHERE server_id = $1 AND granularity = $2 AND target_name = $3 AND bucket = $4",
    )
    .bind(server_id)
    .bind(granularity.as_str())
    .bind(target_name)
    .bind(index)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(parse_ping_row).transpose()
}

pub(super) async fn prune_ping(
    pool: &SqlitePool,
    granularity: Granularity,
    cutoff_index: i64,
) -> anyhow::Result<u64> {
    let r = sqlx::query("DELETE FROM ping_buckets WHERE granularity = $1 AND bucket < $2")
        .bind(granularity.as_str())
        .bind(cutoff_index)
        .execute(pool)
        .await?;
    Ok(r.rows_affected())
}

fn count(row: &SqliteRow, column: &str) -> anyhow::Result<u32> {
    let v: i64 = row.try_get(column)?;
    Ok(v.clamp(0, u32::MAX as i64) as u32)
}

fn parse_ping_row(row: &SqliteRow) -> anyhow::Result<PingBucket> {
    Ok(PingBucket {
        index: row.try_get("bucket")?,
        target_name: row.try_get("target_name")?,
        target_host: row.try_get("target_host")?,
        latency_sum: row.try_get("latency_sum")?,
        latency_max: row.try_get("latency_max")?,
        latency_count: count(row, "latency_count")?,
        ok_count: count(row, "ok_count")?,
        fail_count: count(row, "fail_count")?,
    })
}
