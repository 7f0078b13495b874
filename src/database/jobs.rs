use serde::Serialize;
use serde_json::json;
use sqlx::Row;

use super::{now_iso, Database};
use crate::error::Result;
use crate::types::JobStatus;

/// One download_jobs row.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: i64,
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: JobStatus,
    pub progress_pct: f64,
    pub candles_downloaded: i64,
    pub candles_expected: i64,
    pub gaps_found: i64,
    pub created_at: String,
    pub updated_at: String,
    /// Append-only event log, decoded from the stored JSON array.
    pub log: serde_json::Value,
}

/// Partial update applied to a job row. The log entry, when present, is
/// appended to the stored event list with a timestamp.
#[derive(Debug, Default)]
pub struct JobUpdate<'a> {
    pub status: Option<JobStatus>,
    pub progress_pct: Option<f64>,
    pub candles_downloaded: Option<i64>,
    pub candles_expected: Option<i64>,
    pub gaps_found: Option<i64>,
    pub log_entry: Option<&'a str>,
}

impl Database {
    pub async fn create_job(&self, symbol: &str, interval: &str, start_ms: i64, end_ms: i64) -> Result<i64> {
        let now = now_iso();
        let result = sqlx::query(
            r#"
            INSERT INTO download_jobs (symbol, interval, start_time, end_time,
                                       status, created_at, updated_at, log)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, '[]')
            "#,
        )
        .bind(symbol)
        .bind(interval)
        .bind(start_ms)
        .bind(end_ms)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<DownloadJob>> {
        let row = sqlx::query("SELECT * FROM download_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_str: String = row.get("status");
        let log_str: String = row.get::<Option<String>, _>("log").unwrap_or_else(|| "[]".to_string());
        Ok(Some(DownloadJob {
            id: row.get("id"),
            symbol: row.get("symbol"),
            interval: row.get("interval"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            status: status_str.parse()?,
            progress_pct: row.get::<Option<f64>, _>("progress_pct").unwrap_or(0.0),
            candles_downloaded: row.get::<Option<i64>, _>("candles_downloaded").unwrap_or(0),
            candles_expected: row.get::<Option<i64>, _>("candles_expected").unwrap_or(0),
            gaps_found: row.get::<Option<i64>, _>("gaps_found").unwrap_or(0),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            log: serde_json::from_str(&log_str).unwrap_or_else(|_| json!([])),
        }))
    }

    pub async fn job_status(&self, job_id: i64) -> Result<Option<JobStatus>> {
        let row = sqlx::query("SELECT status FROM download_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(status.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Request cancellation. Only pending/running jobs can transition.
    pub async fn cancel_job(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE download_jobs SET status = 'cancelled', updated_at = ? WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(now_iso())
        .bind(job_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_job(&self, job_id: i64, update: JobUpdate<'_>) -> Result<()> {
        let row = sqlx::query("SELECT log FROM download_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(row) = row else {
            return Ok(());
        };

        let log_str: String = row.get::<Option<String>, _>("log").unwrap_or_else(|| "[]".to_string());
        let mut log: Vec<serde_json::Value> = serde_json::from_str(&log_str).unwrap_or_default();
        if let Some(entry) = update.log_entry {
            log.push(json!({"ts": now_iso(), "msg": entry}));
        }

        sqlx::query(
            r#"
            UPDATE download_jobs
            SET updated_at = ?,
                log = ?,
                status = COALESCE(?, status),
                progress_pct = COALESCE(?, progress_pct),
                candles_downloaded = COALESCE(?, candles_downloaded),
                candles_expected = COALESCE(?, candles_expected),
                gaps_found = COALESCE(?, gaps_found)
            WHERE id = ?
            "#,
        )
        .bind(now_iso())
        .bind(serde_json::to_string(&log)?)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.progress_pct)
        .bind(update.candles_downloaded)
        .bind(update.candles_expected)
        .bind(update.gaps_found)
        .bind(job_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
