use std::collections::BTreeMap;

use sqlx::Row;

use super::Database;
use crate::error::Result;
use crate::types::Interval;

impl Database {
    /// Bulk upsert (open_time, metric_name, value) tuples. NaN warm-up
    /// values arrive as None and are stored as NULL.
    pub async fn upsert_derived_metrics(
        &self,
        symbol: &str,
        interval: Interval,
        records: &[(i64, String, Option<f64>)],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        for (open_time, name, value) in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO derived_metrics (symbol, interval, open_time, metric_name, value)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(symbol)
            .bind(interval.as_str())
            .bind(open_time)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Stored row counts per metric name for a symbol/interval.
    pub async fn derived_metric_counts(&self, symbol: &str, interval: Interval) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT metric_name, COUNT(*) AS cnt
            FROM derived_metrics
            WHERE symbol = ? AND interval = ?
            GROUP BY metric_name
            ORDER BY metric_name
            "#,
        )
        .bind(symbol)
        .bind(interval.as_str())
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("metric_name"), row.get("cnt")))
            .collect())
    }
}
