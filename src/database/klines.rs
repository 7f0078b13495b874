use std::collections::HashSet;
use std::str::FromStr;

use serde::Serialize;
use sqlx::Row;

use super::Database;
use crate::error::Result;
use crate::types::{Candle, CandleFrame, Interval};

/// Per (symbol, interval) candle coverage summary.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageRow {
    pub symbol: String,
    pub interval: String,
    pub count: i64,
    pub from_ms: i64,
    pub to_ms: i64,
}

impl Database {
    /// Insert-or-replace candles on the (symbol, interval, open_time) key.
    /// Re-ingesting the same candle updates but never duplicates.
    pub async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool().begin().await?;
        for candle in candles {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO klines
                    (symbol, interval, open_time, open, high, low, close, volume,
                     close_time, quote_asset_volume, number_of_trades,
                     taker_buy_base_vol, taker_buy_quote_vol, ignore_field,
                     source, downloaded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&candle.symbol)
            .bind(candle.interval.as_str())
            .bind(candle.open_time)
            .bind(&candle.open)
            .bind(&candle.high)
            .bind(&candle.low)
            .bind(&candle.close)
            .bind(&candle.volume)
            .bind(candle.close_time)
            .bind(&candle.quote_asset_volume)
            .bind(candle.number_of_trades)
            .bind(&candle.taker_buy_base_vol)
            .bind(&candle.taker_buy_quote_vol)
            .bind(&candle.ignore_field)
            .bind(&candle.source)
            .bind(&candle.downloaded_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(candles.len())
    }

    /// Open times already stored in `[start_ms, end_ms)`.
    pub async fn existing_open_times(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<HashSet<i64>> {
        let rows = sqlx::query(
            "SELECT open_time FROM klines WHERE symbol = ? AND interval = ? AND open_time >= ? AND open_time < ?",
        )
        .bind(symbol)
        .bind(interval.as_str())
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(|row| row.get::<i64, _>("open_time")).collect())
    }

    pub async fn count_candles_in_range(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM klines WHERE symbol = ? AND interval = ? AND open_time >= ? AND open_time < ?",
        )
        .bind(symbol)
        .bind(interval.as_str())
        .bind(start_ms)
        .bind(end_ms)
        .fetch_one(self.pool())
        .await?;

        Ok(row.get("cnt"))
    }

    pub async fn has_candle(&self, symbol: &str, interval: Interval, open_time: i64) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM klines WHERE symbol = ? AND interval = ? AND open_time = ?")
            .bind(symbol)
            .bind(interval.as_str())
            .bind(open_time)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Open price of a single stored candle, if present.
    pub async fn candle_open_price(
        &self,
        symbol: &str,
        interval: Interval,
        open_time: i64,
    ) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT open FROM klines WHERE symbol = ? AND interval = ? AND open_time = ?")
            .bind(symbol)
            .bind(interval.as_str())
            .bind(open_time)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.and_then(|r| r.get::<String, _>("open").parse::<f64>().ok()))
    }

    /// Load a candle range into a columnar frame with numeric coercion.
    /// Values that fail to parse become NaN.
    pub async fn load_frame(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<CandleFrame> {
        let mut sql = String::from(
            "SELECT open_time, open, high, low, close, volume FROM klines WHERE symbol = ? AND interval = ?",
        );
        if start_ms.is_some() {
            sql.push_str(" AND open_time >= ?");
        }
        if end_ms.is_some() {
            sql.push_str(" AND open_time < ?");
        }
        sql.push_str(" ORDER BY open_time ASC");

        let mut query = sqlx::query(&sql).bind(symbol).bind(interval.as_str());
        if let Some(start) = start_ms {
            query = query.bind(start);
        }
        if let Some(end) = end_ms {
            query = query.bind(end);
        }

        let rows = query.fetch_all(self.pool()).await?;

        let coerce = |s: String| s.parse::<f64>().unwrap_or(f64::NAN);
        let mut frame = CandleFrame::default();
        for row in rows {
            frame.open_time.push(row.get("open_time"));
            frame.open.push(coerce(row.get("open")));
            frame.high.push(coerce(row.get("high")));
            frame.low.push(coerce(row.get("low")));
            frame.close.push(coerce(row.get("close")));
            frame.volume.push(coerce(row.get("volume")));
        }

        Ok(frame)
    }

    /// Full candle rows for the API, oldest first.
    pub async fn list_candles(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Candle>> {
        let mut sql = String::from("SELECT * FROM klines WHERE symbol = ? AND interval = ?");
        if start_ms.is_some() {
            sql.push_str(" AND open_time >= ?");
        }
        if end_ms.is_some() {
            sql.push_str(" AND open_time < ?");
        }
        sql.push_str(" ORDER BY open_time ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(symbol).bind(interval.as_str());
        if let Some(start) = start_ms {
            query = query.bind(start);
        }
        if let Some(end) = end_ms {
            query = query.bind(end);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let interval_str: String = row.get("interval");
            candles.push(Candle {
                symbol: row.get("symbol"),
                interval: Interval::from_str(&interval_str)?,
                open_time: row.get("open_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                close_time: row.get("close_time"),
                quote_asset_volume: row.get("quote_asset_volume"),
                number_of_trades: row.get("number_of_trades"),
                taker_buy_base_vol: row.get("taker_buy_base_vol"),
                taker_buy_quote_vol: row.get("taker_buy_quote_vol"),
                ignore_field: row.get("ignore_field"),
                source: row.get("source"),
                downloaded_at: row.get("downloaded_at"),
            });
        }

        Ok(candles)
    }

    pub async fn distinct_symbols(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT symbol FROM klines ORDER BY symbol")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|row| row.get("symbol")).collect())
    }

    /// All (symbol, interval) combos with candle count and stored range.
    pub async fn coverage(&self) -> Result<Vec<CoverageRow>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, interval, COUNT(*) AS cnt,
                   MIN(open_time) AS from_ms, MAX(open_time) AS to_ms
            FROM klines
            GROUP BY symbol, interval
            ORDER BY symbol, interval
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| CoverageRow {
                symbol: row.get("symbol"),
                interval: row.get("interval"),
                count: row.get("cnt"),
                from_ms: row.get("from_ms"),
                to_ms: row.get("to_ms"),
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{Candle, Interval};

    /// Minimal valid candle for store-level tests.
    pub fn make_candle(symbol: &str, interval: Interval, open_time: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            interval,
            open_time,
            open: "100".to_string(),
            high: "101".to_string(),
            low: "99".to_string(),
            close: "100.5".to_string(),
            volume: "10".to_string(),
            close_time: open_time + interval.step_ms() - 1,
            quote_asset_volume: "1000".to_string(),
            number_of_trades: 10,
            taker_buy_base_vol: "5".to_string(),
            taker_buy_quote_vol: "500".to_string(),
            ignore_field: Some("0".to_string()),
            source: "binance_spot".to_string(),
            downloaded_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    pub fn make_candle_with_ohlc(
        symbol: &str,
        interval: Interval,
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Candle {
        let mut candle = make_candle(symbol, interval, open_time);
        candle.open = open.to_string();
        candle.high = high.to_string();
        candle.low = low.to_string();
        candle.close = close.to_string();
        candle
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use crate::database::Database;
    use crate::types::Interval;

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_natural_key() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();

        let mut candle = make_candle("BTCUSDT", Interval::H1, step);
        db.upsert_candles(std::slice::from_ref(&candle)).await.unwrap();

        // second upsert with updated attributes replaces, never duplicates
        candle.close = "105".to_string();
        db.upsert_candles(std::slice::from_ref(&candle)).await.unwrap();

        let count = db
            .count_candles_in_range("BTCUSDT", Interval::H1, 0, 10 * step)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let candles = db
            .list_candles("BTCUSDT", Interval::H1, None, None, 10)
            .await
            .unwrap();
        assert_eq!(candles[0].close, "105");
    }

    #[tokio::test]
    async fn test_existing_open_times_range_is_half_open() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();

        let candles: Vec<_> = [0, 1, 2, 4, 5]
            .iter()
            .map(|i| make_candle("BTCUSDT", Interval::H1, i * step))
            .collect();
        db.upsert_candles(&candles).await.unwrap();

        let existing = db
            .existing_open_times("BTCUSDT", Interval::H1, 0, 5 * step)
            .await
            .unwrap();
        // 5*step is excluded by the half-open bound
        assert_eq!(existing.len(), 4);
        assert!(existing.contains(&0));
        assert!(!existing.contains(&(3 * step)));
        assert!(!existing.contains(&(5 * step)));
    }

    #[tokio::test]
    async fn test_load_frame_coerces_numbers() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();

        let mut bad = make_candle("ETHUSDT", Interval::H1, 0);
        bad.volume = "not-a-number".to_string();
        db.upsert_candles(&[bad, make_candle("ETHUSDT", Interval::H1, step)])
            .await
            .unwrap();

        let frame = db.load_frame("ETHUSDT", Interval::H1, None, None).await.unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.close[0], 100.5);
        assert!(frame.volume[0].is_nan());
        assert_eq!(frame.open_time[1], step);
    }

    #[tokio::test]
    async fn test_coverage_groups_by_symbol_interval() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();
        let candles: Vec<_> = (0..3).map(|i| make_candle("BTCUSDT", Interval::H1, i * step)).collect();
        db.upsert_candles(&candles).await.unwrap();

        let coverage = db.coverage().await.unwrap();
        assert_eq!(coverage.len(), 1);
        assert_eq!(coverage[0].count, 3);
        assert_eq!(coverage[0].from_ms, 0);
        assert_eq!(coverage[0].to_ms, 2 * step);
    }
}
