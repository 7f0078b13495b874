use serde::Serialize;

use crate::database::Database;
use crate::error::Result;
use crate::indicators::{ema, rolling_max, rolling_mean, rolling_min, rolling_std, true_range};
use crate::types::{CandleFrame, Interval};

/// Outcome of a metrics computation run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub status: &'static str,
    pub metrics_computed: usize,
    pub rows: usize,
    pub metric_names: Vec<String>,
}

/// Compute the derived metric set over a frame. `selected = None` means
/// all; otherwise the output is filtered by exact metric name. Warm-up
/// values stay NaN and are stored as NULL.
pub fn compute_metrics(frame: &CandleFrame, selected: Option<&[String]>) -> Vec<(String, Vec<f64>)> {
    if frame.is_empty() {
        return Vec::new();
    }

    let close = &frame.close;
    let high = &frame.high;
    let low = &frame.low;
    let n = frame.len();

    let mut log_ret = vec![f64::NAN; n];
    let mut simple_ret = vec![f64::NAN; n];
    for t in 1..n {
        log_ret[t] = (close[t] / close[t - 1]).ln();
        simple_ret[t] = close[t] / close[t - 1] - 1.0;
    }

    let range: Vec<f64> = high.iter().zip(low.iter()).map(|(h, l)| h - l).collect();
    let tr = true_range(high, low, close);

    let mut results: Vec<(String, Vec<f64>)> = Vec::new();
    results.push(("returns_log".to_string(), log_ret.clone()));
    results.push(("returns_simple".to_string(), simple_ret));
    results.push(("range".to_string(), range));
    results.push(("true_range".to_string(), tr.clone()));

    for window in [20, 50, 200] {
        results.push((format!("sma_{window}"), rolling_mean(close, window)));
    }
    for span in [20, 50, 200] {
        results.push((format!("ema_{span}"), ema(close, span)));
    }
    for window in [20, 50] {
        results.push((format!("volatility_{window}"), rolling_std(&log_ret, window)));
    }
    for window in [14, 20] {
        results.push((format!("atr_{window}"), rolling_mean(&tr, window)));
    }
    for window in [20, 50] {
        results.push((format!("rolling_max_{window}"), rolling_max(high, window)));
        results.push((format!("rolling_min_{window}"), rolling_min(low, window)));
    }
    for window in [20, 50] {
        results.push((format!("donchian_upper_{window}"), rolling_max(high, window)));
        results.push((format!("donchian_lower_{window}"), rolling_min(low, window)));
    }

    match selected {
        Some(names) => results
            .into_iter()
            .filter(|(name, _)| names.iter().any(|s| s == name))
            .collect(),
        None => results,
    }
}

/// Load candles, compute the metric set, and upsert every value into the
/// derived metric store keyed by (symbol, interval, open_time, name).
pub async fn compute_and_store_metrics(
    db: &Database,
    symbol: &str,
    interval: Interval,
    selected: Option<&[String]>,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
) -> Result<MetricsReport> {
    let frame = db.load_frame(symbol, interval, start_ms, end_ms).await?;
    if frame.is_empty() {
        return Ok(MetricsReport {
            status: "no_data",
            metrics_computed: 0,
            rows: 0,
            metric_names: Vec::new(),
        });
    }

    let metrics = compute_metrics(&frame, selected);

    let mut total_rows = 0;
    for (name, values) in &metrics {
        let records: Vec<(i64, String, Option<f64>)> = frame
            .open_time
            .iter()
            .zip(values.iter())
            .map(|(&open_time, &value)| {
                let stored = (!value.is_nan()).then_some(value);
                (open_time, name.clone(), stored)
            })
            .collect();
        db.upsert_derived_metrics(symbol, interval, &records).await?;
        total_rows += records.len();
    }

    Ok(MetricsReport {
        status: "ok",
        metrics_computed: metrics.len(),
        rows: total_rows,
        metric_names: metrics.iter().map(|(name, _)| name.clone()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandleRow;

    fn frame_of(closes: &[f64]) -> CandleFrame {
        let mut frame = CandleFrame::default();
        for (i, &close) in closes.iter().enumerate() {
            frame.push(CandleRow {
                open_time: i as i64 * 60_000,
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1.0,
            });
        }
        frame
    }

    #[test]
    fn test_all_metric_names_present() {
        let frame = frame_of(&vec![100.0; 25]);
        let metrics = compute_metrics(&frame, None);
        let names: Vec<&str> = metrics.iter().map(|(n, _)| n.as_str()).collect();

        for expected in [
            "returns_log",
            "returns_simple",
            "range",
            "true_range",
            "sma_20",
            "sma_200",
            "ema_50",
            "volatility_20",
            "atr_14",
            "rolling_max_50",
            "rolling_min_20",
            "donchian_upper_20",
            "donchian_lower_50",
        ] {
            assert!(names.contains(&expected), "missing metric {expected}");
        }
    }

    #[test]
    fn test_warmup_is_nan_then_values_appear() {
        let frame = frame_of(&vec![100.0; 25]);
        let metrics = compute_metrics(&frame, None);
        let sma_20 = &metrics.iter().find(|(n, _)| n == "sma_20").unwrap().1;

        assert!(sma_20[18].is_nan());
        assert!((sma_20[19] - 100.0).abs() < 1e-9);

        let returns = &metrics.iter().find(|(n, _)| n == "returns_log").unwrap().1;
        assert!(returns[0].is_nan());
        assert_eq!(returns[1], 0.0);
    }

    #[test]
    fn test_selected_filters_by_exact_name() {
        let frame = frame_of(&vec![100.0; 25]);
        let selected = vec!["sma_20".to_string(), "atr_14".to_string()];
        let metrics = compute_metrics(&frame, Some(&selected));

        let names: Vec<&str> = metrics.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["sma_20", "atr_14"]);
    }

    #[test]
    fn test_range_uses_high_minus_low() {
        let frame = frame_of(&[100.0, 102.0]);
        let metrics = compute_metrics(&frame, None);
        let range = &metrics.iter().find(|(n, _)| n == "range").unwrap().1;
        // high - low = 2.0 with the +-1 synthetic bars
        assert_eq!(range[0], 2.0);
        assert_eq!(range[1], 2.0);
    }

    #[tokio::test]
    async fn test_store_reports_no_data_on_empty_range() {
        let db = Database::in_memory().await.unwrap();
        let report = compute_and_store_metrics(&db, "BTCUSDT", Interval::H1, None, None, None)
            .await
            .unwrap();
        assert_eq!(report.status, "no_data");
        assert_eq!(report.rows, 0);
    }

    #[tokio::test]
    async fn test_store_writes_rows_for_each_metric() {
        use crate::database::klines::test_support::make_candle;

        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();
        let candles: Vec<_> = (0..30).map(|i| make_candle("BTCUSDT", Interval::H1, i * step)).collect();
        db.upsert_candles(&candles).await.unwrap();

        let selected = vec!["sma_20".to_string()];
        let report = compute_and_store_metrics(&db, "BTCUSDT", Interval::H1, Some(&selected), None, None)
            .await
            .unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.metrics_computed, 1);
        assert_eq!(report.rows, 30);

        let counts = db.derived_metric_counts("BTCUSDT", Interval::H1).await.unwrap();
        assert_eq!(counts.get("sma_20"), Some(&30));
    }
}
