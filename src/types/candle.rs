use serde::{Deserialize, Serialize};

use super::Interval;

/// One stored kline row. Price and volume fields keep the exact strings
/// received from upstream; numeric work happens on a [`CandleFrame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_asset_volume: String,
    pub number_of_trades: i64,
    pub taker_buy_base_vol: String,
    pub taker_buy_quote_vol: String,
    pub ignore_field: Option<String>,
    pub source: String,
    pub downloaded_at: String,
}

/// Columnar view of a candle range, loaded from the store with numeric
/// coercion. Unparsable values become NaN.
#[derive(Debug, Clone, Default)]
pub struct CandleFrame {
    pub open_time: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

/// One row of a [`CandleFrame`].
#[derive(Debug, Clone, Copy)]
pub struct CandleRow {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl CandleFrame {
    pub fn len(&self) -> usize {
        self.open_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open_time.is_empty()
    }

    pub fn row(&self, t: usize) -> CandleRow {
        CandleRow {
            open_time: self.open_time[t],
            open: self.open[t],
            high: self.high[t],
            low: self.low[t],
            close: self.close[t],
            volume: self.volume[t],
        }
    }

    pub fn last_open_time(&self) -> Option<i64> {
        self.open_time.last().copied()
    }

    pub fn push(&mut self, row: CandleRow) {
        self.open_time.push(row.open_time);
        self.open.push(row.open);
        self.high.push(row.high);
        self.low.push(row.low);
        self.close.push(row.close);
        self.volume.push(row.volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rows() {
        let mut frame = CandleFrame::default();
        frame.push(CandleRow {
            open_time: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        });
        frame.push(CandleRow {
            open_time: 60_000,
            open: 1.5,
            high: 2.5,
            low: 1.0,
            close: 2.0,
            volume: 12.0,
        });

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.last_open_time(), Some(60_000));
        let row = frame.row(1);
        assert_eq!(row.close, 2.0);
    }
}
