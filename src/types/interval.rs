use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const MS_PER_MINUTE: i64 = 60_000;
pub const MS_PER_HOUR: i64 = 3_600_000;
pub const MS_PER_DAY: i64 = 86_400_000;

/// Candle interval with a fixed millisecond step.
///
/// `1M` is approximated as 30 days; upstream uses calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    pub fn all() -> [Interval; 15] {
        [
            Interval::M1,
            Interval::M3,
            Interval::M5,
            Interval::M15,
            Interval::M30,
            Interval::H1,
            Interval::H2,
            Interval::H4,
            Interval::H6,
            Interval::H8,
            Interval::H12,
            Interval::D1,
            Interval::D3,
            Interval::W1,
            Interval::Mo1,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// Candle duration in milliseconds.
    pub fn step_ms(&self) -> i64 {
        match self {
            Interval::M1 => MS_PER_MINUTE,
            Interval::M3 => 3 * MS_PER_MINUTE,
            Interval::M5 => 5 * MS_PER_MINUTE,
            Interval::M15 => 15 * MS_PER_MINUTE,
            Interval::M30 => 30 * MS_PER_MINUTE,
            Interval::H1 => MS_PER_HOUR,
            Interval::H2 => 2 * MS_PER_HOUR,
            Interval::H4 => 4 * MS_PER_HOUR,
            Interval::H6 => 6 * MS_PER_HOUR,
            Interval::H8 => 8 * MS_PER_HOUR,
            Interval::H12 => 12 * MS_PER_HOUR,
            Interval::D1 => MS_PER_DAY,
            Interval::D3 => 3 * MS_PER_DAY,
            Interval::W1 => 7 * MS_PER_DAY,
            Interval::Mo1 => 30 * MS_PER_DAY,
        }
    }

    /// Open time (ms) of the candle containing `now_ms`.
    pub fn current_candle_open(&self, now_ms: i64) -> i64 {
        (now_ms / self.step_ms()) * self.step_ms()
    }

    /// Open time (ms) of the most recently fully closed candle.
    pub fn last_closed_open(&self, now_ms: i64) -> i64 {
        self.current_candle_open(now_ms) - self.step_ms()
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::M1),
            "3m" => Ok(Interval::M3),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "30m" => Ok(Interval::M30),
            "1h" => Ok(Interval::H1),
            "2h" => Ok(Interval::H2),
            "4h" => Ok(Interval::H4),
            "6h" => Ok(Interval::H6),
            "8h" => Ok(Interval::H8),
            "12h" => Ok(Interval::H12),
            "1d" => Ok(Interval::D1),
            "3d" => Ok(Interval::D3),
            "1w" => Ok(Interval::W1),
            "1M" => Ok(Interval::Mo1),
            other => Err(EngineError::BadInterval(other.to_string())),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_intervals() {
        for interval in Interval::all() {
            let parsed: Interval = interval.as_str().parse().unwrap();
            assert_eq!(parsed, interval);
        }
    }

    #[test]
    fn test_step_values() {
        assert_eq!(Interval::M1.step_ms(), 60_000);
        assert_eq!(Interval::H1.step_ms(), 3_600_000);
        assert_eq!(Interval::D1.step_ms(), 86_400_000);
        assert_eq!(Interval::W1.step_ms(), 7 * 86_400_000);
        // 1M is approximated at 30 days
        assert_eq!(Interval::Mo1.step_ms(), 30 * 86_400_000);
    }

    #[test]
    fn test_unknown_interval_fails() {
        let err = "7m".parse::<Interval>().unwrap_err();
        assert!(matches!(err, EngineError::BadInterval(_)));
    }

    #[test]
    fn test_last_closed_open() {
        let step = Interval::H1.step_ms();
        // 90 minutes past epoch: current candle opened at 60m, last closed at 0
        let now = 90 * 60_000;
        assert_eq!(Interval::H1.current_candle_open(now), step);
        assert_eq!(Interval::H1.last_closed_open(now), 0);
    }
}
