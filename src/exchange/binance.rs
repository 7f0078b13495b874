use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::{EngineError, Result};
use crate::types::{Candle, Interval};

const BINANCE_BASE_URL: &str = "https://api.binance.com";
const KLINES_ENDPOINT: &str = "/api/v3/klines";
const TICKER_ENDPOINT: &str = "/api/v3/ticker/price";

/// Binance public endpoint weight budget per minute.
pub const WEIGHT_LIMIT_PER_MINUTE: u32 = 1200;

/// Minimum pacing between two requests.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

const MAX_RETRIES: u32 = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Rate-limit bookkeeping. Mutated only while the client's request lock is
/// held, so pacing and header parsing are atomic with the request itself.
#[derive(Debug)]
pub struct RateLimitState {
    pub used_weight: u32,
    pub weight_limit: u32,
    pub last_request_time: Instant,
    pub blocked_until: Option<Instant>,
    pub backoff_until: Option<Instant>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            used_weight: 0,
            weight_limit: WEIGHT_LIMIT_PER_MINUTE,
            last_request_time: Instant::now(),
            blocked_until: None,
            backoff_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Ok,
    Warning,
    Backoff,
    Blocked,
}

impl RateLimitState {
    pub fn status(&self) -> ClientStatus {
        let now = Instant::now();
        if self.blocked_until.is_some_and(|t| t > now) {
            return ClientStatus::Blocked;
        }
        if self.backoff_until.is_some_and(|t| t > now) {
            return ClientStatus::Backoff;
        }
        let ratio = self.used_weight as f64 / self.weight_limit.max(1) as f64;
        if ratio >= 0.9 {
            ClientStatus::Warning
        } else {
            ClientStatus::Ok
        }
    }

    pub fn weight_ratio(&self) -> f64 {
        self.used_weight as f64 / self.weight_limit.max(1) as f64
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now = Instant::now();
        let remaining = |deadline: Option<Instant>| {
            deadline
                .and_then(|t| t.checked_duration_since(now))
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        };
        RateLimitSnapshot {
            used_weight: self.used_weight,
            weight_limit: self.weight_limit,
            status: self.status(),
            blocked_for_s: remaining(self.blocked_until),
            backoff_for_s: remaining(self.backoff_until),
        }
    }
}

/// Serializable view of the rate-limit state for the API.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight: u32,
    pub weight_limit: u32,
    pub status: ClientStatus,
    pub blocked_for_s: f64,
    pub backoff_for_s: f64,
}

/// Market-data client with weight accounting and retry/backoff handling.
/// All outbound requests are serialized on one lock.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    state: Mutex<RateLimitState>,
}

impl BinanceClient {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            base_url,
            state: Mutex::new(RateLimitState::default()),
        }
    }

    pub async fn rate_limit_snapshot(&self) -> RateLimitSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn weight_ratio(&self) -> f64 {
        self.state.lock().await.weight_ratio()
    }

    /// Fetch raw klines. Each element is the upstream 12-field array.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Vec<serde_json::Value>>> {
        let mut query: Vec<(String, String)> = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.as_str().to_string()),
            ("limit".to_string(), limit.min(500).to_string()),
        ];
        if let Some(start) = start_ms {
            query.push(("startTime".to_string(), start.to_string()));
        }
        if let Some(end) = end_ms {
            query.push(("endTime".to_string(), end.to_string()));
        }

        let value = self.request_json(KLINES_ENDPOINT, &query).await?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    /// Current spot price for a single symbol.
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<f64> {
        let query = vec![("symbol".to_string(), symbol.to_string())];
        let value = self.request_json(TICKER_ENDPOINT, &query).await?;
        value
            .get("price")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| EngineError::UpstreamUnavailable(format!("malformed ticker payload for {symbol}")))
    }

    /// Issue one GET with the full rate-limit contract: wait out block and
    /// backoff deadlines, enforce pacing, parse the weight header, and retry
    /// on 429/418/timeout up to the attempt budget.
    async fn request_json(&self, path: &str, query: &[(String, String)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..MAX_RETRIES {
            let mut state = self.state.lock().await;
            wait_for_rate_limit(&mut state).await;

            let response = match self.http.get(&url).query(query).send().await {
                Ok(resp) => resp,
                Err(err) if err.is_timeout() => {
                    let backoff = exponential_backoff(attempt);
                    warn!(
                        "timeout on attempt {}, retrying in {:.1}s: {}",
                        attempt + 1,
                        backoff.as_secs_f64(),
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) => return Err(EngineError::Http(err)),
            };

            state.last_request_time = Instant::now();
            if let Some(weight) = parse_used_weight(response.headers()) {
                state.used_weight = weight;
            }

            match response.status().as_u16() {
                200 => {
                    let value: serde_json::Value = response.json().await?;
                    return Ok(value);
                }
                429 => {
                    let retry_after = parse_retry_after(response.headers()).unwrap_or(0.0);
                    let backoff = Duration::from_secs_f64(retry_after).max(exponential_backoff(attempt));
                    state.backoff_until = Some(Instant::now() + backoff);
                    warn!(
                        "429 received, backing off {:.1}s (attempt {})",
                        backoff.as_secs_f64(),
                        attempt + 1
                    );
                    tokio::time::sleep(backoff).await;
                }
                418 => {
                    let retry_after = parse_retry_after(response.headers()).unwrap_or(60.0);
                    let block = Duration::from_secs_f64(retry_after);
                    state.blocked_until = Some(Instant::now() + block);
                    error!("418 IP banned for {:.0}s", retry_after);
                    tokio::time::sleep(block).await;
                }
                status => {
                    return Err(EngineError::UpstreamUnavailable(format!(
                        "unexpected HTTP {status} from {path}"
                    )));
                }
            }
        }

        Err(EngineError::UpstreamUnavailable(format!(
            "failed to fetch {path} after {MAX_RETRIES} attempts"
        )))
    }
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Suspend until block/backoff deadlines pass, then enforce minimum pacing.
async fn wait_for_rate_limit(state: &mut RateLimitState) {
    if let Some(deadline) = state.blocked_until {
        let now = Instant::now();
        if deadline > now {
            let wait = deadline - now;
            warn!("rate limited (418): waiting {:.1}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    if let Some(deadline) = state.backoff_until {
        let now = Instant::now();
        if deadline > now {
            let wait = deadline - now;
            warn!("backoff (429): waiting {:.1}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    let elapsed = state.last_request_time.elapsed();
    if elapsed < MIN_REQUEST_INTERVAL {
        tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
    }
}

fn parse_used_weight(headers: &reqwest::header::HeaderMap) -> Option<u32> {
    headers
        .get("X-MBX-USED-WEIGHT-1M")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<f64> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Exponential backoff with jitter: `min(1s * 2^attempt, 60s)` scaled by a
/// uniform factor in [0.5, 1.0).
pub fn exponential_backoff(attempt: u32) -> Duration {
    let capped = (2.0_f64.powi(attempt as i32)).min(60.0);
    let jitter = 0.5 + rand::random::<f64>() * 0.5;
    Duration::from_secs_f64(capped * jitter)
}

/// Convert one raw upstream kline array into a storage candle.
pub fn parse_candle(
    raw: &[serde_json::Value],
    symbol: &str,
    interval: Interval,
    downloaded_at: &str,
) -> Candle {
    let as_str = |i: usize| raw.get(i).and_then(|v| v.as_str()).unwrap_or("0").to_string();
    let as_i64 = |i: usize| raw.get(i).and_then(|v| v.as_i64()).unwrap_or(0);

    Candle {
        symbol: symbol.to_string(),
        interval,
        open_time: as_i64(0),
        open: as_str(1),
        high: as_str(2),
        low: as_str(3),
        close: as_str(4),
        volume: as_str(5),
        close_time: as_i64(6),
        quote_asset_volume: as_str(7),
        number_of_trades: as_i64(8),
        taker_buy_base_vol: as_str(9),
        taker_buy_quote_vol: as_str(10),
        ignore_field: raw.get(11).and_then(|v| v.as_str()).map(|s| s.to_string()),
        source: "binance_spot".to_string(),
        downloaded_at: downloaded_at.to_string(),
    }
}

/// OHLC sanity check. Candles failing this are dropped with a warning and
/// never abort ingestion.
pub fn validate_candle(candle: &Candle) -> bool {
    let parse = |s: &str| s.parse::<f64>().ok();
    match (
        parse(&candle.open),
        parse(&candle.high),
        parse(&candle.low),
        parse(&candle.close),
    ) {
        (Some(o), Some(h), Some(l), Some(c)) => h >= o.max(c) && l <= o.min(c) && l > 0.0 && h > 0.0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_kline() -> Vec<serde_json::Value> {
        vec![
            json!(1_700_000_000_000_i64),
            json!("42000.10"),
            json!("42500.00"),
            json!("41900.00"),
            json!("42250.55"),
            json!("123.45"),
            json!(1_700_003_599_999_i64),
            json!("5200000.00"),
            json!(9876),
            json!("60.00"),
            json!("2500000.00"),
            json!("0"),
        ]
    }

    #[test]
    fn test_parse_candle_preserves_strings() {
        let candle = parse_candle(&raw_kline(), "BTCUSDT", Interval::H1, "2025-01-01T00:00:00Z");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.open, "42000.10");
        assert_eq!(candle.close, "42250.55");
        assert_eq!(candle.number_of_trades, 9876);
        assert_eq!(candle.source, "binance_spot");
    }

    #[test]
    fn test_validate_candle() {
        let mut candle = parse_candle(&raw_kline(), "BTCUSDT", Interval::H1, "2025-01-01T00:00:00Z");
        assert!(validate_candle(&candle));

        // high below close fails the sanity check
        candle.high = "42000.00".to_string();
        assert!(!validate_candle(&candle));

        candle.high = "42500.00".to_string();
        candle.low = "0".to_string();
        assert!(!validate_candle(&candle));

        candle.low = "garbage".to_string();
        assert!(!validate_candle(&candle));
    }

    #[test]
    fn test_backoff_bounds() {
        for attempt in 0..10 {
            let capped = (2.0_f64.powi(attempt)).min(60.0);
            let delay = exponential_backoff(attempt as u32).as_secs_f64();
            assert!(delay >= capped * 0.5 - 1e-9);
            assert!(delay < capped + 1e-9);
        }
    }

    #[test]
    fn test_status_thresholds() {
        let mut state = RateLimitState::default();
        assert_eq!(state.status(), ClientStatus::Ok);

        state.used_weight = 1080; // 90% of 1200
        assert_eq!(state.status(), ClientStatus::Warning);

        state.backoff_until = Some(Instant::now() + Duration::from_secs(5));
        assert_eq!(state.status(), ClientStatus::Backoff);

        state.blocked_until = Some(Instant::now() + Duration::from_secs(5));
        assert_eq!(state.status(), ClientStatus::Blocked);
    }

    #[test]
    fn test_snapshot_reports_remaining_seconds() {
        let state = RateLimitState {
            backoff_until: Some(Instant::now() + Duration::from_secs(10)),
            ..RateLimitState::default()
        };
        let snap = state.snapshot();
        assert!(snap.backoff_for_s > 9.0 && snap.backoff_for_s <= 10.0);
        assert_eq!(snap.blocked_for_s, 0.0);
    }
}
