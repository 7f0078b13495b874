use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::database::trades::SignalConfig;
use crate::database::{now_ms, Database};
use crate::engine::download::DownloadEngine;
use crate::error::Result;
use crate::strategies::create_strategy;
use crate::types::{PositionState, Side};

/// Scanner cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(15);

/// Candles loaded ahead of the target for strategy warm-up.
const WARMUP_CANDLES: i64 = 600;

/// Minimum historical range guaranteeing reliable signals (365 days).
const MIN_HISTORY_MS: i64 = 365 * 86_400_000;

/// Derive (invested_amount, leverage) from a config. The two are mutually
/// derivable; with neither given, leverage defaults to 1.
pub fn resolve_position_size(config: &SignalConfig) -> (f64, f64) {
    if let Some(invested) = config.invested_amount {
        let leverage = if config.portfolio > 0.0 {
            invested / config.portfolio
        } else {
            1.0
        };
        (invested, leverage)
    } else if let Some(leverage) = config.leverage {
        (config.portfolio * leverage, leverage)
    } else {
        (config.portfolio, 1.0)
    }
}

/// Adjusted stop: the base stop widened by the configured cross band.
pub fn stop_trigger_price(side: Side, stop_price: f64, stop_cross_pct: f64) -> f64 {
    match side {
        Side::Long => stop_price * (1.0 - stop_cross_pct),
        Side::Short => stop_price * (1.0 + stop_cross_pct),
    }
}

/// Periodic entry-signal scanner over all active configs.
pub struct SignalScanner {
    db: Database,
    downloads: Arc<DownloadEngine>,
}

impl SignalScanner {
    pub fn new(db: Database, downloads: Arc<DownloadEngine>) -> Self {
        Self { db, downloads }
    }

    /// Cooperative loop: scan every active config, then sleep, responding
    /// to shutdown at the sleep point. Per-config errors never kill the
    /// loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Signal scanner started");
        loop {
            match self.db.active_configs().await {
                Ok(configs) => {
                    for config in configs {
                        if let Err(err) = self.scan_config(&config).await {
                            error!("Error scanning config {}: {}", config.id, err);
                        }
                    }
                }
                Err(err) => error!("Signal scanner loop error: {}", err),
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Signal scanner stopped");
                    return;
                }
                _ = tokio::time::sleep(SCAN_INTERVAL) => {}
            }
        }
    }

    /// Scan one config against the latest fully closed candle.
    pub async fn scan_config(&self, config: &SignalConfig) -> Result<()> {
        self.scan_config_at(config, now_ms()).await
    }

    /// Scan with an explicit clock. Any skip leaves the watermark
    /// unadvanced so the candle is re-examined next cycle.
    pub async fn scan_config_at(&self, config: &SignalConfig, now_ms: i64) -> Result<()> {
        let interval = config.interval()?;
        let step = interval.step_ms();

        let target = interval.last_closed_open(now_ms);
        if target <= config.last_processed_candle {
            return Ok(()); // already processed
        }

        // 600-candle warm-up or one calendar year, whichever is longer
        let warmup_start = target - WARMUP_CANDLES * step;
        let history_start = target - MIN_HISTORY_MS;
        let start_ms = warmup_start.min(history_start);
        let end_ms = target + step;

        if !self
            .downloads
            .ensure_candles(&config.symbol, interval, start_ms, end_ms)
            .await?
        {
            info!(
                "ensure_candles: data sync in progress for {} {}, skipping scan cycle",
                config.symbol, interval
            );
            return Ok(());
        }

        let frame = self
            .db
            .load_frame(&config.symbol, interval, Some(start_ms), Some(end_ms))
            .await?;
        if frame.len() < 2 {
            warn!("Insufficient candle data for scan: {} {}", config.symbol, interval);
            return Ok(());
        }
        if frame.last_open_time() != Some(target) {
            warn!(
                "Last closed candle {} not in store for {} {} (latest: {:?}). Skipping.",
                target,
                config.symbol,
                interval,
                frame.last_open_time()
            );
            return Ok(());
        }

        let mut strategy = create_strategy(&config.strategy)?;
        strategy.init(&config.params_value(), &frame)?;

        let t_last = frame.len() - 1;
        let row = frame.row(t_last);
        // always flat: the scanner only looks for entries
        let signals = strategy.on_candle(t_last, &row, &PositionState::flat());

        for signal in signals {
            let Some(side) = signal.action.entry_side() else {
                continue;
            };
            let (invested_amount, leverage) = resolve_position_size(config);
            let stop_trigger = stop_trigger_price(side, signal.stop_price, config.stop_cross_pct);

            match self
                .db
                .emit_signal_with_trade(
                    config,
                    side,
                    target,
                    signal.stop_price,
                    stop_trigger,
                    invested_amount,
                    leverage,
                )
                .await?
            {
                Some(signal_id) => info!(
                    "Signal created: id={} config={} side={} candle={} stop={:.6} trigger={:.6}",
                    signal_id, config.id, side, target, signal.stop_price, stop_trigger
                ),
                None => debug!("Duplicate signal for config {} candle {}", config.id, target),
            }
            break; // one signal per scan cycle
        }

        self.db.set_last_processed(config.id, target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::klines::test_support::make_candle_with_ohlc;
    use crate::database::trades::test_support::new_config;
    use crate::exchange::BinanceClient;
    use crate::types::{Interval, SignalStatus, TradeStatus};

    fn scanner_for(db: &Database) -> SignalScanner {
        let downloads = DownloadEngine::new(db.clone(), Arc::new(BinanceClient::new()));
        SignalScanner::new(db.clone(), downloads)
    }

    fn config_with(
        invested_amount: Option<f64>,
        leverage: Option<f64>,
    ) -> crate::database::trades::NewSignalConfig {
        let mut config = new_config("BTCUSDT", "1h", "breakout");
        config.invested_amount = invested_amount;
        config.leverage = leverage;
        config
    }

    async fn insert_config(
        db: &Database,
        config: &crate::database::trades::NewSignalConfig,
    ) -> SignalConfig {
        let id = db.insert_config(config).await.unwrap();
        db.get_config(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_leverage_derivation() {
        let db = Database::in_memory().await.unwrap();

        // leverage given: invested = portfolio * leverage
        let config = insert_config(&db, &config_with(None, Some(2.0))).await;
        assert_eq!(resolve_position_size(&config), (20_000.0, 2.0));

        // invested given: leverage = invested / portfolio
        let config = insert_config(&db, &{
            let mut c = config_with(Some(5_000.0), None);
            c.symbol = "ETHUSDT".to_string();
            c
        })
        .await;
        assert_eq!(resolve_position_size(&config), (5_000.0, 0.5));

        // neither given: leverage 1, invested = portfolio
        let config = insert_config(&db, &{
            let mut c = config_with(None, None);
            c.symbol = "SOLUSDT".to_string();
            c
        })
        .await;
        assert_eq!(resolve_position_size(&config), (10_000.0, 1.0));
    }

    #[test]
    fn test_stop_trigger_band() {
        assert!((stop_trigger_price(Side::Long, 95.0, 0.02) - 93.1).abs() < 1e-9);
        assert!((stop_trigger_price(Side::Short, 105.0, 0.02) - 107.1).abs() < 1e-9);
    }

    /// Insert a fully populated window so ensure_candles passes, with a
    /// breakout on the last closed candle.
    async fn seed_breakout_window(db: &Database, now_ms: i64) -> i64 {
        let step = Interval::H1.step_ms();
        let target = Interval::H1.last_closed_open(now_ms);
        let start = (target - WARMUP_CANDLES * step).min(target - MIN_HISTORY_MS);

        let mut candles = Vec::new();
        let mut open_time = start;
        while open_time <= target {
            let candle = if open_time == target {
                make_candle_with_ohlc("BTCUSDT", Interval::H1, open_time, 100.0, 200.0, 100.0, 200.0)
            } else {
                make_candle_with_ohlc("BTCUSDT", Interval::H1, open_time, 100.0, 101.0, 99.0, 100.0)
            };
            candles.push(candle);
            open_time += step;
        }
        db.upsert_candles(&candles).await.unwrap();
        target
    }

    #[tokio::test]
    async fn test_scan_emits_signal_and_advances_watermark() {
        let db = Database::in_memory().await.unwrap();
        let scanner = scanner_for(&db);

        let step = Interval::H1.step_ms();
        let now = 10_000 * step + 1_800_000; // mid-candle
        let target = seed_breakout_window(&db, now).await;

        let config = insert_config(&db, &config_with(None, Some(1.0))).await;
        scanner.scan_config_at(&config, now).await.unwrap();

        let signals = db.list_signals(Some(config.id), None, 10).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal.side, Side::Long);
        assert_eq!(signals[0].signal.trigger_candle_time, target);
        assert_eq!(signals[0].signal.status, SignalStatus::Pending);
        // stop = min_prev * (1 - stop_pct) = 99 * 0.98, trigger widened 2%
        assert!((signals[0].signal.stop_price - 99.0 * 0.98).abs() < 1e-6);
        assert!((signals[0].signal.stop_trigger_price - 99.0 * 0.98 * 0.98).abs() < 1e-6);

        let trades = db.list_sim_trades(Some(config.id), None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::PendingEntry);

        let updated = db.get_config(config.id).await.unwrap().unwrap();
        assert_eq!(updated.last_processed_candle, target);
    }

    #[tokio::test]
    async fn test_rescan_with_no_new_candle_emits_nothing() {
        let db = Database::in_memory().await.unwrap();
        let scanner = scanner_for(&db);

        let step = Interval::H1.step_ms();
        let now = 10_000 * step + 1_800_000;
        seed_breakout_window(&db, now).await;

        let config = insert_config(&db, &config_with(None, Some(1.0))).await;
        scanner.scan_config_at(&config, now).await.unwrap();

        // second scan at the same clock: watermark already at target
        let config = db.get_config(config.id).await.unwrap().unwrap();
        scanner.scan_config_at(&config, now).await.unwrap();

        let signals = db.list_signals(Some(config.id), None, 10).await.unwrap();
        assert_eq!(signals.len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_after_watermark_reset_is_deduped() {
        let db = Database::in_memory().await.unwrap();
        let scanner = scanner_for(&db);

        let step = Interval::H1.step_ms();
        let now = 10_000 * step + 1_800_000;
        seed_breakout_window(&db, now).await;

        let config = insert_config(&db, &config_with(None, Some(1.0))).await;
        scanner.scan_config_at(&config, now).await.unwrap();

        // force a re-evaluation of the same candle: the unique index makes
        // the second emission an idempotent no-op
        db.set_last_processed(config.id, 0).await.unwrap();
        let config = db.get_config(config.id).await.unwrap().unwrap();
        scanner.scan_config_at(&config, now).await.unwrap();

        let signals = db.list_signals(Some(config.id), None, 10).await.unwrap();
        assert_eq!(signals.len(), 1);
        let trades = db.list_sim_trades(Some(config.id), None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_skips_when_last_candle_missing() {
        let db = Database::in_memory().await.unwrap();
        let scanner = scanner_for(&db);

        let step = Interval::H1.step_ms();
        let now = 10_000 * step + 1_800_000;
        let target = seed_breakout_window(&db, now).await;

        let config = insert_config(&db, &config_with(None, Some(1.0))).await;

        // pretend time advanced one candle: the store lacks the new target
        let later = now + step;
        scanner.scan_config_at(&config, later).await.unwrap();

        // nothing emitted, watermark unadvanced (skip, not block)
        assert!(db.list_signals(Some(config.id), None, 10).await.unwrap().is_empty());
        let config = db.get_config(config.id).await.unwrap().unwrap();
        assert!(config.last_processed_candle < target + step);
    }
}
