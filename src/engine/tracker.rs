use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::database::trades::{OpenTrade, PendingEntryTrade, TradeClose};
use crate::database::{now_ms, Database};
use crate::engine::download::DownloadEngine;
use crate::error::Result;
use crate::exchange::BinanceClient;
use crate::strategies::create_strategy;
use crate::types::{Interval, PositionState, Side};

/// Grace period after the expected entry candle opens before falling back
/// to a live ticker price.
const ENTRY_FILL_GRACE_MS: i64 = 5_000;

/// Warm-up candles loaded for candle-close exit evaluation.
const EXIT_WARMUP_CANDLES: i64 = 600;

/// Idle cadence when no trades are live.
const IDLE_POLL_S: u64 = 30;

const POLL_FALLBACK_S: u64 = 120;

/// Default polling cadence per candle interval.
fn default_poll_interval(interval: Interval) -> u64 {
    match interval {
        Interval::H1 | Interval::H2 => 60,
        Interval::H4 | Interval::H6 => 120,
        Interval::H8 | Interval::H12 => 180,
        Interval::D1 | Interval::D3 => 300,
        Interval::W1 | Interval::Mo1 => 600,
        _ => POLL_FALLBACK_S,
    }
}

/// Terminal-state bookkeeping for one closing trade: execution price,
/// signed gross pnl, exit fee, and the pnl percentage over the portfolio.
pub(crate) fn build_trade_close(trade: &OpenTrade, exec_price: f64, exit_time: i64, reason: &str) -> TradeClose {
    let gross = match trade.side {
        Side::Long => trade.quantity * (exec_price - trade.entry_price),
        Side::Short => trade.quantity * (trade.entry_price - exec_price),
    };
    let cost_factor = trade.cost_bps / 10_000.0;
    let exit_fee = (trade.quantity * exec_price).abs() * cost_factor;
    let net = gross - exit_fee;
    let pnl_pct = if trade.portfolio > 0.0 { net / trade.portfolio } else { 0.0 };

    TradeClose {
        exit_price: exec_price,
        exit_time,
        exit_reason: reason.to_string(),
        pnl: net,
        pnl_pct,
        total_fees: trade.fees + exit_fee,
    }
}

/// Tracks live simulated trades: fills pending entries, polls prices for
/// intrabar stops, and evaluates exit signals on each closed candle.
pub struct LiveTracker {
    db: Database,
    client: Arc<BinanceClient>,
    downloads: Arc<DownloadEngine>,
    /// Per-interval watermark of the current candle open, so the
    /// candle-close pass fires once per boundary.
    last_candle_check: Mutex<HashMap<Interval, i64>>,
}

impl LiveTracker {
    pub fn new(db: Database, client: Arc<BinanceClient>, downloads: Arc<DownloadEngine>) -> Self {
        Self {
            db,
            client,
            downloads,
            last_candle_check: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Live tracker started");
        loop {
            if let Err(err) = self.tick().await {
                error!("Live tracker loop error: {}", err);
            }

            let poll = self.poll_interval().await;
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Live tracker stopped");
                    return;
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// One tracker iteration: the three passes in order. Intrabar stops are
    /// always evaluated before candle-close exits.
    pub async fn tick(&self) -> Result<()> {
        self.fill_pending_entries().await?;
        self.check_intrabar_stops().await?;

        let now = now_ms();
        let mut boundary_crossed = false;
        {
            let mut checks = self.last_candle_check.lock().expect("watermark lock");
            for interval in Interval::all() {
                let current_open = interval.current_candle_open(now);
                let entry = checks.entry(interval).or_insert(0);
                if current_open > *entry {
                    *entry = current_open;
                    boundary_crossed = true;
                }
            }
        }
        if boundary_crossed {
            self.check_candle_close_exits(now).await?;
        }

        Ok(())
    }

    /// Tracker cadence: minimum of per-config overrides and per-interval
    /// defaults across live trades; idle cadence with none; doubled when
    /// the upstream weight budget runs hot.
    async fn poll_interval(&self) -> Duration {
        let rows = self.db.live_trade_intervals().await.unwrap_or_default();

        let mut poll = if rows.is_empty() {
            IDLE_POLL_S
        } else {
            rows.iter()
                .map(|(interval, override_s)| match override_s {
                    Some(s) if *s > 0 => *s as u64,
                    _ => interval
                        .parse::<Interval>()
                        .map(default_poll_interval)
                        .unwrap_or(POLL_FALLBACK_S),
                })
                .min()
                .unwrap_or(POLL_FALLBACK_S)
        };

        if self.client.weight_ratio().await > 0.8 {
            poll *= 2;
        }
        Duration::from_secs(poll)
    }

    // ------------------------------------------------------------------
    // Pass (a): pending-entry fill
    // ------------------------------------------------------------------

    /// The entry price is the open of the candle after the trigger candle.
    /// Once that candle is stored, fill from it; past the grace window,
    /// fall back to a live ticker price.
    async fn fill_pending_entries(&self) -> Result<()> {
        let pending = self.db.pending_entry_trades().await?;

        for trade in pending {
            let Ok(interval) = trade.interval.parse::<Interval>() else {
                continue;
            };
            let step = interval.step_ms();
            let expected_open = trade.trigger_candle_time + step;

            // 3-candle window around the trigger; the sync runs detached
            let _ = self
                .downloads
                .ensure_candles(&trade.symbol, interval, trade.trigger_candle_time, expected_open + step)
                .await;

            let entry_price = match self
                .db
                .candle_open_price(&trade.symbol, interval, expected_open)
                .await?
            {
                Some(open) => open,
                None => {
                    if now_ms() < expected_open + ENTRY_FILL_GRACE_MS {
                        continue; // not time yet
                    }
                    match self.client.get_ticker_price(&trade.symbol).await {
                        Ok(price) => price,
                        Err(err) => {
                            warn!("Could not get ticker for pending entry fill: {}", err);
                            continue;
                        }
                    }
                }
            };

            self.fill_entry(&trade, entry_price, expected_open).await?;
        }

        Ok(())
    }

    pub(crate) async fn fill_entry(
        &self,
        trade: &PendingEntryTrade,
        entry_price: f64,
        entry_time: i64,
    ) -> Result<bool> {
        let fee = trade.invested_amount * trade.cost_bps / 10_000.0;
        let quantity = trade.invested_amount / entry_price;

        let filled = self
            .db
            .fill_trade_entry(
                trade.id,
                trade.signal_id,
                entry_price,
                entry_time,
                quantity,
                fee,
                trade.portfolio,
            )
            .await?;

        if filled {
            info!(
                "SimTrade {} filled: {} {} entry={:.6} qty={:.6}",
                trade.id, trade.side, trade.symbol, entry_price, quantity
            );
        }
        Ok(filled)
    }

    // ------------------------------------------------------------------
    // Pass (b): intrabar stop check
    // ------------------------------------------------------------------

    async fn check_intrabar_stops(&self) -> Result<()> {
        let open_trades = self.db.open_trades().await?;
        if open_trades.is_empty() {
            return Ok(());
        }

        // one ticker call per symbol
        let symbols: HashSet<String> = open_trades.iter().map(|t| t.symbol.clone()).collect();
        let mut prices: HashMap<String, f64> = HashMap::new();
        for symbol in symbols {
            match self.client.get_ticker_price(&symbol).await {
                Ok(price) => {
                    prices.insert(symbol, price);
                }
                Err(err) => warn!("Ticker fetch failed for {}: {}", symbol, err),
            }
        }

        let exit_time = now_ms();
        for trade in &open_trades {
            let Some(&price) = prices.get(&trade.symbol) else {
                continue;
            };

            let triggered = match trade.side {
                Side::Long => price <= trade.stop_trigger,
                Side::Short => price >= trade.stop_trigger,
            };
            if triggered {
                self.close_at_intrabar_stop(trade, exit_time).await?;
            }
        }

        Ok(())
    }

    /// Execution is at the stop trigger, not the observed spot: the field
    /// is contractually the limit.
    pub(crate) async fn close_at_intrabar_stop(&self, trade: &OpenTrade, exit_time: i64) -> Result<bool> {
        let close = build_trade_close(trade, trade.stop_trigger, exit_time, "stop_intrabar");
        let closed = self.db.close_trade(trade.id, trade.signal_id, &close).await?;

        if closed {
            info!(
                "SimTrade {} STOPPED: {} {} exec={:.6} pnl={:.4}",
                trade.id, trade.side, trade.symbol, close.exit_price, close.pnl
            );
            let message = format!(
                "Stop hit on {} {} at {:.6}",
                trade.symbol, trade.side, close.exit_price
            );
            self.db
                .insert_notification("stop_hit", "sim_trade", trade.id, &message)
                .await?;

            if trade.portfolio + close.pnl <= 0.0 {
                warn!("SimTrade {}: liquidation event (equity <= 0)", trade.id);
            }
        }
        Ok(closed)
    }

    // ------------------------------------------------------------------
    // Pass (c): candle-close exit check
    // ------------------------------------------------------------------

    async fn check_candle_close_exits(&self, now_ms: i64) -> Result<()> {
        let open_trades = self.db.open_trades().await?;
        if open_trades.is_empty() {
            return Ok(());
        }

        // one strategy evaluation per (symbol, interval, strategy, params)
        let mut groups: HashMap<(String, String, String, String), Vec<OpenTrade>> = HashMap::new();
        for trade in open_trades {
            let key = (
                trade.symbol.clone(),
                trade.interval.clone(),
                trade.strategy.clone(),
                trade.params.clone(),
            );
            groups.entry(key).or_default().push(trade);
        }

        for ((symbol, interval_str, strategy_name, params_str), trades) in groups {
            let Ok(interval) = interval_str.parse::<Interval>() else {
                continue;
            };
            let step = interval.step_ms();
            let last_closed = interval.last_closed_open(now_ms);
            let start_ms = last_closed - EXIT_WARMUP_CANDLES * step;
            let end_ms = last_closed + step;

            match self.downloads.ensure_candles(&symbol, interval, start_ms, end_ms).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "live_tracker: data sync in progress for {} {}, skipping exit check",
                        symbol, interval
                    );
                    continue;
                }
                Err(err) => {
                    warn!("live_tracker: ensure failed for {} {}: {}", symbol, interval, err);
                    continue;
                }
            }

            let frame = self.db.load_frame(&symbol, interval, Some(start_ms), Some(end_ms)).await?;
            if frame.len() < 2 || frame.last_open_time() != Some(last_closed) {
                continue;
            }

            let params = serde_json::from_str(&params_str).unwrap_or(serde_json::Value::Null);
            let mut strategy = match create_strategy(&strategy_name) {
                Ok(strategy) => strategy,
                Err(err) => {
                    error!("Strategy init failed for exit check: {}", err);
                    continue;
                }
            };
            if let Err(err) = strategy.init(&params, &frame) {
                error!("Strategy init failed for exit check: {}", err);
                continue;
            }

            let t_last = frame.len() - 1;
            let row = frame.row(t_last);

            for trade in &trades {
                let state = PositionState::open(
                    trade.side,
                    trade.entry_price,
                    trade.entry_time,
                    trade.stop_base,
                    trade.quantity,
                );
                let signals = strategy.on_candle(t_last, &row, &state);

                for signal in signals {
                    if signal.action.is_exit() {
                        self.close_at_exit_signal(trade, row.close, row.open_time).await?;
                        break;
                    }
                    if signal.action.is_stop() {
                        self.close_at_candle_stop(trade, row.open, row.open_time).await?;
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    pub(crate) async fn close_at_exit_signal(&self, trade: &OpenTrade, exec_price: f64, exit_time: i64) -> Result<bool> {
        let close = build_trade_close(trade, exec_price, exit_time, "exit_signal");
        let closed = self.db.close_trade(trade.id, trade.signal_id, &close).await?;

        if closed {
            info!(
                "SimTrade {} EXIT: {} {} exec={:.6} pnl={:.4}",
                trade.id, trade.side, trade.symbol, close.exit_price, close.pnl
            );
            let message = format!(
                "Exit signal on {} {} at {:.6}",
                trade.symbol, trade.side, close.exit_price
            );
            self.db
                .insert_notification("exit_signal", "sim_trade", trade.id, &message)
                .await?;
        }
        Ok(closed)
    }

    /// Candle-detected stop, the fallback when the intrabar poll missed it.
    /// Executes at the trigger unless the bar opened gapped past it, in
    /// which case the open is the fill.
    pub(crate) async fn close_at_candle_stop(&self, trade: &OpenTrade, open_price: f64, exit_time: i64) -> Result<bool> {
        let mut exec_price = trade.stop_trigger;
        match trade.side {
            Side::Long if open_price < exec_price => exec_price = open_price,
            Side::Short if open_price > exec_price => exec_price = open_price,
            _ => {}
        }

        let close = build_trade_close(trade, exec_price, exit_time, "stop_intrabar");
        let closed = self.db.close_trade(trade.id, trade.signal_id, &close).await?;

        if closed {
            info!(
                "SimTrade {} STOP (candle): {} {} exec={:.6} pnl={:.4}",
                trade.id, trade.side, trade.symbol, close.exit_price, close.pnl
            );
            let message = format!(
                "Stop hit (candle) on {} {} at {:.6}",
                trade.symbol, trade.side, close.exit_price
            );
            self.db
                .insert_notification("stop_hit", "sim_trade", trade.id, &message)
                .await?;
        }
        Ok(closed)
    }
}
