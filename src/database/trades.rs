use serde::Serialize;
use sqlx::Row;

use super::{now_iso, Database};
use crate::error::{is_unique_violation, EngineError, Result};
use crate::types::{Interval, Side, SignalStatus, TradeStatus};

/// One signal_configs row.
#[derive(Debug, Clone, Serialize)]
pub struct SignalConfig {
    pub id: i64,
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
    /// Canonical (sorted-key) JSON, opaque to the engine.
    pub params: String,
    pub stop_cross_pct: f64,
    pub portfolio: f64,
    pub invested_amount: Option<f64>,
    pub leverage: Option<f64>,
    pub cost_bps: f64,
    pub polling_interval_s: Option<i64>,
    pub active: bool,
    pub last_processed_candle: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl SignalConfig {
    pub fn interval(&self) -> Result<Interval> {
        self.interval.parse()
    }

    pub fn params_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.params).unwrap_or(serde_json::Value::Null)
    }
}

/// Insert payload for a new config.
#[derive(Debug, Clone)]
pub struct NewSignalConfig {
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
    pub params: String,
    pub stop_cross_pct: f64,
    pub portfolio: f64,
    pub invested_amount: Option<f64>,
    pub leverage: Option<f64>,
    pub cost_bps: f64,
    pub polling_interval_s: Option<i64>,
}

/// Partial update for a config.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub active: Option<bool>,
    pub stop_cross_pct: Option<f64>,
    pub portfolio: Option<f64>,
    pub invested_amount: Option<f64>,
    pub leverage: Option<f64>,
    pub cost_bps: Option<f64>,
    pub polling_interval_s: Option<i64>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.stop_cross_pct.is_none()
            && self.portfolio.is_none()
            && self.invested_amount.is_none()
            && self.leverage.is_none()
            && self.cost_bps.is_none()
            && self.polling_interval_s.is_none()
    }
}

/// One signals row.
#[derive(Debug, Clone, Serialize)]
pub struct SignalRow {
    pub id: i64,
    pub config_id: i64,
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
    pub side: Side,
    pub trigger_candle_time: i64,
    pub stop_price: f64,
    pub stop_trigger_price: f64,
    pub status: SignalStatus,
    pub created_at: String,
}

/// Signal enriched with its simulated trade for list views.
#[derive(Debug, Clone, Serialize)]
pub struct SignalListItem {
    #[serde(flatten)]
    pub signal: SignalRow,
    pub sim_trade_id: Option<i64>,
    pub entry_price: Option<f64>,
    pub entry_time: Option<i64>,
    pub sim_trade_status: Option<String>,
}

/// One sim_trades row.
#[derive(Debug, Clone, Serialize)]
pub struct SimTrade {
    pub id: i64,
    pub signal_id: i64,
    pub config_id: i64,
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub entry_price: Option<f64>,
    pub entry_time: Option<i64>,
    pub stop_base: f64,
    pub stop_trigger: f64,
    pub exit_price: Option<f64>,
    pub exit_time: Option<i64>,
    pub exit_reason: Option<String>,
    pub status: TradeStatus,
    pub portfolio: f64,
    pub invested_amount: f64,
    pub leverage: f64,
    pub quantity: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub fees: Option<f64>,
    pub equity_peak: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Pending-entry trade joined with its signal and config.
#[derive(Debug, Clone)]
pub struct PendingEntryTrade {
    pub id: i64,
    pub signal_id: i64,
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub portfolio: f64,
    pub invested_amount: f64,
    pub trigger_candle_time: i64,
    pub cost_bps: f64,
}

/// Open trade joined with the strategy context needed for exit evaluation.
#[derive(Debug, Clone)]
pub struct OpenTrade {
    pub id: i64,
    pub signal_id: i64,
    pub config_id: i64,
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_time: i64,
    pub stop_base: f64,
    pub stop_trigger: f64,
    pub quantity: f64,
    pub portfolio: f64,
    pub fees: f64,
    pub strategy: String,
    pub params: String,
    pub cost_bps: f64,
}

/// Values written when a trade reaches a terminal state.
#[derive(Debug, Clone)]
pub struct TradeClose {
    pub exit_price: f64,
    pub exit_time: i64,
    pub exit_reason: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub total_fees: f64,
}

/// Counters for the signals status overview endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SignalsOverview {
    pub active_configs: i64,
    pub open_sim_trades: i64,
    pub pending_sim_trades: i64,
    pub signals_last_24h: i64,
}

/// One real_trades row. The engine never mutates these; they exist for
/// manual sim-vs-real comparison in the UI.
#[derive(Debug, Clone, Serialize)]
pub struct RealTrade {
    pub id: i64,
    pub sim_trade_id: Option<i64>,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub entry_time: String,
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub quantity: f64,
    pub fees: f64,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub notes: Option<String>,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewRealTrade {
    pub sim_trade_id: Option<i64>,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub entry_time: String,
    pub quantity: f64,
    pub fees: f64,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RealTradePatch {
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub fees: Option<f64>,
    pub pnl: Option<f64>,
    pub notes: Option<String>,
    pub status: Option<String>,
}

impl RealTradePatch {
    pub fn is_empty(&self) -> bool {
        self.exit_price.is_none()
            && self.exit_time.is_none()
            && self.fees.is_none()
            && self.pnl.is_none()
            && self.notes.is_none()
            && self.status.is_none()
    }
}

fn config_from_row(row: &sqlx::sqlite::SqliteRow) -> SignalConfig {
    SignalConfig {
        id: row.get("id"),
        symbol: row.get("symbol"),
        interval: row.get("interval"),
        strategy: row.get("strategy"),
        params: row.get("params"),
        stop_cross_pct: row.get("stop_cross_pct"),
        portfolio: row.get("portfolio"),
        invested_amount: row.get("invested_amount"),
        leverage: row.get("leverage"),
        cost_bps: row.get("cost_bps"),
        polling_interval_s: row.get("polling_interval_s"),
        active: row.get::<i64, _>("active") != 0,
        last_processed_candle: row.get::<Option<i64>, _>("last_processed_candle").unwrap_or(0),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn signal_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SignalRow> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    Ok(SignalRow {
        id: row.get("id"),
        config_id: row.get("config_id"),
        symbol: row.get("symbol"),
        interval: row.get("interval"),
        strategy: row.get("strategy"),
        side: side.parse()?,
        trigger_candle_time: row.get("trigger_candle_time"),
        stop_price: row.get("stop_price"),
        stop_trigger_price: row.get("stop_trigger_price"),
        status: status.parse()?,
        created_at: row.get("created_at"),
    })
}

fn sim_trade_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SimTrade> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    Ok(SimTrade {
        id: row.get("id"),
        signal_id: row.get("signal_id"),
        config_id: row.get("config_id"),
        symbol: row.get("symbol"),
        interval: row.get("interval"),
        side: side.parse()?,
        entry_price: row.get("entry_price"),
        entry_time: row.get("entry_time"),
        stop_base: row.get("stop_base"),
        stop_trigger: row.get("stop_trigger"),
        exit_price: row.get("exit_price"),
        exit_time: row.get("exit_time"),
        exit_reason: row.get("exit_reason"),
        status: status.parse()?,
        portfolio: row.get("portfolio"),
        invested_amount: row.get("invested_amount"),
        leverage: row.get("leverage"),
        quantity: row.get("quantity"),
        pnl: row.get("pnl"),
        pnl_pct: row.get("pnl_pct"),
        fees: row.get("fees"),
        equity_peak: row.get("equity_peak"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn real_trade_from_row(row: &sqlx::sqlite::SqliteRow) -> RealTrade {
    RealTrade {
        id: row.get("id"),
        sim_trade_id: row.get("sim_trade_id"),
        signal_id: row.get("signal_id"),
        symbol: row.get("symbol"),
        side: row.get("side"),
        entry_price: row.get("entry_price"),
        entry_time: row.get("entry_time"),
        exit_price: row.get("exit_price"),
        exit_time: row.get("exit_time"),
        quantity: row.get("quantity"),
        fees: row.get::<Option<f64>, _>("fees").unwrap_or(0.0),
        pnl: row.get("pnl"),
        pnl_pct: row.get("pnl_pct"),
        notes: row.get("notes"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Signal configs
    // ------------------------------------------------------------------

    pub async fn insert_config(&self, config: &NewSignalConfig) -> Result<i64> {
        let now = now_iso();
        let result = sqlx::query(
            r#"
            INSERT INTO signal_configs
                (symbol, interval, strategy, params, stop_cross_pct,
                 portfolio, invested_amount, leverage, cost_bps,
                 polling_interval_s, active, last_processed_candle,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?)
            "#,
        )
        .bind(&config.symbol)
        .bind(&config.interval)
        .bind(&config.strategy)
        .bind(&config.params)
        .bind(config.stop_cross_pct)
        .bind(config.portfolio)
        .bind(config.invested_amount)
        .bind(config.leverage)
        .bind(config.cost_bps)
        .bind(config.polling_interval_s)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(err) if is_unique_violation(&err) => Err(EngineError::Conflict(
                "a config with the same symbol/interval/strategy/params already exists".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_configs(&self, active_only: bool) -> Result<Vec<SignalConfig>> {
        let sql = if active_only {
            "SELECT * FROM signal_configs WHERE active = 1 ORDER BY id DESC"
        } else {
            "SELECT * FROM signal_configs ORDER BY id DESC"
        };
        let rows = sqlx::query(sql).fetch_all(self.pool()).await?;
        Ok(rows.iter().map(config_from_row).collect())
    }

    pub async fn active_configs(&self) -> Result<Vec<SignalConfig>> {
        let rows = sqlx::query("SELECT * FROM signal_configs WHERE active = 1 ORDER BY id ASC")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(config_from_row).collect())
    }

    pub async fn get_config(&self, config_id: i64) -> Result<Option<SignalConfig>> {
        let row = sqlx::query("SELECT * FROM signal_configs WHERE id = ?")
            .bind(config_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(config_from_row))
    }

    pub async fn patch_config(&self, config_id: i64, patch: &ConfigPatch) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE signal_configs
            SET active = COALESCE(?, active),
                stop_cross_pct = COALESCE(?, stop_cross_pct),
                portfolio = COALESCE(?, portfolio),
                invested_amount = COALESCE(?, invested_amount),
                leverage = COALESCE(?, leverage),
                cost_bps = COALESCE(?, cost_bps),
                polling_interval_s = COALESCE(?, polling_interval_s),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(patch.active.map(|a| if a { 1i64 } else { 0i64 }))
        .bind(patch.stop_cross_pct)
        .bind(patch.portfolio)
        .bind(patch.invested_amount)
        .bind(patch.leverage)
        .bind(patch.cost_bps)
        .bind(patch.polling_interval_s)
        .bind(now_iso())
        .bind(config_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a config, cascade-closing its dependent open trades and
    /// signals in the same transaction.
    pub async fn delete_config(&self, config_id: i64) -> Result<bool> {
        let now = now_iso();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            UPDATE sim_trades
            SET status = 'closed', exit_reason = 'config_deleted', updated_at = ?
            WHERE config_id = ? AND status IN ('pending_entry', 'open')
            "#,
        )
        .bind(&now)
        .bind(config_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE signals SET status = 'closed' WHERE config_id = ? AND status IN ('pending', 'active')")
            .bind(config_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM signal_configs WHERE id = ?")
            .bind(config_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advance the scanner watermark for a config.
    pub async fn set_last_processed(&self, config_id: i64, candle_time: i64) -> Result<()> {
        sqlx::query("UPDATE signal_configs SET last_processed_candle = ?, updated_at = ? WHERE id = ?")
            .bind(candle_time)
            .bind(now_iso())
            .bind(config_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signal + sim trade emission
    // ------------------------------------------------------------------

    /// Insert a signal and its simulated trade atomically. Returns the new
    /// signal id, or `None` when the (config_id, trigger_candle_time)
    /// uniqueness fires — the signal was already emitted and the whole
    /// emission is treated as an idempotent success.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_signal_with_trade(
        &self,
        config: &SignalConfig,
        side: Side,
        trigger_candle_time: i64,
        stop_price: f64,
        stop_trigger: f64,
        invested_amount: f64,
        leverage: f64,
    ) -> Result<Option<i64>> {
        let now = now_iso();
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO signals
                (config_id, symbol, interval, strategy, side,
                 trigger_candle_time, stop_price, stop_trigger_price,
                 status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(config.id)
        .bind(&config.symbol)
        .bind(&config.interval)
        .bind(&config.strategy)
        .bind(side.as_str())
        .bind(trigger_candle_time)
        .bind(stop_price)
        .bind(stop_trigger)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        let signal_id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        sqlx::query(
            r#"
            INSERT INTO sim_trades
                (signal_id, config_id, symbol, interval, side,
                 stop_base, stop_trigger, status,
                 portfolio, invested_amount, leverage, fees,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending_entry', ?, ?, ?, 0.0, ?, ?)
            "#,
        )
        .bind(signal_id)
        .bind(config.id)
        .bind(&config.symbol)
        .bind(&config.interval)
        .bind(side.as_str())
        .bind(stop_price)
        .bind(stop_trigger)
        .bind(config.portfolio)
        .bind(invested_amount)
        .bind(leverage)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(signal_id))
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    pub async fn list_signals(
        &self,
        config_id: Option<i64>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SignalListItem>> {
        let mut sql = String::from(
            r#"
            SELECT s.*,
                   st.id AS sim_trade_id,
                   st.entry_price AS sim_entry_price,
                   st.entry_time AS sim_entry_time,
                   st.status AS sim_trade_status
            FROM signals s
            LEFT JOIN sim_trades st ON st.signal_id = s.id
            WHERE 1 = 1
            "#,
        );
        if config_id.is_some() {
            sql.push_str(" AND s.config_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND s.status = ?");
        }
        sql.push_str(" ORDER BY s.id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(id) = config_id {
            query = query.bind(id);
        }
        if let Some(status) = status {
            query = query.bind(status);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(SignalListItem {
                signal: signal_from_row(row)?,
                sim_trade_id: row.get("sim_trade_id"),
                entry_price: row.get("sim_entry_price"),
                entry_time: row.get("sim_entry_time"),
                sim_trade_status: row.get("sim_trade_status"),
            });
        }
        Ok(items)
    }

    pub async fn get_signal(&self, signal_id: i64) -> Result<Option<SignalRow>> {
        let row = sqlx::query("SELECT * FROM signals WHERE id = ?")
            .bind(signal_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(signal_from_row).transpose()
    }

    pub async fn signals_overview(&self) -> Result<SignalsOverview> {
        let count = |sql: &'static str| async move {
            let row = sqlx::query(sql).fetch_one(self.pool()).await?;
            Ok::<i64, EngineError>(row.get(0))
        };

        Ok(SignalsOverview {
            active_configs: count("SELECT COUNT(*) FROM signal_configs WHERE active = 1").await?,
            open_sim_trades: count("SELECT COUNT(*) FROM sim_trades WHERE status = 'open'").await?,
            pending_sim_trades: count("SELECT COUNT(*) FROM sim_trades WHERE status = 'pending_entry'").await?,
            signals_last_24h: count("SELECT COUNT(*) FROM signals WHERE created_at > datetime('now', '-24 hours')")
                .await?,
        })
    }

    // ------------------------------------------------------------------
    // Sim trades
    // ------------------------------------------------------------------

    pub async fn pending_entry_trades(&self) -> Result<Vec<PendingEntryTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT st.id, st.signal_id, st.symbol, st.interval, st.side,
                   st.portfolio, st.invested_amount,
                   s.trigger_candle_time, sc.cost_bps
            FROM sim_trades st
            JOIN signals s ON st.signal_id = s.id
            JOIN signal_configs sc ON st.config_id = sc.id
            WHERE st.status = 'pending_entry'
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in &rows {
            let side: String = row.get("side");
            trades.push(PendingEntryTrade {
                id: row.get("id"),
                signal_id: row.get("signal_id"),
                symbol: row.get("symbol"),
                interval: row.get("interval"),
                side: side.parse()?,
                portfolio: row.get("portfolio"),
                invested_amount: row.get("invested_amount"),
                trigger_candle_time: row.get("trigger_candle_time"),
                cost_bps: row.get("cost_bps"),
            });
        }
        Ok(trades)
    }

    /// Open trades joined with the config context needed to re-evaluate the
    /// strategy (exit checks) and compute exit fees.
    pub async fn open_trades(&self) -> Result<Vec<OpenTrade>> {
        let rows = sqlx::query(
            r#"
            SELECT st.id, st.signal_id, st.config_id, st.symbol, st.interval,
                   st.side, st.entry_price, st.entry_time, st.stop_base,
                   st.stop_trigger, st.quantity, st.portfolio, st.fees,
                   sc.strategy, sc.params, sc.cost_bps
            FROM sim_trades st
            JOIN signal_configs sc ON st.config_id = sc.id
            WHERE st.status = 'open'
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut trades = Vec::with_capacity(rows.len());
        for row in &rows {
            let side: String = row.get("side");
            trades.push(OpenTrade {
                id: row.get("id"),
                signal_id: row.get("signal_id"),
                config_id: row.get("config_id"),
                symbol: row.get("symbol"),
                interval: row.get("interval"),
                side: side.parse()?,
                entry_price: row.get::<Option<f64>, _>("entry_price").unwrap_or(0.0),
                entry_time: row.get::<Option<i64>, _>("entry_time").unwrap_or(0),
                stop_base: row.get("stop_base"),
                stop_trigger: row.get("stop_trigger"),
                quantity: row.get::<Option<f64>, _>("quantity").unwrap_or(0.0),
                portfolio: row.get("portfolio"),
                fees: row.get::<Option<f64>, _>("fees").unwrap_or(0.0),
                strategy: row.get("strategy"),
                params: row.get("params"),
                cost_bps: row.get("cost_bps"),
            });
        }
        Ok(trades)
    }

    /// Poll intervals for trades still alive, for the tracker cadence.
    pub async fn live_trade_intervals(&self) -> Result<Vec<(String, Option<i64>)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT st.interval, sc.polling_interval_s
            FROM sim_trades st
            JOIN signal_configs sc ON st.config_id = sc.id
            WHERE st.status IN ('pending_entry', 'open')
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("interval"), row.get("polling_interval_s")))
            .collect())
    }

    /// Fill a pending entry. Guarded on status so a duplicate fill attempt
    /// after a crash-restart is a no-op.
    #[allow(clippy::too_many_arguments)]
    pub async fn fill_trade_entry(
        &self,
        trade_id: i64,
        signal_id: i64,
        entry_price: f64,
        entry_time: i64,
        quantity: f64,
        fee: f64,
        equity_peak: f64,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sim_trades
            SET entry_price = ?, entry_time = ?, quantity = ?, fees = ?,
                equity_peak = ?, status = 'open', updated_at = ?
            WHERE id = ? AND status = 'pending_entry'
            "#,
        )
        .bind(entry_price)
        .bind(entry_time)
        .bind(quantity)
        .bind(fee)
        .bind(equity_peak)
        .bind(now_iso())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE signals SET status = 'active' WHERE id = ?")
            .bind(signal_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Close an open trade and its signal. Guarded on status: closing an
    /// already-terminal trade is a no-op and returns false.
    pub async fn close_trade(&self, trade_id: i64, signal_id: i64, close: &TradeClose) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sim_trades
            SET exit_price = ?, exit_time = ?, exit_reason = ?,
                status = 'closed', pnl = ?, pnl_pct = ?, fees = ?,
                updated_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(close.exit_price)
        .bind(close.exit_time)
        .bind(&close.exit_reason)
        .bind(close.pnl)
        .bind(close.pnl_pct)
        .bind(close.total_fees)
        .bind(now_iso())
        .bind(trade_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE signals SET status = 'closed' WHERE id = ?")
            .bind(signal_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_sim_trade(&self, trade_id: i64) -> Result<Option<SimTrade>> {
        let row = sqlx::query("SELECT * FROM sim_trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(sim_trade_from_row).transpose()
    }

    pub async fn list_sim_trades(
        &self,
        config_id: Option<i64>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SimTrade>> {
        let mut sql = String::from("SELECT * FROM sim_trades WHERE 1 = 1");
        if config_id.is_some() {
            sql.push_str(" AND config_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(id) = config_id {
            query = query.bind(id);
        }
        if let Some(status) = status {
            query = query.bind(status);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(sim_trade_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Record a notification side effect. Returns false when the
    /// (event_type, reference_type, reference_id) key already exists —
    /// at-most-once delivery enforced by the unique index.
    pub async fn insert_notification(
        &self,
        event_type: &str,
        reference_type: &str,
        reference_id: i64,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_log (event_type, reference_type, reference_id, message, sent_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event_type)
        .bind(reference_type)
        .bind(reference_id)
        .bind(message)
        .bind(now_iso())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Real trades (bookkeeping only)
    // ------------------------------------------------------------------

    pub async fn insert_real_trade(&self, trade: &NewRealTrade) -> Result<i64> {
        let now = now_iso();
        let result = sqlx::query(
            r#"
            INSERT INTO real_trades
                (sim_trade_id, signal_id, symbol, side, entry_price, entry_time,
                 quantity, fees, notes, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)
            "#,
        )
        .bind(trade.sim_trade_id)
        .bind(trade.signal_id)
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(trade.entry_price)
        .bind(&trade.entry_time)
        .bind(trade.quantity)
        .bind(trade.fees)
        .bind(&trade.notes)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_real_trade(&self, trade_id: i64) -> Result<Option<RealTrade>> {
        let row = sqlx::query("SELECT * FROM real_trades WHERE id = ?")
            .bind(trade_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(real_trade_from_row))
    }

    pub async fn list_real_trades(
        &self,
        sim_trade_id: Option<i64>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RealTrade>> {
        let mut sql = String::from("SELECT * FROM real_trades WHERE 1 = 1");
        if sim_trade_id.is_some() {
            sql.push_str(" AND sim_trade_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(id) = sim_trade_id {
            query = query.bind(id);
        }
        if let Some(status) = status {
            query = query.bind(status);
        }
        query = query.bind(limit);

        let rows = query.fetch_all(self.pool()).await?;
        Ok(rows.iter().map(real_trade_from_row).collect())
    }

    pub async fn patch_real_trade(&self, trade_id: i64, patch: &RealTradePatch) -> Result<bool> {
        // pnl_pct derives from pnl over the invested notional
        let pnl_pct = if let Some(pnl) = patch.pnl {
            match self.get_real_trade(trade_id).await? {
                Some(existing) => {
                    let invested = existing.entry_price * existing.quantity;
                    (invested > 0.0).then_some(pnl / invested)
                }
                None => None,
            }
        } else {
            None
        };

        let result = sqlx::query(
            r#"
            UPDATE real_trades
            SET exit_price = COALESCE(?, exit_price),
                exit_time = COALESCE(?, exit_time),
                fees = COALESCE(?, fees),
                pnl = COALESCE(?, pnl),
                pnl_pct = COALESCE(?, pnl_pct),
                notes = COALESCE(?, notes),
                status = COALESCE(?, status),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(patch.exit_price)
        .bind(&patch.exit_time)
        .bind(patch.fees)
        .bind(patch.pnl)
        .bind(pnl_pct)
        .bind(&patch.notes)
        .bind(&patch.status)
        .bind(now_iso())
        .bind(trade_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_real_trade(&self, trade_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM real_trades WHERE id = ?")
            .bind(trade_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_config(symbol: &str, interval: &str, strategy: &str) -> NewSignalConfig {
        NewSignalConfig {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            strategy: strategy.to_string(),
            params: r#"{"M_salida":3,"N_entrada":5,"stop_pct":0.02}"#.to_string(),
            stop_cross_pct: 0.02,
            portfolio: 10_000.0,
            invested_amount: None,
            leverage: Some(1.0),
            cost_bps: 10.0,
            polling_interval_s: None,
        }
    }

    pub async fn insert_test_config(db: &Database) -> SignalConfig {
        let id = db.insert_config(&new_config("BTCUSDT", "1h", "breakout")).await.unwrap();
        db.get_config(id).await.unwrap().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::{SignalStatus, TradeStatus};

    #[tokio::test]
    async fn test_config_conflict_on_same_natural_key() {
        let db = Database::in_memory().await.unwrap();
        db.insert_config(&new_config("BTCUSDT", "1h", "breakout")).await.unwrap();

        let err = db
            .insert_config(&new_config("BTCUSDT", "1h", "breakout"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // different params are a different config
        let mut other = new_config("BTCUSDT", "1h", "breakout");
        other.params = r#"{"N_entrada":10}"#.to_string();
        db.insert_config(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_signal_is_deduped_by_trigger_candle() {
        let db = Database::in_memory().await.unwrap();
        let config = insert_test_config(&db).await;

        let first = db
            .emit_signal_with_trade(&config, Side::Long, 5_000_000, 95.0, 93.1, 10_000.0, 1.0)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = db
            .emit_signal_with_trade(&config, Side::Long, 5_000_000, 95.0, 93.1, 10_000.0, 1.0)
            .await
            .unwrap();
        assert!(second.is_none());

        let signals = db.list_signals(Some(config.id), None, 10).await.unwrap();
        assert_eq!(signals.len(), 1);

        let trades = db.list_sim_trades(Some(config.id), None, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::PendingEntry);
        assert_eq!(trades[0].stop_trigger, 93.1);
    }

    #[tokio::test]
    async fn test_fill_and_close_are_status_guarded() {
        let db = Database::in_memory().await.unwrap();
        let config = insert_test_config(&db).await;
        let signal_id = db
            .emit_signal_with_trade(&config, Side::Long, 5_000_000, 95.0, 93.1, 10_000.0, 1.0)
            .await
            .unwrap()
            .unwrap();
        let trades = db.list_sim_trades(Some(config.id), None, 1).await.unwrap();
        let trade = &trades[0];

        assert!(db
            .fill_trade_entry(trade.id, signal_id, 100.0, 5_003_600_000, 100.0, 10.0, 10_000.0)
            .await
            .unwrap());
        // duplicate fill is a no-op
        assert!(!db
            .fill_trade_entry(trade.id, signal_id, 101.0, 5_003_600_000, 99.0, 10.0, 10_000.0)
            .await
            .unwrap());

        let filled = db.get_sim_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(filled.status, TradeStatus::Open);
        assert_eq!(filled.entry_price, Some(100.0));

        let close = TradeClose {
            exit_price: 93.1,
            exit_time: 5_007_200_000,
            exit_reason: "stop_intrabar".to_string(),
            pnl: -690.0,
            pnl_pct: -0.069,
            total_fees: 19.31,
        };
        assert!(db.close_trade(trade.id, signal_id, &close).await.unwrap());
        // duplicate close is a no-op
        assert!(!db.close_trade(trade.id, signal_id, &close).await.unwrap());

        let closed = db.get_sim_trade(trade.id).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.pnl, Some(-690.0));
        let signal = db.get_signal(signal_id).await.unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Closed);
    }

    #[tokio::test]
    async fn test_delete_config_cascade_closes_trades() {
        let db = Database::in_memory().await.unwrap();
        let config = insert_test_config(&db).await;
        let signal_id = db
            .emit_signal_with_trade(&config, Side::Long, 5_000_000, 95.0, 93.1, 10_000.0, 1.0)
            .await
            .unwrap()
            .unwrap();
        let trade_id = db.list_sim_trades(Some(config.id), None, 1).await.unwrap()[0].id;

        assert!(db.delete_config(config.id).await.unwrap());

        let trade = db.get_sim_trade(trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason.as_deref(), Some("config_deleted"));
        let signal = db.get_signal(signal_id).await.unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Closed);
        assert!(db.get_config(config.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notification_dedup() {
        let db = Database::in_memory().await.unwrap();

        assert!(db
            .insert_notification("stop_hit", "sim_trade", 42, "Stop hit on BTCUSDT long at 93.1")
            .await
            .unwrap());
        assert!(!db
            .insert_notification("stop_hit", "sim_trade", 42, "duplicate")
            .await
            .unwrap());
        // different event type for the same reference is a distinct key
        assert!(db
            .insert_notification("exit_signal", "sim_trade", 42, "Exit signal")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_real_trade_patch_derives_pnl_pct() {
        let db = Database::in_memory().await.unwrap();
        let id = db
            .insert_real_trade(&NewRealTrade {
                sim_trade_id: None,
                signal_id: None,
                symbol: "BTCUSDT".to_string(),
                side: "long".to_string(),
                entry_price: 100.0,
                entry_time: "2025-01-01T00:00:00Z".to_string(),
                quantity: 10.0,
                fees: 0.0,
                notes: None,
            })
            .await
            .unwrap();

        db.patch_real_trade(
            id,
            &RealTradePatch {
                pnl: Some(50.0),
                status: Some("closed".to_string()),
                ..RealTradePatch::default()
            },
        )
        .await
        .unwrap();

        let trade = db.get_real_trade(id).await.unwrap().unwrap();
        assert_eq!(trade.pnl, Some(50.0));
        // invested = 100 * 10 = 1000 → pnl_pct = 0.05
        assert_eq!(trade.pnl_pct, Some(0.05));
        assert_eq!(trade.status, "closed");
    }
}
