use serde::Serialize;
use serde_json::Value;

use crate::database::Database;
use crate::engine::results::{compute_backtest_metrics, BacktestSummary};
use crate::error::{EngineError, Result};
use crate::strategies::{create_strategy, StrategySignal};
use crate::types::{
    CandleFrame, ExecutionMode, Interval, PositionSide, PositionState, Side, SignalAction,
};

/// One closed round trip in a backtest.
#[derive(Debug, Clone, Serialize)]
pub struct TradeLogEntry {
    pub entry_time: i64,
    pub exit_time: i64,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub fees: f64,
    pub exit_reason: String,
    pub duration_candles: i64,
}

/// Full backtest output: per-bar equity, closed trades, and the summary.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub equity_curve: Vec<f64>,
    pub trade_log: Vec<TradeLogEntry>,
    pub summary: BacktestSummary,
    pub liquidated: bool,
}

/// Run a backtest over stored candles.
#[allow(clippy::too_many_arguments)]
pub async fn run_backtest(
    db: &Database,
    symbol: &str,
    interval: Interval,
    start_ms: i64,
    end_ms: i64,
    strategy_name: &str,
    params: &Value,
    initial_capital: f64,
) -> Result<BacktestResult> {
    let frame = db.load_frame(symbol, interval, Some(start_ms), Some(end_ms)).await?;
    run_backtest_frame(&frame, interval, strategy_name, params, initial_capital)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn side_of(state: &PositionState) -> Side {
    match state.side {
        PositionSide::Short => Side::Short,
        _ => Side::Long,
    }
}

fn gross_pnl(state: &PositionState, exec_price: f64) -> f64 {
    match state.side {
        PositionSide::Short => state.quantity * (state.entry_price - exec_price),
        _ => state.quantity * (exec_price - state.entry_price),
    }
}

/// Deterministic single-pass walk over a candle frame.
pub fn run_backtest_frame(
    frame: &CandleFrame,
    interval: Interval,
    strategy_name: &str,
    params: &Value,
    initial_capital: f64,
) -> Result<BacktestResult> {
    if frame.len() < 2 {
        return Err(EngineError::DataUnavailable(
            "Insufficient candle data for backtest".to_string(),
        ));
    }

    let mut strategy = create_strategy(strategy_name)?;
    strategy.init(params, frame)?;

    let execution_mode = ExecutionMode::parse(
        params.get("modo_ejecucion").and_then(Value::as_str).unwrap_or("open_next"),
    );
    let cost_bps = params.get("coste_total_bps").and_then(Value::as_f64).unwrap_or(10.0);
    let cost_factor = cost_bps / 10_000.0;

    let mut equity = initial_capital;
    let mut equity_curve: Vec<f64> = Vec::with_capacity(frame.len());
    let mut trade_log: Vec<TradeLogEntry> = Vec::new();
    let mut state = PositionState::flat();
    let mut entry_idx: usize = 0;
    let mut pending_entry: Option<StrategySignal> = None;

    for t in 0..frame.len() {
        let row = frame.row(t);

        // Deferred entry from the previous bar fills at this bar's open.
        // Quantity is computed on pre-fee equity.
        if execution_mode == ExecutionMode::OpenNext {
            if let Some(signal) = pending_entry.take() {
                if let Some(side) = signal.action.entry_side() {
                    let quantity = equity / row.open;
                    let fee = equity * cost_factor;
                    equity -= fee;
                    state = PositionState::open(side, row.open, row.open_time, signal.stop_price, quantity);
                    entry_idx = t;
                }
            }
        }

        let signals = strategy.on_candle(t, &row, &state);

        // Exits and stops are handled before any new entry
        let mut exit_executed = false;
        for signal in &signals {
            if !(signal.action.is_stop() || signal.action.is_exit()) || state.is_flat() {
                continue;
            }

            let exec_price = match signal.action {
                // Worst-of rule: a bar opening beyond the stop fills at the open
                SignalAction::StopLong => {
                    if row.open < state.stop_price {
                        signal.price.min(row.open)
                    } else {
                        signal.price
                    }
                }
                SignalAction::StopShort => {
                    if row.open > state.stop_price {
                        signal.price.max(row.open)
                    } else {
                        signal.price
                    }
                }
                _ => match execution_mode {
                    ExecutionMode::CloseCurrent => row.close,
                    ExecutionMode::OpenNext => row.open,
                },
            };

            let gross = gross_pnl(&state, exec_price);
            let exit_fee = (state.quantity * exec_price).abs() * cost_factor;
            let pnl = gross - exit_fee;
            equity += pnl;

            trade_log.push(TradeLogEntry {
                entry_time: state.entry_time,
                exit_time: row.open_time,
                side: side_of(&state),
                entry_price: state.entry_price,
                exit_price: exec_price,
                pnl: round4(pnl),
                fees: round4(exit_fee),
                exit_reason: signal.action.as_str().to_string(),
                duration_candles: (t - entry_idx) as i64,
            });

            state = PositionState::flat();
            exit_executed = true;
            break;
        }

        // Bankruptcy stops the walk immediately
        if exit_executed && equity <= 0.0 {
            let summary =
                compute_backtest_metrics(&equity_curve, &trade_log, initial_capital, interval.step_ms());
            return Ok(BacktestResult {
                equity_curve,
                trade_log,
                summary,
                liquidated: true,
            });
        }

        // Entries only when still flat after exit handling
        if !exit_executed && state.is_flat() {
            for signal in &signals {
                let Some(side) = signal.action.entry_side() else {
                    continue;
                };
                match execution_mode {
                    ExecutionMode::OpenNext => pending_entry = Some(*signal),
                    ExecutionMode::CloseCurrent => {
                        let quantity = equity / row.close;
                        let fee = equity * cost_factor;
                        equity -= fee;
                        state = PositionState::open(side, row.close, row.open_time, signal.stop_price, quantity);
                        entry_idx = t;
                    }
                }
                break;
            }
        }

        // Mark-to-market equity, one value per bar
        let mtm = match state.side {
            PositionSide::Long => equity + state.quantity * (row.close - state.entry_price),
            PositionSide::Short => equity + state.quantity * (state.entry_price - row.close),
            PositionSide::Flat => equity,
        };
        equity_curve.push(mtm);
    }

    let summary = compute_backtest_metrics(&equity_curve, &trade_log, initial_capital, interval.step_ms());
    Ok(BacktestResult {
        equity_curve,
        trade_log,
        summary,
        liquidated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::{frame_from_closes, frame_from_ohlc};
    use serde_json::json;

    fn breakout_params() -> Value {
        json!({
            "N_entrada": 5,
            "M_salida": 3,
            "stop_pct": 0.5,
            "coste_total_bps": 0.0,
            "modo_ejecucion": "open_next"
        })
    }

    #[test]
    fn test_flat_market_produces_no_trades() {
        let frame = frame_from_closes(&vec![100.0; 60]);
        let result =
            run_backtest_frame(&frame, Interval::H1, "breakout", &breakout_params(), 10_000.0).unwrap();

        assert_eq!(result.trade_log.len(), 0);
        assert_eq!(result.equity_curve.len(), 60);
        assert_eq!(*result.equity_curve.last().unwrap(), 10_000.0);
        assert!(!result.liquidated);
        assert_eq!(result.summary.n_trades, 0);
    }

    #[test]
    fn test_too_few_candles_is_data_unavailable() {
        let frame = frame_from_closes(&[100.0]);
        let err =
            run_backtest_frame(&frame, Interval::H1, "breakout", &breakout_params(), 10_000.0).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable(_)));
    }

    #[test]
    fn test_open_next_round_trip() {
        // breakout at t=10, deferred entry at t=11 open, exit at t=12
        let mut bars: Vec<(f64, f64, f64, f64)> = (0..10).map(|_| (100.0, 100.0, 100.0, 100.0)).collect();
        bars.push((100.0, 110.0, 100.0, 110.0)); // t=10 breakout close
        bars.push((111.0, 111.0, 111.0, 111.0)); // t=11 entry at open 111
        bars.push((90.0, 90.0, 90.0, 90.0)); // t=12 close below exit low -> exit at open 90
        let frame = frame_from_ohlc(&bars);

        let result =
            run_backtest_frame(&frame, Interval::H1, "breakout", &breakout_params(), 10_000.0).unwrap();

        assert_eq!(result.trade_log.len(), 1);
        let trade = &result.trade_log[0];
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.entry_price, 111.0);
        assert_eq!(trade.exit_price, 90.0);
        assert_eq!(trade.duration_candles, 1);
        assert_eq!(trade.exit_reason, "exit_long");

        // qty = 10000/111; pnl = qty * (90 - 111)
        let expected_pnl = 10_000.0 / 111.0 * (90.0 - 111.0);
        assert!((trade.pnl - round4(expected_pnl)).abs() < 1e-9);
        assert_eq!(result.equity_curve.len(), 13);
        let final_equity = *result.equity_curve.last().unwrap();
        assert!((final_equity - (10_000.0 + expected_pnl)).abs() < 1e-6);
    }

    #[test]
    fn test_close_current_entry_fills_on_signal_close() {
        let mut bars: Vec<(f64, f64, f64, f64)> = (0..10).map(|_| (100.0, 100.0, 100.0, 100.0)).collect();
        bars.push((100.0, 110.0, 100.0, 110.0));
        bars.push((111.0, 111.0, 111.0, 111.0));
        let frame = frame_from_ohlc(&bars);

        let mut params = breakout_params();
        params["modo_ejecucion"] = json!("close_current");
        let result = run_backtest_frame(&frame, Interval::H1, "breakout", &params, 10_000.0).unwrap();

        // still in position at the end; the entry filled at the t=10 close
        assert!(result.trade_log.is_empty());
        // mark-to-market at t=11: equity + qty * (111 - 110)
        let qty = 10_000.0 / 110.0;
        let expected = 10_000.0 + qty * 1.0;
        assert!((result.equity_curve[11] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_long_stop_gap_down_fills_at_open() {
        let mut params = breakout_params();
        params["stop_pct"] = json!(0.02);

        let mut bars: Vec<(f64, f64, f64, f64)> = (0..10).map(|_| (100.0, 100.0, 100.0, 100.0)).collect();
        bars.push((100.0, 110.0, 100.0, 110.0)); // breakout; stop = 100*0.98 = 98
        bars.push((111.0, 111.0, 111.0, 111.0)); // entry at 111
        bars.push((95.0, 95.0, 94.0, 94.5)); // opens below the 98 stop
        let frame = frame_from_ohlc(&bars);

        let result = run_backtest_frame(&frame, Interval::H1, "breakout", &params, 10_000.0).unwrap();
        assert_eq!(result.trade_log.len(), 1);
        let trade = &result.trade_log[0];
        assert_eq!(trade.exit_reason, "stop_long");
        // gap through the stop: fill at the open, not the stop level
        assert_eq!(trade.exit_price, 95.0);
    }

    #[test]
    fn test_short_liquidation_halts_walk() {
        let mut params = breakout_params();
        params["stop_pct"] = json!(0.02);

        let mut bars: Vec<(f64, f64, f64, f64)> = (0..10).map(|_| (100.0, 100.0, 100.0, 100.0)).collect();
        bars.push((100.0, 100.0, 90.0, 90.0)); // breakdown close -> entry_short; stop = 102
        bars.push((89.0, 89.0, 89.0, 89.0)); // entry at open 89
        bars.push((210.0, 215.0, 205.0, 210.0)); // violent gap up through the stop
        bars.push((210.0, 210.0, 210.0, 210.0)); // never reached
        let frame = frame_from_ohlc(&bars);

        let result = run_backtest_frame(&frame, Interval::H1, "breakout", &params, 10_000.0).unwrap();
        assert!(result.liquidated);
        assert_eq!(result.trade_log.len(), 1);
        // gap past the stop: the short covers at the open
        assert_eq!(result.trade_log[0].exit_price, 210.0);
        // the walk stopped on the liquidation bar
        assert_eq!(result.equity_curve.len(), 12);
    }

    #[test]
    fn test_equity_curve_marks_open_position_to_market() {
        let mut bars: Vec<(f64, f64, f64, f64)> = (0..10).map(|_| (100.0, 100.0, 100.0, 100.0)).collect();
        bars.push((100.0, 110.0, 100.0, 110.0));
        bars.push((111.0, 115.0, 111.0, 114.0)); // entry at 111, closes at 114
        let frame = frame_from_ohlc(&bars);

        let result =
            run_backtest_frame(&frame, Interval::H1, "breakout", &breakout_params(), 10_000.0).unwrap();

        let qty = 10_000.0 / 111.0;
        let expected = 10_000.0 + qty * (114.0 - 111.0);
        assert!((result.equity_curve[11] - expected).abs() < 1e-9);
    }
}
