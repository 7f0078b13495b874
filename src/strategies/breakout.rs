use serde_json::{json, Value};

use super::{param_bool, param_f64, param_usize, ParameterDef, Strategy, StrategySignal};
use crate::error::Result;
use crate::indicators::{rolling_max, rolling_min, shift_one};
use crate::types::{CandleFrame, CandleRow, PositionSide, PositionState, SignalAction};

/// Close-based breakout with a percentage stop and exit on reversal.
///
/// Entry when the close breaks above the N-candle high (long) or below the
/// N-candle low (short). The stop sits at `min_prev * (1 - stop_pct)` for
/// longs and `max_prev * (1 + stop_pct)` for shorts. Exit when the close
/// breaks the M-candle extreme on the other side.
#[derive(Debug, Default)]
pub struct BreakoutStrategy {
    stop_pct: f64,
    enable_long: bool,
    enable_short: bool,
    max_prev: Vec<f64>,
    min_prev: Vec<f64>,
    max_exit: Vec<f64>,
    min_exit: Vec<f64>,
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn description(&self) -> &'static str {
        "Breakout por cierre con stop porcentual y salida por ruptura. \
         Entry when Close breaks above N-candle High (long) or below N-candle Low (short). \
         Stop is placed at MinPrev*(1-stop_pct) for longs, MaxPrev*(1+stop_pct) for shorts. \
         Exit when Close breaks below M-candle Low (long) or above M-candle High (short)."
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef {
                name: "N_entrada",
                kind: "int",
                default: json!(20),
                min: Some(json!(2)),
                max: Some(json!(500)),
                description: "Lookback window for breakout detection (exclusive of current candle)",
            },
            ParameterDef {
                name: "M_salida",
                kind: "int",
                default: json!(10),
                min: Some(json!(1)),
                max: Some(json!(500)),
                description: "Lookback window for exit signal",
            },
            ParameterDef {
                name: "stop_pct",
                kind: "float",
                default: json!(0.02),
                min: Some(json!(0.001)),
                max: Some(json!(0.5)),
                description: "Stop loss percentage from entry reference level",
            },
            ParameterDef {
                name: "modo_ejecucion",
                kind: "str",
                default: json!("open_next"),
                min: None,
                max: None,
                description: "Execution mode: 'open_next' or 'close_current'",
            },
            ParameterDef {
                name: "habilitar_long",
                kind: "bool",
                default: json!(true),
                min: None,
                max: None,
                description: "Enable long entries",
            },
            ParameterDef {
                name: "habilitar_short",
                kind: "bool",
                default: json!(true),
                min: None,
                max: None,
                description: "Enable short entries",
            },
            ParameterDef {
                name: "coste_total_bps",
                kind: "float",
                default: json!(10.0),
                min: Some(json!(0.0)),
                max: Some(json!(100.0)),
                description: "Round-trip transaction cost in basis points",
            },
        ]
    }

    fn init(&mut self, params: &Value, frame: &CandleFrame) -> Result<()> {
        let n = param_usize(params, "N_entrada", 20);
        let m = param_usize(params, "M_salida", 10);
        self.stop_pct = param_f64(params, "stop_pct", 0.02);
        self.enable_long = param_bool(params, "habilitar_long", true);
        self.enable_short = param_bool(params, "habilitar_short", true);

        // Windows cover the N (or M) candles BEFORE t, so the extremes are
        // computed on the series shifted by one bar.
        self.max_prev = shift_one(&rolling_max(&frame.high, n));
        self.min_prev = shift_one(&rolling_min(&frame.low, n));
        self.max_exit = shift_one(&rolling_max(&frame.high, m));
        self.min_exit = shift_one(&rolling_min(&frame.low, m));

        Ok(())
    }

    fn on_candle(&self, t: usize, row: &CandleRow, state: &PositionState) -> Vec<StrategySignal> {
        if t >= self.max_prev.len() {
            return Vec::new();
        }

        let max_prev = self.max_prev[t];
        let min_prev = self.min_prev[t];
        let max_exit = self.max_exit[t];
        let min_exit = self.min_exit[t];

        // Warm-up: lookbacks not filled yet
        if max_prev.is_nan() || min_prev.is_nan() || max_exit.is_nan() || min_exit.is_nan() {
            return Vec::new();
        }

        match state.side {
            PositionSide::Long => {
                // Stop first (intrabar, triggered on the low)
                if row.low <= state.stop_price {
                    return vec![StrategySignal::new(SignalAction::StopLong, state.stop_price)];
                }
                if row.close < min_exit {
                    return vec![StrategySignal::new(SignalAction::ExitLong, row.close)];
                }
                Vec::new()
            }
            PositionSide::Short => {
                if row.high >= state.stop_price {
                    return vec![StrategySignal::new(SignalAction::StopShort, state.stop_price)];
                }
                if row.close > max_exit {
                    return vec![StrategySignal::new(SignalAction::ExitShort, row.close)];
                }
                Vec::new()
            }
            PositionSide::Flat => {
                if self.enable_long && row.close > max_prev {
                    let stop = min_prev * (1.0 - self.stop_pct);
                    vec![StrategySignal::entry(SignalAction::EntryLong, row.close, stop)]
                } else if self.enable_short && row.close < min_prev {
                    let stop = max_prev * (1.0 + self.stop_pct);
                    vec![StrategySignal::entry(SignalAction::EntryShort, row.close, stop)]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::{frame_from_closes, frame_from_ohlc};
    use crate::types::Side;
    use serde_json::json;

    fn init_strategy(params: Value, frame: &CandleFrame) -> BreakoutStrategy {
        let mut strategy = BreakoutStrategy::default();
        strategy.init(&params, frame).unwrap();
        strategy
    }

    #[test]
    fn test_long_entry_on_breakout_close() {
        // ten flat candles at 10, then a breakout to 20
        let mut closes = vec![10.0; 10];
        closes.push(20.0);
        let frame = frame_from_closes(&closes);
        let strategy = init_strategy(json!({"N_entrada": 5, "M_salida": 3, "stop_pct": 0.02}), &frame);

        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &PositionState::flat());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::EntryLong);
        // stop = min_prev * (1 - stop_pct) = 10 * 0.98
        assert!((signals[0].stop_price - 9.8).abs() < 1e-9);
    }

    #[test]
    fn test_no_signals_during_warmup() {
        let closes: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let frame = frame_from_closes(&closes);
        let strategy = init_strategy(json!({"N_entrada": 5, "M_salida": 3}), &frame);

        // bars before the lookback is satisfied produce nothing, even on
        // rising closes
        for t in 0..5 {
            let signals = strategy.on_candle(t, &frame.row(t), &PositionState::flat());
            assert!(signals.is_empty(), "expected no signal at t={t}");
        }
    }

    #[test]
    fn test_stop_has_priority_over_exit() {
        // last bar pierces the stop AND closes below the exit level
        let bars: Vec<(f64, f64, f64, f64)> = (0..10)
            .map(|_| (100.0, 101.0, 99.0, 100.0))
            .chain(std::iter::once((100.0, 100.0, 90.0, 91.0)))
            .collect();
        let frame = frame_from_ohlc(&bars);
        let strategy = init_strategy(json!({"N_entrada": 5, "M_salida": 3, "stop_pct": 0.02}), &frame);

        let state = PositionState::open(Side::Long, 100.0, 0, 95.0, 1.0);
        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &state);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::StopLong);
        assert_eq!(signals[0].price, 95.0);
    }

    #[test]
    fn test_exit_long_when_close_breaks_exit_low() {
        let bars: Vec<(f64, f64, f64, f64)> = (0..10)
            .map(|_| (100.0, 101.0, 99.0, 100.0))
            .chain(std::iter::once((100.0, 100.5, 98.0, 98.5)))
            .collect();
        let frame = frame_from_ohlc(&bars);
        let strategy = init_strategy(json!({"N_entrada": 5, "M_salida": 3, "stop_pct": 0.02}), &frame);

        // stop far below, so only the exit rule can fire
        let state = PositionState::open(Side::Long, 100.0, 0, 50.0, 1.0);
        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &state);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::ExitLong);
        assert_eq!(signals[0].price, 98.5);
    }

    #[test]
    fn test_short_entry_and_short_stop() {
        let mut closes = vec![10.0; 10];
        closes.push(5.0);
        let frame = frame_from_closes(&closes);
        let strategy = init_strategy(json!({"N_entrada": 5, "M_salida": 3, "stop_pct": 0.02}), &frame);

        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &PositionState::flat());
        assert_eq!(signals[0].action, SignalAction::EntryShort);
        // stop = max_prev * (1 + stop_pct) = 10 * 1.02
        assert!((signals[0].stop_price - 10.2).abs() < 1e-9);

        // short stop triggers on the high
        let state = PositionState::open(Side::Short, 5.0, 0, 10.2, 1.0);
        let mut row = frame.row(t);
        row.high = 10.5;
        let signals = strategy.on_candle(t, &row, &state);
        assert_eq!(signals[0].action, SignalAction::StopShort);
    }

    #[test]
    fn test_direction_toggles() {
        let mut closes = vec![10.0; 10];
        closes.push(20.0);
        let frame = frame_from_closes(&closes);
        let strategy = init_strategy(
            json!({"N_entrada": 5, "M_salida": 3, "habilitar_long": false}),
            &frame,
        );

        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &PositionState::flat());
        assert!(signals.is_empty());
    }
}
