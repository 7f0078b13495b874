use serde_json::{json, Value};

use super::{param_bool, param_f64, ParameterDef, Strategy, StrategySignal};
use crate::error::Result;
use crate::types::{CandleFrame, CandleRow, PositionSide, PositionState, SignalAction};

/// Support/resistance levels from a causal zig-zag.
///
/// Swing highs (resistance) and swing lows (support) are confirmed once
/// price reverses a minimum percentage from the running extreme. Entry long
/// on a close above resistance, entry short on a close below support; exit
/// when the opposite level breaks. Stops are percentage offsets from the
/// confirmed levels.
#[derive(Debug, Default)]
pub struct SupportResistanceStrategy {
    stop_pct: f64,
    enable_long: bool,
    enable_short: bool,
    support: Vec<f64>,
    resistance: Vec<f64>,
}

/// Last confirmed swing low and swing high per bar. Both carry NaN until
/// the first confirmation. The scan is single-pass and never reads ahead.
fn compute_zigzag(highs: &[f64], lows: &[f64], reversal_pct: f64) -> (Vec<f64>, Vec<f64>) {
    let n = highs.len();
    let mut support = vec![f64::NAN; n];
    let mut resistance = vec![f64::NAN; n];
    if n == 0 {
        return (support, resistance);
    }

    #[derive(PartialEq)]
    enum Direction {
        Up,
        Down,
    }

    let mut direction = Direction::Up;
    let mut current_high = highs[0];
    let mut current_low = lows[0];
    let mut confirmed_support = f64::NAN;
    let mut confirmed_resistance = f64::NAN;

    for t in 0..n {
        let high = highs[t];
        let low = lows[t];

        match direction {
            Direction::Up => {
                if high > current_high {
                    current_high = high;
                }
                if current_high > 0.0 && low <= current_high * (1.0 - reversal_pct) {
                    confirmed_resistance = current_high;
                    direction = Direction::Down;
                    current_low = low;
                }
            }
            Direction::Down => {
                if low < current_low {
                    current_low = low;
                }
                if current_low > 0.0 && high >= current_low * (1.0 + reversal_pct) {
                    confirmed_support = current_low;
                    direction = Direction::Up;
                    current_high = high;
                }
            }
        }

        support[t] = confirmed_support;
        resistance[t] = confirmed_resistance;
    }

    (support, resistance)
}

impl Strategy for SupportResistanceStrategy {
    fn name(&self) -> &'static str {
        "support_resistance"
    }

    fn description(&self) -> &'static str {
        "Soportes y Resistencias reales mediante zigzag. \
         Detecta swing highs (resistencias) y swing lows (soportes) cuando el precio \
         retrocede un porcentaje mínimo desde el extremo. \
         Entry long al romper resistencia, entry short al romper soporte. \
         Exit cuando se rompe el nivel contrario. Stop porcentual sobre soporte/resistencia."
    }

    fn parameters(&self) -> Vec<ParameterDef> {
        vec![
            ParameterDef {
                name: "reversal_pct",
                kind: "float",
                default: json!(0.03),
                min: Some(json!(0.005)),
                max: Some(json!(0.5)),
                description: "Minimum % reversal from extreme to confirm a swing point (e.g. 0.03 = 3%)",
            },
            ParameterDef {
                name: "stop_pct",
                kind: "float",
                default: json!(0.02),
                min: Some(json!(0.001)),
                max: Some(json!(0.5)),
                description: "Stop loss percentage from support/resistance level",
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
        let reversal_pct = param_f64(params, "reversal_pct", 0.03);
        self.stop_pct = param_f64(params, "stop_pct", 0.02);
        self.enable_long = param_bool(params, "habilitar_long", true);
        self.enable_short = param_bool(params, "habilitar_short", true);

        let (support, resistance) = compute_zigzag(&frame.high, &frame.low, reversal_pct);
        self.support = support;
        self.resistance = resistance;

        Ok(())
    }

    fn on_candle(&self, t: usize, row: &CandleRow, state: &PositionState) -> Vec<StrategySignal> {
        if t >= self.support.len() {
            return Vec::new();
        }

        let support = self.support[t];
        let resistance = self.resistance[t];

        // Both levels must be confirmed before any signal
        if support.is_nan() || resistance.is_nan() {
            return Vec::new();
        }

        match state.side {
            PositionSide::Long => {
                if row.low <= state.stop_price {
                    return vec![StrategySignal::new(SignalAction::StopLong, state.stop_price)];
                }
                if row.close < support {
                    return vec![StrategySignal::new(SignalAction::ExitLong, row.close)];
                }
                Vec::new()
            }
            PositionSide::Short => {
                if row.high >= state.stop_price {
                    return vec![StrategySignal::new(SignalAction::StopShort, state.stop_price)];
                }
                if row.close > resistance {
                    return vec![StrategySignal::new(SignalAction::ExitShort, row.close)];
                }
                Vec::new()
            }
            PositionSide::Flat => {
                if self.enable_long && row.close > resistance {
                    let stop = support * (1.0 - self.stop_pct);
                    vec![StrategySignal::entry(SignalAction::EntryLong, row.close, stop)]
                } else if self.enable_short && row.close < support {
                    let stop = resistance * (1.0 + self.stop_pct);
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
    use crate::strategies::test_support::frame_from_ohlc;
    use crate::types::Side;
    use serde_json::json;

    /// Rise to 100, pull back 5% (confirms resistance 100), rally back up
    /// 5% from the low (confirms support 95).
    fn swing_frame() -> CandleFrame {
        frame_from_ohlc(&[
            (90.0, 90.0, 90.0, 90.0),
            (95.0, 96.0, 94.0, 95.0),
            (99.0, 100.0, 98.0, 99.0),
            // low 95 <= 100*(1-0.03): resistance 100 confirmed, now tracking down
            (97.0, 97.0, 95.0, 96.0),
            // high 98.5 >= 95*(1+0.03): support 95 confirmed, now tracking up
            (96.0, 98.5, 95.5, 98.0),
            (98.0, 99.0, 97.0, 98.5),
        ])
    }

    fn init_strategy(params: Value, frame: &CandleFrame) -> SupportResistanceStrategy {
        let mut strategy = SupportResistanceStrategy::default();
        strategy.init(&params, frame).unwrap();
        strategy
    }

    #[test]
    fn test_zigzag_confirms_levels_causally() {
        let frame = swing_frame();
        let (support, resistance) = compute_zigzag(&frame.high, &frame.low, 0.03);

        // nothing confirmed on the first bars
        assert!(resistance[0].is_nan());
        assert!(support[3].is_nan());

        // resistance confirmed on the 5% pullback bar
        assert_eq!(resistance[3], 100.0);
        // support confirmed on the 3% rally bar, resistance carried forward
        assert_eq!(support[4], 95.0);
        assert_eq!(resistance[5], 100.0);
    }

    #[test]
    fn test_no_signals_before_both_levels_exist() {
        let frame = swing_frame();
        let strategy = init_strategy(json!({"reversal_pct": 0.03, "stop_pct": 0.02}), &frame);

        // resistance exists at t=3 but support doesn't yet
        let signals = strategy.on_candle(3, &frame.row(3), &PositionState::flat());
        assert!(signals.is_empty());
    }

    #[test]
    fn test_entry_long_on_resistance_break() {
        let mut frame = swing_frame();
        // close above the 100 resistance
        frame.push(crate::types::CandleRow {
            open_time: 6 * 3_600_000,
            open: 99.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 1.0,
        });
        let strategy = init_strategy(json!({"reversal_pct": 0.03, "stop_pct": 0.02}), &frame);

        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &PositionState::flat());
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::EntryLong);
        // stop = support * (1 - stop_pct) = 95 * 0.98
        assert!((signals[0].stop_price - 93.1).abs() < 1e-9);
    }

    #[test]
    fn test_exit_long_when_support_breaks() {
        let mut frame = swing_frame();
        frame.push(crate::types::CandleRow {
            open_time: 6 * 3_600_000,
            open: 96.0,
            high: 96.0,
            low: 94.0,
            close: 94.5,
            volume: 1.0,
        });
        let strategy = init_strategy(json!({"reversal_pct": 0.03, "stop_pct": 0.02}), &frame);

        let state = PositionState::open(Side::Long, 98.0, 0, 80.0, 1.0);
        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &state);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::ExitLong);
    }

    #[test]
    fn test_short_stop_checked_on_high_before_exit() {
        let mut frame = swing_frame();
        frame.push(crate::types::CandleRow {
            open_time: 6 * 3_600_000,
            open: 99.0,
            high: 103.0,
            low: 98.0,
            close: 101.0,
            volume: 1.0,
        });
        let strategy = init_strategy(json!({"reversal_pct": 0.03, "stop_pct": 0.02}), &frame);

        // stop at 102: the 103 high triggers the stop even though the close
        // also breaks resistance
        let state = PositionState::open(Side::Short, 96.0, 0, 102.0, 1.0);
        let t = frame.len() - 1;
        let signals = strategy.on_candle(t, &frame.row(t), &state);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::StopShort);
        assert_eq!(signals[0].price, 102.0);
    }
}
