pub mod breakout;
pub mod support_resistance;

pub use breakout::BreakoutStrategy;
pub use support_resistance::SupportResistanceStrategy;

use serde::Serialize;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::types::{CandleFrame, CandleRow, PositionState, SignalAction};

/// Declarative parameter metadata exposed through the API.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterDef {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub default: Value,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub description: &'static str,
}

/// A strategy decision for one candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategySignal {
    pub action: SignalAction,
    /// Suggested execution price (a close or stop level).
    pub price: f64,
    /// Stop level attached to entry signals.
    pub stop_price: f64,
}

impl StrategySignal {
    pub fn new(action: SignalAction, price: f64) -> Self {
        Self {
            action,
            price,
            stop_price: 0.0,
        }
    }

    pub fn entry(action: SignalAction, price: f64, stop_price: f64) -> Self {
        Self {
            action,
            price,
            stop_price,
        }
    }
}

/// A trading strategy over a precomputed indicator state.
///
/// `init` builds per-bar arrays from the frame and must not look past the
/// bar being evaluated (no future leakage). `on_candle` is a pure function
/// of the precomputed state, the current row, and the caller's position.
pub trait Strategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters(&self) -> Vec<ParameterDef>;
    fn init(&mut self, params: &Value, frame: &CandleFrame) -> Result<()>;
    fn on_candle(&self, t: usize, row: &CandleRow, state: &PositionState) -> Vec<StrategySignal>;
}

/// Registry metadata for one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParameterDef>,
}

/// Instantiate a strategy by name.
pub fn create_strategy(name: &str) -> Result<Box<dyn Strategy>> {
    match name {
        "breakout" => Ok(Box::<BreakoutStrategy>::default()),
        "support_resistance" => Ok(Box::<SupportResistanceStrategy>::default()),
        other => Err(EngineError::BadInput(format!(
            "unknown strategy: {other:?}. Available: [\"breakout\", \"support_resistance\"]"
        ))),
    }
}

/// Metadata for all registered strategies.
pub fn list_strategies() -> Vec<StrategyInfo> {
    [create_strategy("breakout"), create_strategy("support_resistance")]
        .into_iter()
        .flatten()
        .map(|s| StrategyInfo {
            name: s.name(),
            description: s.description(),
            parameters: s.parameters(),
        })
        .collect()
}

// Param extraction helpers. Params are opaque JSON interpreted per strategy;
// missing or mistyped keys fall back to the declared default.

pub(crate) fn param_f64(params: &Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub(crate) fn param_usize(params: &Value, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}

pub(crate) fn param_bool(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{CandleFrame, CandleRow};

    pub const STEP: i64 = 3_600_000;

    /// Frame where every bar has open = high = low = close.
    pub fn frame_from_closes(closes: &[f64]) -> CandleFrame {
        let mut frame = CandleFrame::default();
        for (i, &close) in closes.iter().enumerate() {
            frame.push(CandleRow {
                open_time: i as i64 * STEP,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            });
        }
        frame
    }

    /// Frame from (open, high, low, close) tuples.
    pub fn frame_from_ohlc(bars: &[(f64, f64, f64, f64)]) -> CandleFrame {
        let mut frame = CandleFrame::default();
        for (i, &(open, high, low, close)) in bars.iter().enumerate() {
            frame.push(CandleRow {
                open_time: i as i64 * STEP,
                open,
                high,
                low,
                close,
                volume: 1.0,
            });
        }
        frame
    }
}
