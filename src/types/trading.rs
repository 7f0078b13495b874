use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Direction of a signal or simulated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl FromStr for Side {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(EngineError::BadInput(format!("unknown side: {other}"))),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Position side as seen by a strategy: flat or holding either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

/// Caller-provided position snapshot passed to `Strategy::on_candle`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionState {
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: i64,
    pub stop_price: f64,
    pub quantity: f64,
}

impl PositionState {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn open(side: Side, entry_price: f64, entry_time: i64, stop_price: f64, quantity: f64) -> Self {
        Self {
            side: match side {
                Side::Long => PositionSide::Long,
                Side::Short => PositionSide::Short,
            },
            entry_price,
            entry_time,
            stop_price,
            quantity,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat
    }
}

/// Action tag on a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    EntryLong,
    EntryShort,
    ExitLong,
    ExitShort,
    StopLong,
    StopShort,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::EntryLong => "entry_long",
            SignalAction::EntryShort => "entry_short",
            SignalAction::ExitLong => "exit_long",
            SignalAction::ExitShort => "exit_short",
            SignalAction::StopLong => "stop_long",
            SignalAction::StopShort => "stop_short",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, SignalAction::EntryLong | SignalAction::EntryShort)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, SignalAction::ExitLong | SignalAction::ExitShort)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, SignalAction::StopLong | SignalAction::StopShort)
    }

    pub fn entry_side(&self) -> Option<Side> {
        match self {
            SignalAction::EntryLong => Some(Side::Long),
            SignalAction::EntryShort => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backtest fill model: defer entries to the next open, or fill on the
/// close of the signal candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    OpenNext,
    CloseCurrent,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "close_current" => ExecutionMode::CloseCurrent,
            _ => ExecutionMode::OpenNext,
        }
    }
}

/// Lifecycle of a download job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(EngineError::BadInput(format!("unknown job status: {other}"))),
        }
    }
}

/// Lifecycle of a signal row: emitted, entry filled, terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Active,
    Closed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "pending",
            SignalStatus::Active => "active",
            SignalStatus::Closed => "closed",
        }
    }
}

impl FromStr for SignalStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SignalStatus::Pending),
            "active" => Ok(SignalStatus::Active),
            "closed" => Ok(SignalStatus::Closed),
            other => Err(EngineError::BadInput(format!("unknown signal status: {other}"))),
        }
    }
}

/// Lifecycle of a simulated trade row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    PendingEntry,
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::PendingEntry => "pending_entry",
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }
}

impl FromStr for TradeStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_entry" => Ok(TradeStatus::PendingEntry),
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            other => Err(EngineError::BadInput(format!("unknown trade status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parse() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("short".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
    }

    #[test]
    fn test_position_state_defaults_flat() {
        let state = PositionState::flat();
        assert!(state.is_flat());
        assert_eq!(state.quantity, 0.0);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("close_current"), ExecutionMode::CloseCurrent);
        assert_eq!(ExecutionMode::parse("open_next"), ExecutionMode::OpenNext);
        // anything unrecognized falls back to the default fill model
        assert_eq!(ExecutionMode::parse("bogus"), ExecutionMode::OpenNext);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }
}
