pub mod backtest;
pub mod download;
pub mod metrics;
pub mod results;
pub mod scanner;
pub mod tracker;

pub use backtest::{run_backtest, BacktestResult};
pub use download::{expected_open_times, DownloadEngine};
pub use scanner::SignalScanner;
pub use tracker::LiveTracker;
