use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::database::Database;
use crate::engine::{BacktestResult, DownloadEngine};
use crate::exchange::BinanceClient;

/// A finished backtest kept in memory for polling and export.
#[derive(Debug, Clone, Serialize)]
pub struct StoredBacktest {
    pub id: Uuid,
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
    pub params: serde_json::Value,
    pub initial_capital: f64,
    #[serde(flatten)]
    pub result: BacktestResult,
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub client: Arc<BinanceClient>,
    pub downloads: Arc<DownloadEngine>,
    pub backtests: Arc<Mutex<HashMap<Uuid, StoredBacktest>>>,
}

impl AppState {
    pub fn new(db: Database, client: Arc<BinanceClient>, downloads: Arc<DownloadEngine>) -> Self {
        Self {
            db,
            client,
            downloads,
            backtests: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
