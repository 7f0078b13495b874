use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::database::trades::{ConfigPatch, NewRealTrade, NewSignalConfig, RealTradePatch};
use crate::database::now_ms;
use crate::engine::metrics::compute_and_store_metrics;
use crate::engine::tracker::build_trade_close;
use crate::engine::{run_backtest, expected_open_times};
use crate::error::EngineError;
use crate::strategies::{create_strategy, list_strategies};
use crate::types::Interval;

use super::state::{AppState, StoredBacktest};

/// Pairs the UI surfaces by default, merged with whatever is stored.
const KNOWN_PAIRS: [&str; 10] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT", "AVAXUSDT",
    "DOTUSDT", "LINKUSDT",
];

/// Error envelope: the engine taxonomy mapped onto HTTP statuses with a
/// structured `{"detail": ...}` body.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::BadInterval(_) | EngineError::BadInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::DataUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error on request: {}", self.0);
        }
        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn not_found(what: impl Into<String>) -> ApiError {
    ApiError(EngineError::NotFound(what.into()))
}

fn bad_input(what: impl Into<String>) -> ApiError {
    ApiError(EngineError::BadInput(what.into()))
}

// ---------------------------------------------------------------------------
// Data routes
// ---------------------------------------------------------------------------

pub async fn list_pairs(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let stored = state.db.distinct_symbols().await?;
    let mut merged: Vec<String> = KNOWN_PAIRS.iter().map(|p| p.to_string()).collect();
    for symbol in stored {
        if !merged.contains(&symbol) {
            merged.push(symbol);
        }
    }
    merged.sort();
    Ok(Json(json!({"pairs": merged})))
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = req.interval.parse()?;
    if req.end_time <= req.start_time {
        return Err(bad_input("end_time must be > start_time"));
    }

    let job_id = state
        .db
        .create_job(&req.symbol.to_uppercase(), interval.as_str(), req.start_time, req.end_time)
        .await?;
    state.downloads.spawn_job(job_id);
    Ok(Json(json!({"job_id": job_id, "status": "started"})))
}

pub async fn get_download_status(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .db
        .get_job(job_id)
        .await?
        .ok_or_else(|| not_found(format!("Job {job_id} not found")))?;
    Ok(Json(serde_json::to_value(job).map_err(EngineError::from)?))
}

pub async fn cancel_download(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.cancel_job(job_id).await? {
        return Err(bad_input("Job not found or already finished"));
    }
    Ok(Json(json!({"job_id": job_id, "status": "cancelled"})))
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub symbol: String,
    pub interval: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn get_candles(
    State(state): State<AppState>,
    Query(query): Query<CandlesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = query.interval.parse()?;
    let limit = query.limit.unwrap_or(1000).clamp(1, 10_000);
    let candles = state
        .db
        .list_candles(&query.symbol.to_uppercase(), interval, query.start, query.end, limit)
        .await?;
    Ok(Json(json!({"count": candles.len(), "candles": candles})))
}

pub async fn data_coverage(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let coverage = state.db.coverage().await?;
    Ok(Json(json!({"coverage": coverage})))
}

pub async fn rate_limit_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.client.rate_limit_snapshot().await;
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
pub struct MetricsRequest {
    pub symbol: String,
    pub interval: String,
    pub metrics: Option<Vec<String>>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

pub async fn compute_metrics_endpoint(
    State(state): State<AppState>,
    Json(req): Json<MetricsRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = req.interval.parse()?;
    let report = compute_and_store_metrics(
        &state.db,
        &req.symbol.to_uppercase(),
        interval,
        req.metrics.as_deref(),
        req.start_time,
        req.end_time,
    )
    .await?;
    Ok(Json(serde_json::to_value(report).map_err(EngineError::from)?))
}

#[derive(Debug, Deserialize)]
pub struct MetricsStatusQuery {
    pub symbol: String,
    pub interval: String,
}

pub async fn metrics_status(
    State(state): State<AppState>,
    Query(query): Query<MetricsStatusQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = query.interval.parse()?;
    let metrics = state
        .db
        .derived_metric_counts(&query.symbol.to_uppercase(), interval)
        .await?;
    Ok(Json(json!({
        "symbol": query.symbol,
        "interval": query.interval,
        "metrics": metrics,
    })))
}

// ---------------------------------------------------------------------------
// Backtest routes
// ---------------------------------------------------------------------------

pub async fn get_strategies() -> Json<serde_json::Value> {
    Json(json!({"strategies": list_strategies()}))
}

#[derive(Debug, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
    pub strategy: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub initial_capital: Option<f64>,
}

pub async fn start_backtest(
    State(state): State<AppState>,
    Json(req): Json<BacktestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = req.interval.parse()?;
    if req.end_time <= req.start_time {
        return Err(bad_input("end_time must be > start_time"));
    }
    let initial_capital = req.initial_capital.unwrap_or(10_000.0);
    if initial_capital <= 0.0 {
        return Err(bad_input("initial_capital must be positive"));
    }
    let params = if req.params.is_null() { json!({}) } else { req.params.clone() };

    let symbol = req.symbol.to_uppercase();
    let result = run_backtest(
        &state.db,
        &symbol,
        interval,
        req.start_time,
        req.end_time,
        &req.strategy,
        &params,
        initial_capital,
    )
    .await?;

    let id = Uuid::new_v4();
    let stored = StoredBacktest {
        id,
        symbol,
        interval: interval.as_str().to_string(),
        strategy: req.strategy,
        params,
        initial_capital,
        result,
    };
    let response = json!({
        "id": id,
        "summary": stored.result.summary,
        "liquidated": stored.result.liquidated,
        "n_trades": stored.result.trade_log.len(),
    });
    state.backtests.lock().expect("backtests lock").insert(id, stored);

    Ok(Json(response))
}

pub async fn get_backtest(
    State(state): State<AppState>,
    Path(backtest_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let stored = state
        .backtests
        .lock()
        .expect("backtests lock")
        .get(&backtest_id)
        .cloned()
        .ok_or_else(|| not_found(format!("Backtest {backtest_id} not found")))?;
    Ok(Json(serde_json::to_value(stored).map_err(EngineError::from)?))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_export_format")]
    pub format: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

pub async fn export_backtest(
    State(state): State<AppState>,
    Path(backtest_id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let stored = state
        .backtests
        .lock()
        .expect("backtests lock")
        .get(&backtest_id)
        .cloned()
        .ok_or_else(|| not_found(format!("Backtest {backtest_id} not found")))?;

    match query.format.as_str() {
        "json" => {
            let body = serde_json::to_string_pretty(&json!({
                "trade_log": stored.result.trade_log,
                "summary": stored.result.summary,
            }))
            .map_err(EngineError::from)?;
            Ok((
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"backtest_{backtest_id}.json\""),
                    ),
                ],
                body,
            )
                .into_response())
        }
        "csv" => {
            let mut body = String::new();
            if stored.result.trade_log.is_empty() {
                body.push_str("No trades\n");
            } else {
                body.push_str(
                    "entry_time,exit_time,side,entry_price,exit_price,pnl,fees,exit_reason,duration_candles\n",
                );
                for trade in &stored.result.trade_log {
                    body.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{}\n",
                        trade.entry_time,
                        trade.exit_time,
                        trade.side,
                        trade.entry_price,
                        trade.exit_price,
                        trade.pnl,
                        trade.fees,
                        trade.exit_reason,
                        trade.duration_candles,
                    ));
                }
            }
            Ok((
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"backtest_{backtest_id}.csv\""),
                    ),
                ],
                body,
            )
                .into_response())
        }
        other => Err(bad_input(format!("unknown export format: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Signal config routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SignalConfigCreate {
    pub symbol: String,
    pub interval: String,
    pub strategy: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_stop_cross_pct")]
    pub stop_cross_pct: f64,
    #[serde(default = "default_portfolio")]
    pub portfolio: f64,
    pub invested_amount: Option<f64>,
    pub leverage: Option<f64>,
    #[serde(default = "default_cost_bps")]
    pub cost_bps: f64,
    pub polling_interval_s: Option<i64>,
}

fn default_stop_cross_pct() -> f64 {
    0.02
}

fn default_portfolio() -> f64 {
    10_000.0
}

fn default_cost_bps() -> f64 {
    10.0
}

pub async fn create_signal_config(
    State(state): State<AppState>,
    Json(req): Json<SignalConfigCreate>,
) -> ApiResult<Json<serde_json::Value>> {
    // validate strategy and interval up front
    create_strategy(&req.strategy)?;
    let interval: Interval = req.interval.parse()?;

    let leverage = match (req.invested_amount, req.leverage) {
        (None, None) => Some(1.0),
        (_, leverage) => leverage,
    };

    let params = if req.params.is_null() { json!({}) } else { req.params };
    // serde_json maps are key-ordered, so this string form is canonical
    let params_json = serde_json::to_string(&params).map_err(EngineError::from)?;

    let config_id = state
        .db
        .insert_config(&NewSignalConfig {
            symbol: req.symbol.to_uppercase(),
            interval: interval.as_str().to_string(),
            strategy: req.strategy,
            params: params_json,
            stop_cross_pct: req.stop_cross_pct,
            portfolio: req.portfolio,
            invested_amount: req.invested_amount,
            leverage,
            cost_bps: req.cost_bps,
            polling_interval_s: req.polling_interval_s,
        })
        .await?;

    Ok(Json(json!({"id": config_id, "status": "created"})))
}

#[derive(Debug, Deserialize)]
pub struct ListConfigsQuery {
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_signal_configs(
    State(state): State<AppState>,
    Query(query): Query<ListConfigsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let configs = state.db.list_configs(query.active_only).await?;

    // decode the stored canonical params for the response
    let decoded: Vec<serde_json::Value> = configs
        .iter()
        .map(|config| {
            let mut value = serde_json::to_value(config).unwrap_or_default();
            value["params"] = config.params_value();
            value
        })
        .collect();
    Ok(Json(json!({"configs": decoded})))
}

#[derive(Debug, Deserialize)]
pub struct SignalConfigPatch {
    pub active: Option<bool>,
    pub stop_cross_pct: Option<f64>,
    pub portfolio: Option<f64>,
    pub invested_amount: Option<f64>,
    pub leverage: Option<f64>,
    pub cost_bps: Option<f64>,
    pub polling_interval_s: Option<i64>,
}

pub async fn patch_signal_config(
    State(state): State<AppState>,
    Path(config_id): Path<i64>,
    Json(req): Json<SignalConfigPatch>,
) -> ApiResult<Json<serde_json::Value>> {
    let patch = ConfigPatch {
        active: req.active,
        stop_cross_pct: req.stop_cross_pct,
        portfolio: req.portfolio,
        invested_amount: req.invested_amount,
        leverage: req.leverage,
        cost_bps: req.cost_bps,
        polling_interval_s: req.polling_interval_s,
    };
    if patch.is_empty() {
        return Err(bad_input("No fields to update"));
    }
    if !state.db.patch_config(config_id, &patch).await? {
        return Err(not_found(format!("Config {config_id} not found")));
    }
    Ok(Json(json!({"id": config_id, "status": "updated"})))
}

pub async fn delete_signal_config(
    State(state): State<AppState>,
    Path(config_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.delete_config(config_id).await? {
        return Err(not_found(format!("Config {config_id} not found")));
    }
    Ok(Json(json!({"id": config_id, "status": "deleted"})))
}

// ---------------------------------------------------------------------------
// Signal + sim trade routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListSignalsQuery {
    pub config_id: Option<i64>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_signals(
    State(state): State<AppState>,
    Query(query): Query<ListSignalsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let signals = state
        .db
        .list_signals(query.config_id, query.status.as_deref(), limit)
        .await?;
    Ok(Json(json!({"signals": signals})))
}

pub async fn signals_status(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let overview = state.db.signals_overview().await?;
    Ok(Json(serde_json::to_value(overview).map_err(EngineError::from)?))
}

pub async fn get_signal(
    State(state): State<AppState>,
    Path(signal_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let signal = state
        .db
        .get_signal(signal_id)
        .await?
        .ok_or_else(|| not_found(format!("Signal {signal_id} not found")))?;
    Ok(Json(serde_json::to_value(signal).map_err(EngineError::from)?))
}

pub async fn list_sim_trades(
    State(state): State<AppState>,
    Query(query): Query<ListSignalsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trades = state
        .db
        .list_sim_trades(query.config_id, query.status.as_deref(), limit)
        .await?;
    Ok(Json(json!({"sim_trades": trades})))
}

pub async fn get_sim_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let trade = state
        .db
        .get_sim_trade(trade_id)
        .await?
        .ok_or_else(|| not_found(format!("SimTrade {trade_id} not found")))?;
    Ok(Json(serde_json::to_value(trade).map_err(EngineError::from)?))
}

/// Manually close an open simulated trade at the current market price.
pub async fn close_sim_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let trade = state
        .db
        .open_trades()
        .await?
        .into_iter()
        .find(|t| t.id == trade_id)
        .ok_or_else(|| not_found("SimTrade not found or not open"))?;

    let current_price = state
        .client
        .get_ticker_price(&trade.symbol)
        .await
        .map_err(|err| ApiError(EngineError::UpstreamUnavailable(format!("Could not fetch price: {err}"))))?;

    let close = build_trade_close(&trade, current_price, now_ms(), "manual");
    state.db.close_trade(trade.id, trade.signal_id, &close).await?;

    Ok(Json(json!({
        "id": trade_id,
        "status": "closed",
        "exit_price": current_price,
        "pnl": close.pnl,
        "pnl_pct": close.pnl_pct,
    })))
}

// ---------------------------------------------------------------------------
// Real trade routes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RealTradeCreate {
    pub sim_trade_id: Option<i64>,
    pub signal_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub entry_time: String,
    pub quantity: f64,
    #[serde(default)]
    pub fees: f64,
    pub notes: Option<String>,
}

pub async fn create_real_trade(
    State(state): State<AppState>,
    Json(req): Json<RealTradeCreate>,
) -> ApiResult<Json<serde_json::Value>> {
    let trade_id = state
        .db
        .insert_real_trade(&NewRealTrade {
            sim_trade_id: req.sim_trade_id,
            signal_id: req.signal_id,
            symbol: req.symbol.to_uppercase(),
            side: req.side,
            entry_price: req.entry_price,
            entry_time: req.entry_time,
            quantity: req.quantity,
            fees: req.fees,
            notes: req.notes,
        })
        .await?;
    Ok(Json(json!({"id": trade_id, "status": "created"})))
}

#[derive(Debug, Deserialize)]
pub struct ListRealTradesQuery {
    pub sim_trade_id: Option<i64>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_real_trades(
    State(state): State<AppState>,
    Query(query): Query<ListRealTradesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let trades = state
        .db
        .list_real_trades(query.sim_trade_id, query.status.as_deref(), limit)
        .await?;
    Ok(Json(json!({"real_trades": trades})))
}

#[derive(Debug, Deserialize)]
pub struct RealTradePatchRequest {
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub fees: Option<f64>,
    pub pnl: Option<f64>,
    pub notes: Option<String>,
    pub status: Option<String>,
}

pub async fn patch_real_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
    Json(req): Json<RealTradePatchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let patch = RealTradePatch {
        exit_price: req.exit_price,
        exit_time: req.exit_time,
        fees: req.fees,
        pnl: req.pnl,
        notes: req.notes,
        status: req.status,
    };
    if patch.is_empty() {
        return Err(bad_input("No fields to update"));
    }
    if !state.db.patch_real_trade(trade_id, &patch).await? {
        return Err(not_found(format!("RealTrade {trade_id} not found")));
    }
    Ok(Json(json!({"id": trade_id, "status": "updated"})))
}

pub async fn delete_real_trade(
    State(state): State<AppState>,
    Path(trade_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.db.delete_real_trade(trade_id).await? {
        return Err(not_found(format!("RealTrade {trade_id} not found")));
    }
    Ok(Json(json!({"id": trade_id, "status": "deleted"})))
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

/// Expected-candle count helper for range previews in the UI.
#[derive(Debug, Deserialize)]
pub struct RangePreviewQuery {
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
}

pub async fn preview_range(Query(query): Query<RangePreviewQuery>) -> ApiResult<Json<serde_json::Value>> {
    let interval: Interval = query.interval.parse()?;
    if query.end_time <= query.start_time {
        return Err(bad_input("end_time must be > start_time"));
    }
    let expected = expected_open_times(query.start_time, query.end_time, interval);
    Ok(Json(json!({
        "interval": interval.as_str(),
        "expected_candles": expected.len(),
        "first_open_time": expected.first(),
        "last_open_time": expected.last(),
    })))
}
