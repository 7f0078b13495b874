use std::path::Path;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

use super::api;
use super::state::AppState;
use crate::error::Result;

/// Build the full API router. The frontend bundle is served statically
/// when a dist directory exists next to the binary.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // data
        .route("/pairs", get(api::list_pairs))
        .route("/download", post(api::start_download))
        .route("/download/:job_id", get(api::get_download_status))
        .route("/download/:job_id/cancel", get(api::cancel_download))
        .route("/candles", get(api::get_candles))
        .route("/candles/preview", get(api::preview_range))
        .route("/coverage", get(api::data_coverage))
        .route("/rate-limit", get(api::rate_limit_status))
        .route("/metrics/compute", post(api::compute_metrics_endpoint))
        .route("/metrics/status", get(api::metrics_status))
        // backtest
        .route("/strategies", get(api::get_strategies))
        .route("/backtest", post(api::start_backtest))
        .route("/backtest/:backtest_id", get(api::get_backtest))
        .route("/backtest/:backtest_id/export", get(api::export_backtest))
        // signal configs
        .route("/signals/configs", post(api::create_signal_config))
        .route("/signals/configs", get(api::list_signal_configs))
        .route("/signals/configs/:config_id", patch(api::patch_signal_config))
        .route("/signals/configs/:config_id", delete(api::delete_signal_config))
        // signals + trades
        .route("/signals", get(api::list_signals))
        .route("/signals/status", get(api::signals_status))
        .route("/signals/:signal_id", get(api::get_signal))
        .route("/sim-trades", get(api::list_sim_trades))
        .route("/sim-trades/:trade_id", get(api::get_sim_trade))
        .route("/sim-trades/:trade_id/close", post(api::close_sim_trade))
        .route("/real-trades", post(api::create_real_trade))
        .route("/real-trades", get(api::list_real_trades))
        .route("/real-trades/:trade_id", patch(api::patch_real_trade))
        .route("/real-trades/:trade_id", delete(api::delete_real_trade));

    let mut router = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let frontend_dist = Path::new("frontend/dist");
    if frontend_dist.exists() {
        router = router.fallback_service(ServeDir::new(frontend_dist).append_index_html_on_directories(true));
    }

    router
}

/// Serve the API until the shutdown channel fires.
pub async fn serve(state: AppState, host: &str, port: u16, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let router = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;

    info!("API listening on http://{}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::engine::DownloadEngine;
    use crate::exchange::BinanceClient;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_router_builds() {
        let db = Database::in_memory().await.unwrap();
        let client = Arc::new(BinanceClient::new());
        let downloads = DownloadEngine::new(db.clone(), Arc::clone(&client));
        let state = AppState::new(db, client, downloads);
        let _router = build_router(state);
    }
}
