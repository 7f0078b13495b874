use serde::Serialize;

use crate::engine::backtest::TradeLogEntry;

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0 * 1000.0;

/// Performance summary computed from the equity curve and trade log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BacktestSummary {
    pub net_profit: f64,
    pub net_profit_pct: f64,
    pub cagr_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub n_trades: usize,
    pub win_rate_pct: f64,
    /// Gross win / |gross loss|; None when there are no losses.
    pub profit_factor: Option<f64>,
    pub expectancy: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// |avg win / avg loss|; None when there are no losses.
    pub payoff_ratio: Option<f64>,
    pub time_in_market_pct: f64,
    pub drawdown_curve: Vec<f64>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn candles_per_year(interval_ms: i64) -> f64 {
    MS_PER_YEAR / interval_ms.max(1) as f64
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}

/// Compute summary statistics. The equity curve holds one mark-to-market
/// value per candle; annualization derives from the interval step.
pub fn compute_backtest_metrics(
    equity_curve: &[f64],
    trade_log: &[TradeLogEntry],
    initial_capital: f64,
    interval_ms: i64,
) -> BacktestSummary {
    if equity_curve.is_empty() || initial_capital <= 0.0 {
        return BacktestSummary::default();
    }

    let n_candles = equity_curve.len();
    let final_equity = equity_curve[n_candles - 1];

    let net_profit = final_equity - initial_capital;
    let net_profit_pct = net_profit / initial_capital * 100.0;

    let cpy = candles_per_year(interval_ms);
    let years = if cpy > 0.0 { n_candles as f64 / cpy } else { 0.0 };
    let cagr = if years > 0.0 && final_equity > 0.0 {
        ((final_equity / initial_capital).powf(1.0 / years) - 1.0) * 100.0
    } else {
        0.0
    };

    // running-max drawdown series in percent
    let mut running_max = f64::MIN;
    let mut drawdown_curve = Vec::with_capacity(n_candles);
    for &equity in equity_curve {
        running_max = running_max.max(equity);
        drawdown_curve.push((equity - running_max) / running_max * 100.0);
    }
    let max_drawdown = drawdown_curve.iter().copied().fold(0.0_f64, f64::min);

    // per-candle returns for Sharpe/Sortino
    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect();
    let mut sharpe = 0.0;
    let mut sortino = 0.0;
    if returns.len() > 1 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let std = population_std(&returns);
        if std > 0.0 {
            sharpe = mean / std * cpy.sqrt();
        }
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_std = if downside.len() > 1 { population_std(&downside) } else { 0.0 };
        if downside_std > 0.0 {
            sortino = mean / downside_std * cpy.sqrt();
        }
    }

    let n_trades = trade_log.len();
    if n_trades == 0 {
        return BacktestSummary {
            net_profit,
            net_profit_pct,
            cagr_pct: cagr,
            max_drawdown_pct: max_drawdown,
            sharpe,
            sortino,
            n_trades: 0,
            win_rate_pct: 0.0,
            profit_factor: Some(0.0),
            expectancy: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            payoff_ratio: Some(0.0),
            time_in_market_pct: 0.0,
            drawdown_curve,
        };
    }

    let pnls: Vec<f64> = trade_log.iter().map(|t| t.pnl).collect();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();

    let win_rate = wins.len() as f64 / n_trades as f64 * 100.0;
    let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f64>() / losses.len() as f64
    };
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();
    let profit_factor = (gross_loss > 0.0).then(|| round4(gross_profit / gross_loss));
    let expectancy = pnls.iter().sum::<f64>() / n_trades as f64;
    let payoff_ratio = (avg_loss != 0.0).then(|| round4((avg_win / avg_loss).abs()));

    let in_market: i64 = trade_log.iter().map(|t| t.duration_candles).sum();
    let time_in_market_pct = in_market as f64 / n_candles.max(1) as f64 * 100.0;

    BacktestSummary {
        net_profit: round4(net_profit),
        net_profit_pct: round4(net_profit_pct),
        cagr_pct: round4(cagr),
        max_drawdown_pct: round4(max_drawdown),
        sharpe: round4(sharpe),
        sortino: round4(sortino),
        n_trades,
        win_rate_pct: round2(win_rate),
        profit_factor,
        expectancy: round4(expectancy),
        avg_win: round4(avg_win),
        avg_loss: round4(avg_loss),
        payoff_ratio,
        time_in_market_pct: round2(time_in_market_pct),
        drawdown_curve,
    }
}
