//! Rolling-window numeric kernels shared by the metrics engine and the
//! strategies. All functions take plain `f64` slices and mark warm-up (and
//! any window touching a NaN input) with NaN in the output.

use std::collections::VecDeque;

/// Rolling maximum over `window` values ending at each index, computed with
/// a monotonic deque in O(n).
pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |a, b| a >= b)
}

/// Rolling minimum over `window` values ending at each index.
pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |a, b| a <= b)
}

fn rolling_extreme(values: &[f64], window: usize, keep: fn(f64, f64) -> bool) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n == 0 {
        return out;
    }

    // Deque holds candidate indices in dominance order.
    let mut deque: VecDeque<usize> = VecDeque::new();
    let mut nan_count = 0usize;

    for t in 0..n {
        if values[t].is_nan() {
            nan_count += 1;
        }
        while let Some(&back) = deque.back() {
            if keep(values[t], values[back]) {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(t);

        // Evict entries that fell out of the window.
        if t >= window {
            let expired = t - window;
            if values[expired].is_nan() {
                nan_count -= 1;
            }
            while deque.front().is_some_and(|&f| f <= expired) {
                deque.pop_front();
            }
        }

        if t + 1 >= window && nan_count == 0 {
            out[t] = values[*deque.front().expect("deque non-empty")];
        }
    }

    out
}

/// Rolling arithmetic mean (simple moving average).
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n == 0 {
        return out;
    }

    let mut sum = 0.0;
    let mut nan_count = 0usize;
    for t in 0..n {
        if values[t].is_nan() {
            nan_count += 1;
        } else {
            sum += values[t];
        }
        if t >= window {
            let expired = values[t - window];
            if expired.is_nan() {
                nan_count -= 1;
            } else {
                sum -= expired;
            }
        }
        if t + 1 >= window && nan_count == 0 {
            out[t] = sum / window as f64;
        }
    }

    out
}

/// Rolling population standard deviation via sliding sum of squares.
pub fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n == 0 {
        return out;
    }

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut nan_count = 0usize;
    for t in 0..n {
        if values[t].is_nan() {
            nan_count += 1;
        } else {
            sum += values[t];
            sum_sq += values[t] * values[t];
        }
        if t >= window {
            let expired = values[t - window];
            if expired.is_nan() {
                nan_count -= 1;
            } else {
                sum -= expired;
                sum_sq -= expired * expired;
            }
        }
        if t + 1 >= window && nan_count == 0 {
            let mean = sum / window as f64;
            let variance = (sum_sq / window as f64 - mean * mean).max(0.0);
            out[t] = variance.sqrt();
        }
    }

    out
}

/// Exponential moving average with span semantics: `alpha = 2/(span+1)`,
/// seeded at the first value.
pub fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if n == 0 || span == 0 {
        return out;
    }

    let alpha = 2.0 / (span as f64 + 1.0);
    let mut prev = values[0];
    out[0] = prev;
    for t in 1..n {
        prev = alpha * values[t] + (1.0 - alpha) * prev;
        out[t] = prev;
    }

    out
}

/// True range per bar: max(high-low, |high-prev_close|, |low-prev_close|).
/// The first bar has no previous close and uses high-low.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let n = high.len();
    let mut out = vec![f64::NAN; n];
    for t in 0..n {
        let hl = high[t] - low[t];
        out[t] = if t == 0 {
            hl
        } else {
            let hc = (high[t] - close[t - 1]).abs();
            let lc = (low[t] - close[t - 1]).abs();
            hl.max(hc).max(lc)
        };
    }
    out
}

/// Shift a series forward by one bar, leaving NaN at index 0. Used to
/// exclude the current bar from lookback windows.
pub fn shift_one(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if n > 1 {
        out[1..n].copy_from_slice(&values[..n - 1]);
    }
    out
}
