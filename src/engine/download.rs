use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::database::jobs::JobUpdate;
use crate::database::{now_iso, Database};
use crate::error::Result;
use crate::exchange::{parse_candle, validate_candle, BinanceClient};
use crate::types::{Candle, Interval, JobStatus};

/// Upstream kline request limit; gaps are fetched in batches of this size.
const BATCH_SIZE: usize = 500;

/// Open times that should exist in `[start_ms, end_ms)`: ascending,
/// step-aligned, starting at `start_ms` aligned up to the next boundary.
pub fn expected_open_times(start_ms: i64, end_ms: i64, interval: Interval) -> Vec<i64> {
    let step = interval.step_ms();
    let mut aligned = (start_ms / step) * step;
    if aligned < start_ms {
        aligned += step;
    }

    let mut times = Vec::new();
    let mut t = aligned;
    while t < end_ms {
        times.push(t);
        t += step;
    }
    times
}

type SyncKey = (String, Interval);

/// Job-oriented gap-filling downloader plus the background ensure path used
/// by the scanner and tracker.
pub struct DownloadEngine {
    db: Database,
    client: Arc<BinanceClient>,
    /// Monotone write-through cache: end_ms up to which the store is known
    /// complete per (symbol, interval). Candles are immutable once ingested,
    /// so nothing ever invalidates it.
    verified_upto: Mutex<HashMap<SyncKey, i64>>,
    /// Pairs with an in-flight background sync. Always released when the
    /// task exits, success or not.
    syncing: Mutex<HashSet<SyncKey>>,
    active_jobs: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl DownloadEngine {
    pub fn new(db: Database, client: Arc<BinanceClient>) -> Arc<Self> {
        Arc::new(Self {
            db,
            client,
            verified_upto: Mutex::new(HashMap::new()),
            syncing: Mutex::new(HashSet::new()),
            active_jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Schedule a created job as a detached background task.
    pub fn spawn_job(self: &Arc<Self>, job_id: i64) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_job(job_id).await;
            engine.active_jobs.lock().expect("jobs lock").remove(&job_id);
        });
        self.active_jobs.lock().expect("jobs lock").insert(job_id, handle);
    }

    /// Run a download job to a terminal state. Errors mark the job failed;
    /// cancellation between batches returns cleanly.
    pub async fn run_job(&self, job_id: i64) {
        if let Err(err) = self.run_job_inner(job_id).await {
            error!("Download job {} failed: {}", job_id, err);
            let _ = self
                .db
                .update_job(
                    job_id,
                    JobUpdate {
                        status: Some(JobStatus::Failed),
                        log_entry: Some(&format!("Error: {err}")),
                        ..JobUpdate::default()
                    },
                )
                .await;
        }
    }

    async fn run_job_inner(&self, job_id: i64) -> Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status == JobStatus::Cancelled {
            return Ok(());
        }

        let symbol = job.symbol.clone();
        let interval: Interval = job.interval.parse()?;
        let step = interval.step_ms();
        let (start_ms, end_ms) = (job.start_time, job.end_time);

        self.db
            .update_job(
                job_id,
                JobUpdate {
                    status: Some(JobStatus::Running),
                    log_entry: Some(&format!("Download started for {symbol} {interval}")),
                    ..JobUpdate::default()
                },
            )
            .await?;

        let expected = expected_open_times(start_ms, end_ms, interval);
        let candles_expected = expected.len();
        self.db
            .update_job(
                job_id,
                JobUpdate {
                    candles_expected: Some(candles_expected as i64),
                    log_entry: Some(&format!("Expected {candles_expected} candles")),
                    ..JobUpdate::default()
                },
            )
            .await?;

        let existing = self.db.existing_open_times(&symbol, interval, start_ms, end_ms).await?;
        let gaps: Vec<i64> = expected.iter().copied().filter(|t| !existing.contains(t)).collect();
        self.db
            .update_job(
                job_id,
                JobUpdate {
                    gaps_found: Some(gaps.len() as i64),
                    log_entry: Some(&format!("Found {} missing candles", gaps.len())),
                    ..JobUpdate::default()
                },
            )
            .await?;

        let mut total_downloaded = existing.len();
        let downloaded_at = now_iso();

        let mut i = 0;
        while i < gaps.len() {
            // Cancellation is cooperative: re-check the row between batches
            if self.db.job_status(job_id).await? == Some(JobStatus::Cancelled) {
                info!("Job {} cancelled", job_id);
                return Ok(());
            }

            let batch_end_idx = (i + BATCH_SIZE).min(gaps.len());
            let batch_start = gaps[i];
            let batch_end = gaps[batch_end_idx - 1] + step;

            let raw_candles = self
                .client
                .get_klines(&symbol, interval, Some(batch_start), Some(batch_end - 1), BATCH_SIZE as u32)
                .await?;

            let candles = parse_valid_candles(&raw_candles, &symbol, interval, &downloaded_at);
            let inserted = self.db.upsert_candles(&candles).await?;
            total_downloaded += inserted;
            i = batch_end_idx;

            let progress = (total_downloaded as f64 / candles_expected.max(1) as f64 * 100.0).min(100.0);
            self.db
                .update_job(
                    job_id,
                    JobUpdate {
                        candles_downloaded: Some(total_downloaded as i64),
                        progress_pct: Some(progress),
                        log_entry: Some(&format!("Batch done: {total_downloaded}/{candles_expected} candles")),
                        ..JobUpdate::default()
                    },
                )
                .await?;
        }

        let final_existing = self.db.existing_open_times(&symbol, interval, start_ms, end_ms).await?;
        let final_gaps = expected.iter().filter(|t| !final_existing.contains(t)).count();
        self.db
            .update_job(
                job_id,
                JobUpdate {
                    status: Some(JobStatus::Completed),
                    progress_pct: Some(100.0),
                    candles_downloaded: Some(final_existing.len() as i64),
                    gaps_found: Some(final_gaps as i64),
                    log_entry: Some(&format!("Download complete. Remaining gaps: {final_gaps}")),
                    ..JobUpdate::default()
                },
            )
            .await?;

        Ok(())
    }

    /// Non-blocking data-coherence check over `[start_ms, end_ms)`.
    ///
    /// Returns true only when a subsequent read of the range is guaranteed
    /// complete. Returns false after scheduling (or while running) a
    /// background sync — the caller should skip its current cycle.
    pub async fn ensure_candles(
        self: &Arc<Self>,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<bool> {
        let key: SyncKey = (symbol.to_string(), interval);

        // Fast path: already verified up to (or beyond) end_ms
        if self.verified_upto.lock().expect("cache lock").get(&key).copied().unwrap_or(0) >= end_ms {
            return Ok(true);
        }

        // A sync is already in flight for this pair
        if self.syncing.lock().expect("syncing lock").contains(&key) {
            return Ok(false);
        }

        // Cheap completeness probe: row count plus the critical last candle
        let last_required = end_ms - interval.step_ms();
        let actual_count = self.db.count_candles_in_range(symbol, interval, start_ms, end_ms).await?;
        let has_last = self.db.has_candle(symbol, interval, last_required).await?;
        let expected_count = expected_open_times(start_ms, end_ms, interval).len() as i64;

        if has_last && actual_count >= expected_count {
            self.verified_upto.lock().expect("cache lock").insert(key, end_ms);
            return Ok(true);
        }

        self.syncing.lock().expect("syncing lock").insert(key.clone());
        let engine = Arc::clone(self);
        let symbol_owned = symbol.to_string();
        tokio::spawn(async move {
            engine.sync_gaps(&symbol_owned, interval, start_ms, end_ms).await;
            engine
                .syncing
                .lock()
                .expect("syncing lock")
                .remove(&(symbol_owned, interval));
        });

        info!(
            "ensure_candles: launched async sync for {} {} ({}/{} candles present)",
            symbol, interval, actual_count, expected_count
        );
        Ok(false)
    }

    /// Background gap fill without a job row. Failures abort quietly; the
    /// next caller cycle retries. The verified cache is only advanced on a
    /// confirmed-complete range.
    async fn sync_gaps(&self, symbol: &str, interval: Interval, start_ms: i64, end_ms: i64) {
        let expected = expected_open_times(start_ms, end_ms, interval);
        if expected.is_empty() {
            return;
        }

        let key: SyncKey = (symbol.to_string(), interval);
        let step = interval.step_ms();
        let downloaded_at = now_iso();

        let existing = match self.db.existing_open_times(symbol, interval, start_ms, end_ms).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!("ensure_candles: store query failed for {} {}: {}", symbol, interval, err);
                return;
            }
        };
        let gaps: Vec<i64> = expected.iter().copied().filter(|t| !existing.contains(t)).collect();
        if gaps.is_empty() {
            self.verified_upto.lock().expect("cache lock").insert(key, end_ms);
            return;
        }

        info!(
            "ensure_candles: syncing {} missing candles for {} {}",
            gaps.len(),
            symbol,
            interval
        );

        let mut i = 0;
        while i < gaps.len() {
            let batch_end_idx = (i + BATCH_SIZE).min(gaps.len());
            let batch_start = gaps[i];
            let batch_end = gaps[batch_end_idx - 1] + step;

            let raw_candles = match self
                .client
                .get_klines(symbol, interval, Some(batch_start), Some(batch_end - 1), BATCH_SIZE as u32)
                .await
            {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(
                        "ensure_candles: klines fetch failed for {} {} batch {}: {}",
                        symbol, interval, i, err
                    );
                    return; // will retry on the next caller cycle
                }
            };

            let candles = parse_valid_candles(&raw_candles, symbol, interval, &downloaded_at);
            if let Err(err) = self.db.upsert_candles(&candles).await {
                warn!("ensure_candles: upsert failed for {} {}: {}", symbol, interval, err);
                return;
            }
            i = batch_end_idx;
        }

        match self.db.existing_open_times(symbol, interval, start_ms, end_ms).await {
            Ok(final_existing) => {
                let final_gaps = expected.iter().filter(|t| !final_existing.contains(t)).count();
                if final_gaps == 0 {
                    self.verified_upto.lock().expect("cache lock").insert(key, end_ms);
                    info!("ensure_candles: sync complete for {} {}", symbol, interval);
                } else {
                    warn!(
                        "ensure_candles: {} gaps remain for {} {} after sync",
                        final_gaps, symbol, interval
                    );
                }
            }
            Err(err) => {
                warn!(
                    "ensure_candles: final verification failed for {} {}: {}",
                    symbol, interval, err
                );
            }
        }
    }
}

fn parse_valid_candles(
    raw_candles: &[Vec<serde_json::Value>],
    symbol: &str,
    interval: Interval,
    downloaded_at: &str,
) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(raw_candles.len());
    for raw in raw_candles {
        let candle = parse_candle(raw, symbol, interval, downloaded_at);
        if validate_candle(&candle) {
            candles.push(candle);
        } else {
            warn!("Invalid candle skipped: {} {} @ {}", symbol, interval, candle.open_time);
        }
    }
    candles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::klines::test_support::make_candle;

    fn engine_with_db(db: Database) -> Arc<DownloadEngine> {
        DownloadEngine::new(db, Arc::new(BinanceClient::new()))
    }

    #[test]
    fn test_expected_open_times_are_aligned_and_half_open() {
        let step = Interval::H1.step_ms();

        // unaligned start aligns up to the next boundary
        let times = expected_open_times(step + 1, 4 * step, Interval::H1);
        assert_eq!(times, vec![2 * step, 3 * step]);

        // aligned start is kept; end is exclusive
        let times = expected_open_times(0, 3 * step, Interval::H1);
        assert_eq!(times, vec![0, step, 2 * step]);

        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], step);
        }

        assert!(expected_open_times(5 * step, 5 * step, Interval::H1).is_empty());
    }

    #[tokio::test]
    async fn test_gap_detection() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();

        // candles at {0,1,2,4,5}*step: the gap is exactly {3*step}
        let candles: Vec<_> = [0, 1, 2, 4, 5]
            .iter()
            .map(|i| make_candle("BTCUSDT", Interval::H1, i * step))
            .collect();
        db.upsert_candles(&candles).await.unwrap();

        let expected = expected_open_times(0, 6 * step, Interval::H1);
        assert_eq!(expected.len(), 6);

        let existing = db.existing_open_times("BTCUSDT", Interval::H1, 0, 6 * step).await.unwrap();
        let gaps: Vec<i64> = expected.iter().copied().filter(|t| !existing.contains(t)).collect();
        assert_eq!(gaps, vec![3 * step]);
    }

    #[tokio::test]
    async fn test_ensure_candles_true_when_complete() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();
        let start = 1000 * step;
        let end = start + 5 * step;

        let candles: Vec<_> = (0..5).map(|i| make_candle("BTCUSDT", Interval::H1, start + i * step)).collect();
        db.upsert_candles(&candles).await.unwrap();

        let engine = engine_with_db(db);
        assert!(engine.ensure_candles("BTCUSDT", Interval::H1, start, end).await.unwrap());

        // completeness is cached for the fast path
        let cached = engine
            .verified_upto
            .lock()
            .unwrap()
            .get(&("BTCUSDT".to_string(), Interval::H1))
            .copied();
        assert_eq!(cached, Some(end));
    }

    #[tokio::test]
    async fn test_ensure_candles_fast_path_skips_store() {
        let db = Database::in_memory().await.unwrap();
        let engine = engine_with_db(db);
        let step = Interval::H1.step_ms();

        engine
            .verified_upto
            .lock()
            .unwrap()
            .insert(("BTCUSDT".to_string(), Interval::H1), 100 * step);

        // no candles stored at all, but the cache short-circuits
        assert!(engine.ensure_candles("BTCUSDT", Interval::H1, 0, 50 * step).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_candles_dedups_inflight_sync() {
        let db = Database::in_memory().await.unwrap();
        let engine = engine_with_db(db);

        engine
            .syncing
            .lock()
            .unwrap()
            .insert(("BTCUSDT".to_string(), Interval::H1));

        // a duplicate call reports not-ready without scheduling anything
        let ready = engine
            .ensure_candles("BTCUSDT", Interval::H1, 0, 5 * Interval::H1.step_ms())
            .await
            .unwrap();
        assert!(!ready);
    }

    #[tokio::test]
    async fn test_run_job_completes_without_fetch_when_range_present() {
        let db = Database::in_memory().await.unwrap();
        let step = Interval::H1.step_ms();
        let candles: Vec<_> = (0..6).map(|i| make_candle("BTCUSDT", Interval::H1, i * step)).collect();
        db.upsert_candles(&candles).await.unwrap();

        let engine = engine_with_db(db.clone());
        let job_id = db.create_job("BTCUSDT", "1h", 0, 6 * step).await.unwrap();
        engine.run_job(job_id).await;

        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_pct, 100.0);
        assert_eq!(job.candles_expected, 6);
        assert_eq!(job.candles_downloaded, 6);
        assert_eq!(job.gaps_found, 0);
    }

    #[tokio::test]
    async fn test_run_job_respects_prior_cancellation() {
        let db = Database::in_memory().await.unwrap();
        let engine = engine_with_db(db.clone());

        let job_id = db.create_job("BTCUSDT", "1h", 0, 6 * Interval::H1.step_ms()).await.unwrap();
        db.cancel_job(job_id).await.unwrap();

        engine.run_job(job_id).await;
        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_job_with_bad_interval_fails() {
        let db = Database::in_memory().await.unwrap();
        let engine = engine_with_db(db.clone());

        let job_id = db.create_job("BTCUSDT", "7m", 0, 1_000_000).await.unwrap();
        engine.run_job(job_id).await;

        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
