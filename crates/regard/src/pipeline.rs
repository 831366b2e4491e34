use crate::fetchers::{self, MentionsFetcher, SignalFetcher};
use crate::history;
use crate::narrative::{score_with_mode, BlendWeights, NarrativeProvider};
use crate::progress::{ProgressTracker, UploadStage};
use crate::score_engine::ScoreWeights;
use crate::trade_ingest::{self, ParseError};
use crate::trade_scoring::{self, ScoredTrade, UserRegardResult};
use anyhow::Result;
use common::db::AsyncDb;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file is too large ({size} bytes, limit {max})")]
    FileTooLarge { size: usize, max: usize },
    #[error("could not parse trade history: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// External services the pipeline talks to. Generic so tests can run the
/// whole pipeline against in-memory fakes.
pub struct PipelineDeps<S, M, N> {
    pub market: S,
    pub mentions: M,
    pub narrative: N,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub weights: ScoreWeights,
    pub unknown_threshold: usize,
    pub ai_enabled: bool,
    pub ai_timeout: Duration,
    pub blend: BlendWeights,
    pub history_tolerance_days: u32,
    pub max_file_bytes: usize,
    pub max_run_secs: u64,
}

/// Run one upload end to end and leave the outcome in the tracker.
///
/// The whole run sits under a single deadline; a hung provider or a
/// pathological file ends as a failed upload with a readable reason, never
/// as a stuck in-progress entry. The caller must have registered the
/// upload with [`ProgressTracker::begin`] already.
pub async fn process_upload<S, M, N>(
    db: &AsyncDb,
    tracker: &ProgressTracker,
    deps: &PipelineDeps<S, M, N>,
    settings: &PipelineSettings,
    user_id: &str,
    content: String,
) where
    S: SignalFetcher,
    M: MentionsFetcher,
    N: NarrativeProvider,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(settings.max_run_secs),
        run_stages(db, tracker, deps, settings, user_id, content),
    )
    .await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("regard_upload_duration_ms").record(elapsed_ms);

    match outcome {
        Ok(Ok(result)) => {
            tracker.complete(user_id);
            metrics::counter!("regard_uploads_total", "status" => "ok").increment(1);
            tracing::info!(
                user_id,
                regard_score = ?result.regard_score,
                sample_size = result.sample_size,
                skipped_rows = result.skipped_rows,
                elapsed_ms,
                "upload analysis finished"
            );
        }
        Ok(Err(e)) => {
            tracker.fail(user_id, &e.to_string());
            metrics::counter!("regard_uploads_total", "status" => "error").increment(1);
            tracing::warn!(user_id, error = %e, "upload analysis failed");
        }
        Err(_) => {
            let reason = format!("analysis timed out after {}s", settings.max_run_secs);
            tracker.fail(user_id, &reason);
            metrics::counter!("regard_uploads_total", "status" => "timeout").increment(1);
            tracing::warn!(user_id, max_run_secs = settings.max_run_secs, "upload analysis timed out");
        }
    }
}

async fn run_stages<S, M, N>(
    db: &AsyncDb,
    tracker: &ProgressTracker,
    deps: &PipelineDeps<S, M, N>,
    settings: &PipelineSettings,
    user_id: &str,
    content: String,
) -> Result<UserRegardResult, UploadError>
where
    S: SignalFetcher,
    M: MentionsFetcher,
    N: NarrativeProvider,
{
    if content.len() > settings.max_file_bytes {
        return Err(UploadError::FileTooLarge {
            size: content.len(),
            max: settings.max_file_bytes,
        });
    }

    tracker.advance(user_id, UploadStage::Parse);
    let parsed = trade_ingest::parse_trade_history(&content)?;
    tracing::debug!(
        user_id,
        trades = parsed.trades.len(),
        open_positions = parsed.open_positions.len(),
        skipped_rows = parsed.skipped_rows,
        "parsed trade history"
    );

    tracker.advance(user_id, UploadStage::Score);
    // A live score is fetched at most once per ticker; every trade on that
    // ticker without a usable historical snapshot shares it.
    let mut live_cache: HashMap<String, Option<f64>> = HashMap::new();
    let mut scored_trades = Vec::with_capacity(parsed.trades.len());
    for trade in parsed.trades {
        let historical = history::score_near(
            db,
            &trade.ticker,
            trade.entry_time,
            settings.history_tolerance_days,
        )
        .await?;

        let entry_score = match historical {
            Some(score) => Some(score),
            None => match live_cache.get(&trade.ticker) {
                Some(cached) => *cached,
                None => {
                    let live = live_entry_score(deps, settings, &trade.ticker).await;
                    live_cache.insert(trade.ticker.clone(), live);
                    live
                }
            },
        };
        scored_trades.push(ScoredTrade { trade, entry_score });
    }

    tracker.advance(user_id, UploadStage::Aggregate);
    let result = trade_scoring::aggregate(
        &scored_trades,
        &parsed.open_positions,
        parsed.skipped_rows,
    );

    tracker.advance(user_id, UploadStage::Save);
    persist(db, user_id, scored_trades, &result).await?;

    Ok(result)
}

/// Best-effort current score for a ticker with no usable history. Any
/// failure along the way means the trade simply has no entry score.
async fn live_entry_score<S, M, N>(
    deps: &PipelineDeps<S, M, N>,
    settings: &PipelineSettings,
    ticker: &str,
) -> Option<f64>
where
    S: SignalFetcher,
    M: MentionsFetcher,
    N: NarrativeProvider,
{
    let signal = match fetchers::fetch_signal(&deps.market, &deps.mentions, ticker).await {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(ticker, error = %e, "no live signal for entry score");
            return None;
        }
    };
    let scored = score_with_mode(
        &signal,
        &settings.weights,
        settings.unknown_threshold,
        &deps.narrative,
        settings.ai_enabled,
        settings.ai_timeout,
        &settings.blend,
    )
    .await;
    scored.score_raw
}

/// Replace the user's stored trades and summary in one transaction, so a
/// re-upload can never leave a mix of old and new rows.
async fn persist(
    db: &AsyncDb,
    user_id: &str,
    trades: Vec<ScoredTrade>,
    result: &UserRegardResult,
) -> Result<()> {
    let user_id = user_id.to_string();
    let result = result.clone();

    db.call_named("pipeline.save_results", move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM user_trades WHERE user_id = ?1",
            rusqlite::params![user_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_trades (
                    user_id, ticker, side, quantity, entry_time, exit_time,
                    entry_price, exit_price, realized_pnl, holding_period_secs,
                    entry_fees, exit_fees, regard_score_at_entry
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for st in &trades {
                let t = &st.trade;
                stmt.execute(rusqlite::params![
                    user_id,
                    t.ticker,
                    t.side.as_str(),
                    t.quantity,
                    t.entry_time.to_rfc3339(),
                    t.exit_time.to_rfc3339(),
                    t.entry_price,
                    t.exit_price,
                    t.realized_pnl,
                    t.holding_period_secs,
                    t.entry_fees,
                    t.exit_fees,
                    st.entry_score,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO user_regard_summaries (
                user_id, regard_score, wins, losses, win_rate, sample_size,
                skipped_rows, open_positions, avg_entry_score, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
             ON CONFLICT(user_id) DO UPDATE SET
                regard_score = excluded.regard_score,
                wins = excluded.wins,
                losses = excluded.losses,
                win_rate = excluded.win_rate,
                sample_size = excluded.sample_size,
                skipped_rows = excluded.skipped_rows,
                open_positions = excluded.open_positions,
                avg_entry_score = excluded.avg_entry_score,
                last_updated = excluded.last_updated",
            rusqlite::params![
                user_id,
                result.regard_score.map(i64::from),
                result.wins,
                result.losses,
                result.win_rate,
                result.sample_size,
                result.skipped_rows,
                result.open_positions,
                result.avg_entry_score,
            ],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::fakes::FakeMarket;
    use crate::narrative::StubNarrative;
    use crate::progress::UploadStatus;
    use chrono::TimeZone;

    const SAMPLE: &str = include_str!("../../../tests/fixtures/trade_history_sample.csv");

    fn settings() -> PipelineSettings {
        PipelineSettings {
            weights: ScoreWeights::default(),
            unknown_threshold: 4,
            ai_enabled: true,
            ai_timeout: Duration::from_secs(5),
            blend: BlendWeights::default(),
            history_tolerance_days: 7,
            max_file_bytes: 5 * 1024 * 1024,
            max_run_secs: 120,
        }
    }

    fn deps() -> PipelineDeps<FakeMarket, FakeMarket, StubNarrative> {
        PipelineDeps {
            market: FakeMarket::default(),
            mentions: FakeMarket::default(),
            narrative: StubNarrative::default(),
        }
    }

    #[tokio::test]
    async fn test_full_run_completes_and_persists() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();

        process_upload(&db, &tracker, &deps(), &settings(), "u1", SAMPLE.to_string()).await;

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Complete);
        assert_eq!(progress.percentage, 100);

        let (trade_rows, score): (i64, Option<i64>) = db
            .call(|conn| {
                let rows = conn.query_row(
                    "SELECT COUNT(*) FROM user_trades WHERE user_id = 'u1'",
                    [],
                    |row| row.get(0),
                )?;
                let score = conn.query_row(
                    "SELECT regard_score FROM user_regard_summaries WHERE user_id = 'u1'",
                    [],
                    |row| row.get(0),
                )?;
                Ok((rows, score))
            })
            .await
            .unwrap();
        assert_eq!(trade_rows, 2);
        assert!(score.is_some());
    }

    #[tokio::test]
    async fn test_reupload_replaces_previous_trades() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = ProgressTracker::new();

        tracker.begin("u1").unwrap();
        process_upload(&db, &tracker, &deps(), &settings(), "u1", SAMPLE.to_string()).await;
        tracker.begin("u1").unwrap();
        process_upload(&db, &tracker, &deps(), &settings(), "u1", SAMPLE.to_string()).await;

        let trade_rows: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM user_trades WHERE user_id = 'u1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(trade_rows, 2); // replaced, not appended
    }

    #[tokio::test]
    async fn test_parse_failure_marks_upload_failed() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();

        process_upload(
            &db,
            &tracker,
            &deps(),
            &settings(),
            "u1",
            "Date,Symbol\n2024-01-01,GME\n".to_string(),
        )
        .await;

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Failed);
        assert!(progress.error.unwrap().contains("missing required columns"));
    }

    #[tokio::test]
    async fn test_oversized_file_rejected() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();

        let mut cfg = settings();
        cfg.max_file_bytes = 16;
        process_upload(&db, &tracker, &deps(), &cfg, "u1", SAMPLE.to_string()).await;

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Failed);
        assert!(progress.error.unwrap().contains("too large"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_hits_deadline() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();

        let mut cfg = settings();
        cfg.max_run_secs = 30;
        cfg.ai_timeout = Duration::from_secs(600); // per-call timeout never fires
        let slow = PipelineDeps {
            market: FakeMarket::default(),
            mentions: FakeMarket::default(),
            narrative: StubNarrative {
                delay: Duration::from_secs(120),
                ..StubNarrative::default()
            },
        };

        process_upload(&db, &tracker, &slow, &cfg, "u1", SAMPLE.to_string()).await;

        let progress = tracker.get("u1").unwrap();
        assert_eq!(progress.status, UploadStatus::Failed);
        assert!(progress.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_historical_score_preferred_over_live() {
        use crate::narrative::ScoredTicker;
        use crate::score_engine::ScoreWeights;
        use common::types::{DataCompleteness, ScoringMode, TickerSignal};

        let db = AsyncDb::open(":memory:").await.unwrap();
        // Snapshot near the GME entry date in the sample file (2024-01-02).
        let snapshot_time = chrono::Utc
            .with_ymd_and_hms(2024, 1, 3, 12, 0, 0)
            .unwrap();
        let scored = ScoredTicker {
            symbol: "GME".to_string(),
            score_raw: Some(91.0),
            score_rounded: Some(91),
            base_score: Some(91.0),
            ai_score: None,
            breakdown: None,
            completeness: DataCompleteness::Partial,
            missing_factors: vec![],
            mode: ScoringMode::Fallback,
            ai_success: false,
        };
        let signal = TickerSignal {
            symbol: "GME".to_string(),
            ..TickerSignal::default()
        };
        history::record(&db, &scored, &signal, &ScoreWeights::default(), snapshot_time)
            .await
            .unwrap();

        let tracker = ProgressTracker::new();
        tracker.begin("u1").unwrap();
        process_upload(&db, &tracker, &deps(), &settings(), "u1", SAMPLE.to_string()).await;

        let entry_score: Option<f64> = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT regard_score_at_entry FROM user_trades
                     WHERE user_id = 'u1' AND ticker = 'GME'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(entry_score, Some(91.0));
    }
}
