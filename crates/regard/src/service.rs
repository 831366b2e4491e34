use crate::fetchers::{self, MentionsFetcher, SignalFetcher};
use crate::history::{self, HistoryEntry};
use crate::narrative::{score_with_mode, NarrativeProvider, ScoredTicker};
use crate::pipeline::{self, PipelineDeps, PipelineSettings};
use crate::progress::{ProgressError, ProgressTracker, UploadProgress};
use crate::report::{self, ReportError};
use crate::trade_scoring::UserRegardResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::db::AsyncDb;
use common::types::ApiQuote;
use std::sync::Arc;

/// Everything the outside world asks of the scorer goes through here:
/// on-demand ticker scores, upload analysis, progress polling, and reports.
pub struct RegardService<S, M, N> {
    db: AsyncDb,
    tracker: Arc<ProgressTracker>,
    deps: Arc<PipelineDeps<S, M, N>>,
    settings: PipelineSettings,
    history_lookback_days: u32,
}

impl<S, M, N> RegardService<S, M, N>
where
    S: SignalFetcher + Send + Sync + 'static,
    M: MentionsFetcher + Send + Sync + 'static,
    N: NarrativeProvider + Send + Sync + 'static,
{
    pub fn new(
        db: AsyncDb,
        deps: PipelineDeps<S, M, N>,
        settings: PipelineSettings,
        history_lookback_days: u32,
    ) -> Self {
        Self {
            db,
            tracker: Arc::new(ProgressTracker::new()),
            deps: Arc::new(deps),
            settings,
            history_lookback_days,
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    /// Score a ticker right now and persist the snapshot. A history write
    /// failure is logged but does not cost the caller their score.
    pub async fn compute_score(&self, symbol: &str) -> Result<ScoredTicker> {
        let signal = fetchers::fetch_signal(&self.deps.market, &self.deps.mentions, symbol).await?;
        let scored = score_with_mode(
            &signal,
            &self.settings.weights,
            self.settings.unknown_threshold,
            &self.deps.narrative,
            self.settings.ai_enabled,
            self.settings.ai_timeout,
            &self.settings.blend,
        )
        .await;

        if let Err(e) = history::record(
            &self.db,
            &scored,
            &signal,
            &self.settings.weights,
            Utc::now(),
        )
        .await
        {
            tracing::error!(symbol = %scored.symbol, error = %e, "failed to persist score snapshot");
        }

        Ok(scored)
    }

    /// Raw quote lookup, no scoring.
    pub async fn basic_info(&self, symbol: &str) -> Result<ApiQuote> {
        self.deps.market.fetch_quote(&symbol.to_uppercase()).await
    }

    /// Kick off analysis of an uploaded trade history. Returns immediately;
    /// the caller polls [`Self::get_progress`]. Rejected while an earlier
    /// upload for the same user is still running.
    pub fn start_upload(&self, user_id: &str, content: String) -> Result<(), ProgressError> {
        self.tracker.begin(user_id)?;

        let db = self.db.clone();
        let tracker = Arc::clone(&self.tracker);
        let deps = Arc::clone(&self.deps);
        let settings = self.settings.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            pipeline::process_upload(&db, &tracker, &deps, &settings, &user_id, content).await;
        });
        Ok(())
    }

    pub fn get_progress(&self, user_id: &str) -> Option<UploadProgress> {
        self.tracker.get(user_id)
    }

    /// Stored verdict from the user's most recent completed analysis.
    pub async fn get_user_result(&self, user_id: &str) -> Result<Option<UserRegardResult>> {
        let user_id = user_id.to_string();
        self.db
            .call_named("service.read_summary", move |conn| {
                let summary = conn
                    .query_row(
                        "SELECT regard_score, wins, losses, win_rate, sample_size,
                                skipped_rows, open_positions, avg_entry_score
                         FROM user_regard_summaries WHERE user_id = ?1",
                        rusqlite::params![user_id],
                        |row| {
                            Ok((
                                row.get::<_, Option<i64>>(0)?,
                                row.get::<_, u32>(1)?,
                                row.get::<_, u32>(2)?,
                                row.get::<_, Option<f64>>(3)?,
                                row.get::<_, u32>(4)?,
                                row.get::<_, u32>(5)?,
                                row.get::<_, u32>(6)?,
                                row.get::<_, Option<f64>>(7)?,
                            ))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let Some((
                    regard_score,
                    wins,
                    losses,
                    win_rate,
                    sample_size,
                    skipped_rows,
                    open_positions,
                    avg_entry_score,
                )) = summary
                else {
                    return Ok(None);
                };

                let (trade_count, avg_holding): (u32, Option<f64>) = conn.query_row(
                    "SELECT COUNT(*), AVG(holding_period_secs)
                     FROM user_trades WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                Ok(Some(UserRegardResult {
                    regard_score: regard_score.map(|s| s.clamp(0, 100) as u8),
                    wins,
                    losses,
                    win_rate,
                    sample_size,
                    trade_count,
                    open_positions,
                    skipped_rows,
                    avg_entry_score,
                    avg_holding_period_secs: avg_holding.map(|s| s as i64),
                }))
            })
            .await
    }

    /// Score history for a ticker, ascending, bounded by `lookback_days`.
    pub async fn get_history(&self, ticker: &str, lookback_days: u32) -> Result<Vec<HistoryEntry>> {
        history::recent_history(&self.db, ticker, lookback_days).await
    }

    /// Markdown report for the user's stored verdict, with a score
    /// trajectory built from the history of the tickers they traded.
    pub async fn generate_report(
        &self,
        user_id: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<String> {
        let result = self
            .get_user_result(user_id)
            .await?
            .context("no completed analysis for this user")?;

        let tickers: Vec<String> = {
            let user_id = user_id.to_string();
            self.db
                .call_named("service.report_tickers", move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT DISTINCT ticker FROM user_trades
                         WHERE user_id = ?1 ORDER BY ticker",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![user_id], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    Ok(rows)
                })
                .await?
        };
        let mut entries = Vec::new();
        for ticker in tickers {
            entries
                .extend(history::recent_history(&self.db, &ticker, self.history_lookback_days).await?);
        }
        entries.sort_by_key(|e| e.timestamp_utc);

        match report::render_report(user_id, &result, &entries, generated_at) {
            Ok(markdown) => Ok(markdown),
            Err(ReportError::InsufficientData) => {
                Err(anyhow::Error::new(ReportError::InsufficientData))
            }
        }
    }
}
