use crate::narrative::ScoredTicker;
use crate::score_engine::{ScoreWeights, MODEL_VERSION, SCORING_VERSION};
use anyhow::Result;
use chrono::{DateTime, Utc};
use common::db::AsyncDb;
use common::types::TickerSignal;

/// Mentions counts below this are flagged so readers know the hype
/// sub-score rests on thin social data.
const LOW_MENTIONS_SAMPLE: i64 = 10;

/// One persisted scoring snapshot, as read back from `regard_history`.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub ticker: String,
    pub timestamp_utc: DateTime<Utc>,
    pub score_raw: Option<f64>,
    pub score_rounded: Option<i64>,
    pub scoring_mode: String,
    pub ai_success: bool,
    pub base_score: Option<f64>,
    pub ai_score: Option<i64>,
    pub completeness: Option<String>,
    pub missing_factors: Vec<String>,
    pub total_mentions: i64,
    pub low_sample_size: bool,
    pub price_at_snapshot: Option<f64>,
    pub change_24h_pct: Option<f64>,
    pub model_version: Option<String>,
    pub scoring_version: Option<String>,
}

/// Persist one scored snapshot. Every row carries the model and scoring
/// versions plus the weight configuration that produced it, so historical
/// scores stay interpretable after a config change.
pub async fn record(
    db: &AsyncDb,
    scored: &ScoredTicker,
    signal: &TickerSignal,
    weights: &ScoreWeights,
    at: DateTime<Utc>,
) -> Result<i64> {
    let ticker = scored.symbol.clone();
    let timestamp = at.to_rfc3339();
    let score_raw = scored.score_raw;
    let score_rounded = scored.score_rounded.map(i64::from);
    let scoring_mode = scored.mode.as_str();
    let ai_success = scored.ai_success;
    let base_score = scored.base_score;
    let ai_score = scored.ai_score.map(i64::from);
    let completeness = scored.completeness.as_str();
    let missing_factors = serde_json::to_string(
        &scored
            .missing_factors
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>(),
    )?;
    let total_mentions = i64::try_from(signal.mentions_24h.unwrap_or(0)).unwrap_or(i64::MAX);
    let low_sample_size = total_mentions < LOW_MENTIONS_SAMPLE;
    let price = signal.price;
    let change_24h = signal.change_24h_pct;
    let volume = signal.volume;
    let market_cap = signal.market_cap;
    let config_snapshot = serde_json::json!({
        "hype": weights.hype,
        "volatility": weights.volatility,
        "liquidity": weights.liquidity,
        "risk": weights.risk,
    })
    .to_string();

    db.call_named("history.record", move |conn| {
        conn.execute(
            "INSERT INTO regard_history (
                ticker, timestamp_utc, score_raw, score_rounded, scoring_mode, ai_success,
                base_score, ai_score, completeness, missing_factors, total_mentions,
                low_sample_size, price_at_snapshot, change_24h_pct, volume_24h, market_cap,
                model_version, scoring_version, config_snapshot
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            rusqlite::params![
                ticker,
                timestamp,
                score_raw,
                score_rounded,
                scoring_mode,
                ai_success,
                base_score,
                ai_score,
                completeness,
                missing_factors,
                total_mentions,
                low_sample_size,
                price,
                change_24h,
                volume,
                market_cap,
                MODEL_VERSION,
                SCORING_VERSION,
                config_snapshot,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

/// Score history for one ticker over the lookback window, ascending by
/// snapshot time.
pub async fn recent_history(
    db: &AsyncDb,
    ticker: &str,
    lookback_days: u32,
) -> Result<Vec<HistoryEntry>> {
    let ticker = ticker.to_uppercase();
    let cutoff = (Utc::now() - chrono::Duration::days(i64::from(lookback_days))).to_rfc3339();

    db.call_named("history.recent", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, ticker, timestamp_utc, score_raw, score_rounded, scoring_mode,
                    ai_success, base_score, ai_score, completeness, missing_factors,
                    total_mentions, low_sample_size, price_at_snapshot, change_24h_pct,
                    model_version, scoring_version
             FROM regard_history
             WHERE ticker = ?1 AND timestamp_utc >= ?2
             ORDER BY timestamp_utc ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![ticker, cutoff], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, Option<f64>>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, bool>(12)?,
                    row.get::<_, Option<f64>>(13)?,
                    row.get::<_, Option<f64>>(14)?,
                    row.get::<_, Option<String>>(15)?,
                    row.get::<_, Option<String>>(16)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    })
    .await?
    .into_iter()
    .map(
        |(
            id,
            ticker,
            timestamp,
            score_raw,
            score_rounded,
            scoring_mode,
            ai_success,
            base_score,
            ai_score,
            completeness,
            missing_json,
            total_mentions,
            low_sample_size,
            price_at_snapshot,
            change_24h_pct,
            model_version,
            scoring_version,
        )| {
            let timestamp_utc = DateTime::parse_from_rfc3339(&timestamp)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| anyhow::anyhow!("bad timestamp in regard_history row {id}: {e}"))?;
            let missing_factors = match missing_json {
                Some(json) => serde_json::from_str(&json).unwrap_or_default(),
                None => Vec::new(),
            };
            Ok(HistoryEntry {
                id,
                ticker,
                timestamp_utc,
                score_raw,
                score_rounded,
                scoring_mode,
                ai_success,
                base_score,
                ai_score,
                completeness,
                missing_factors,
                total_mentions,
                low_sample_size,
                price_at_snapshot,
                change_24h_pct,
                model_version,
                scoring_version,
            })
        },
    )
    .collect()
}

/// Nearest recorded score for `ticker` around `at`, within a tolerance of
/// `tolerance_days` either side. Rows without a score (mode `error`) never
/// match. Returns `None` when nothing is close enough.
pub async fn score_near(
    db: &AsyncDb,
    ticker: &str,
    at: DateTime<Utc>,
    tolerance_days: u32,
) -> Result<Option<f64>> {
    let ticker = ticker.to_uppercase();
    let at = at.to_rfc3339();
    let tolerance = f64::from(tolerance_days);

    db.call_named("history.score_near", move |conn| {
        let found = conn
            .query_row(
                "SELECT score_raw FROM regard_history
                 WHERE ticker = ?1
                   AND score_raw IS NOT NULL
                   AND ABS(julianday(timestamp_utc) - julianday(?2)) <= ?3
                 ORDER BY ABS(julianday(timestamp_utc) - julianday(?2)) ASC
                 LIMIT 1",
                rusqlite::params![ticker, at, tolerance],
                |row| row.get::<_, f64>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(found)
    })
    .await
}

/// Forward-return horizons: column name and days after the snapshot.
const FORWARD_HORIZONS: [(&str, u32); 3] = [
    ("forward_return_24h", 1),
    ("forward_return_3d", 3),
    ("forward_return_7d", 7),
];

/// Fill in forward returns for snapshots whose horizon has passed.
///
/// Uses the current quote as the price at the horizon, so accuracy depends
/// on the job cadence; an hourly schedule keeps the 24h column honest. A
/// ticker whose quote lookup fails is retried on the next run.
pub async fn backfill_forward_returns<S>(db: &AsyncDb, market: &S) -> Result<usize>
where
    S: crate::fetchers::SignalFetcher,
{
    let due: Vec<String> = db
        .call_named("history.backfill_due", |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT ticker FROM regard_history
                 WHERE price_at_snapshot > 0
                   AND (
                     (forward_return_24h IS NULL AND julianday('now') - julianday(timestamp_utc) >= 1.0)
                     OR (forward_return_3d IS NULL AND julianday('now') - julianday(timestamp_utc) >= 3.0)
                     OR (forward_return_7d IS NULL AND julianday('now') - julianday(timestamp_utc) >= 7.0)
                   )
                 ORDER BY ticker",
            )?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

    let mut updated = 0_usize;
    for ticker in due {
        let quote = match market.fetch_quote(&ticker).await {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!(ticker, error = %e, "backfill quote lookup failed; will retry");
                continue;
            }
        };
        let Some(price) = quote.price else { continue };

        let ticker_for_update = ticker.clone();
        let rows = db
            .call_named("history.backfill_update", move |conn| {
                let mut n = 0_usize;
                for (col, days) in FORWARD_HORIZONS {
                    n += conn.execute(
                        &format!(
                            "UPDATE regard_history
                             SET {col} = 100.0 * (?1 - price_at_snapshot) / price_at_snapshot
                             WHERE ticker = ?2 AND {col} IS NULL AND price_at_snapshot > 0
                               AND julianday('now') - julianday(timestamp_utc) >= {days}.0"
                        ),
                        rusqlite::params![price, ticker_for_update],
                    )?;
                }
                Ok(n)
            })
            .await?;
        updated += rows;
    }
    if updated > 0 {
        metrics::counter!("regard_forward_returns_backfilled_total").increment(updated as u64);
    }
    Ok(updated)
}
