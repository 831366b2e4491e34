use crate::trade_ingest::{OpenPosition, Trade};

/// Sample size at which the score stops being shrunk toward the neutral 50.
const FULL_CONFIDENCE_SAMPLE: f64 = 50.0;

/// Average holding period (days) at or beyond which churn contributes zero.
const CHURN_HORIZON_DAYS: f64 = 30.0;

const OUTCOME_WEIGHT: f64 = 0.40;
const EXPOSURE_WEIGHT: f64 = 0.30;
const CHURN_WEIGHT: f64 = 0.20;
const BAGHOLDING_WEIGHT: f64 = 0.10;

/// A matched trade plus the ticker's Regard Score at entry time, when one
/// could be found or computed.
#[derive(Debug, Clone)]
pub struct ScoredTrade {
    pub trade: Trade,
    pub entry_score: Option<f64>,
}

/// Aggregated verdict over one user's uploaded history.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRegardResult {
    pub regard_score: Option<u8>,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: Option<f64>,
    pub sample_size: u32,
    pub trade_count: u32,
    pub open_positions: u32,
    pub skipped_rows: u32,
    pub avg_entry_score: Option<f64>,
    pub avg_holding_period_secs: Option<i64>,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Fold matched trades and leftovers into a single 0-100 user score.
///
/// Wins are trades with strictly positive realized PnL, losses strictly
/// negative; breakeven trades are excluded from the decided sample. With an
/// empty sample no score is produced at all. Small samples are shrunk
/// toward the neutral 50 so three lucky trades cannot read as a verdict.
pub fn aggregate(
    trades: &[ScoredTrade],
    open_positions: &[OpenPosition],
    skipped_rows: usize,
) -> UserRegardResult {
    let wins = trades
        .iter()
        .filter(|t| t.trade.realized_pnl > 0.0)
        .count() as u32;
    let losses = trades
        .iter()
        .filter(|t| t.trade.realized_pnl < 0.0)
        .count() as u32;
    let sample_size = wins + losses;
    let win_rate = if sample_size > 0 {
        Some(f64::from(wins) / f64::from(sample_size))
    } else {
        None
    };

    let entry_scores: Vec<f64> = trades.iter().filter_map(|t| t.entry_score).collect();
    let avg_entry_score = if entry_scores.is_empty() {
        None
    } else {
        Some(entry_scores.iter().sum::<f64>() / entry_scores.len() as f64)
    };

    let avg_holding_period_secs = if trades.is_empty() {
        None
    } else {
        Some(
            trades
                .iter()
                .map(|t| t.trade.holding_period_secs)
                .sum::<i64>()
                / trades.len() as i64,
        )
    };

    let regard_score = win_rate.map(|rate| {
        // Each component maps to [0, 1] where 1 is maximally degenerate.
        // Missing components drop out and the weights renormalize.
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        weighted += OUTCOME_WEIGHT * (1.0 - rate);
        total_weight += OUTCOME_WEIGHT;

        if let Some(avg) = avg_entry_score {
            weighted += EXPOSURE_WEIGHT * clamp01(avg / 100.0);
            total_weight += EXPOSURE_WEIGHT;
        }

        if let Some(secs) = avg_holding_period_secs {
            let days = secs as f64 / 86_400.0;
            weighted += CHURN_WEIGHT * clamp01(1.0 - days / CHURN_HORIZON_DAYS);
            total_weight += CHURN_WEIGHT;
        }

        let total_lines = trades.len() + open_positions.len();
        if total_lines > 0 {
            let bag_share = open_positions.len() as f64 / total_lines as f64;
            weighted += BAGHOLDING_WEIGHT * bag_share;
            total_weight += BAGHOLDING_WEIGHT;
        }

        let raw = 100.0 * weighted / total_weight;
        let shrink = (f64::from(sample_size) / FULL_CONFIDENCE_SAMPLE).min(1.0);
        let shrunk = 50.0 + (raw - 50.0) * shrink;
        shrunk.round().clamp(0.0, 100.0) as u8
    });

    UserRegardResult {
        regard_score,
        wins,
        losses,
        win_rate,
        sample_size,
        trade_count: trades.len() as u32,
        open_positions: open_positions.len() as u32,
        skipped_rows: skipped_rows as u32,
        avg_entry_score,
        avg_holding_period_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use common::types::TradeSide;

    fn trade(pnl: f64, hold_days: i64) -> Trade {
        let entry = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let exit = entry + Duration::days(hold_days);
        Trade {
            ticker: "GME".to_string(),
            side: TradeSide::Long,
            quantity: 10.0,
            entry_time: entry,
            exit_time: exit,
            entry_price: 10.0,
            exit_price: 10.0 + pnl / 10.0,
            realized_pnl: pnl,
            holding_period_secs: (exit - entry).num_seconds(),
            entry_fees: 0.0,
            exit_fees: 0.0,
        }
    }

    fn scored(pnl: f64, hold_days: i64, entry_score: Option<f64>) -> ScoredTrade {
        ScoredTrade {
            trade: trade(pnl, hold_days),
            entry_score,
        }
    }

    #[test]
    fn test_no_decided_trades_means_no_score() {
        let result = aggregate(&[], &[], 0);
        assert_eq!(result.regard_score, None);
        assert_eq!(result.win_rate, None);
        assert_eq!(result.sample_size, 0);

        // All breakeven counts the same as empty.
        let result = aggregate(&[scored(0.0, 1, None), scored(0.0, 2, None)], &[], 0);
        assert_eq!(result.regard_score, None);
        assert_eq!(result.sample_size, 0);
        assert_eq!(result.trade_count, 2);
    }

    #[test]
    fn test_breakeven_excluded_from_win_rate() {
        let trades = vec![
            scored(100.0, 5, None),
            scored(0.0, 5, None),
            scored(-50.0, 5, None),
        ];
        let result = aggregate(&trades, &[], 0);
        assert_eq!(result.wins, 1);
        assert_eq!(result.losses, 1);
        assert_eq!(result.sample_size, 2);
        assert_eq!(result.win_rate, Some(0.5));
    }

    #[test]
    fn test_losers_score_higher_than_winners() {
        let winners: Vec<ScoredTrade> = (0..60).map(|_| scored(100.0, 20, Some(30.0))).collect();
        let losers: Vec<ScoredTrade> = (0..60).map(|_| scored(-100.0, 20, Some(30.0))).collect();

        let winner_score = aggregate(&winners, &[], 0).regard_score.unwrap();
        let loser_score = aggregate(&losers, &[], 0).regard_score.unwrap();
        assert!(
            loser_score > winner_score,
            "losers {loser_score} should outscore winners {winner_score}"
        );
    }

    #[test]
    fn test_small_sample_shrinks_toward_neutral() {
        let few: Vec<ScoredTrade> = (0..5).map(|_| scored(-100.0, 1, Some(90.0))).collect();
        let many: Vec<ScoredTrade> = (0..100).map(|_| scored(-100.0, 1, Some(90.0))).collect();

        let few_score = f64::from(aggregate(&few, &[], 0).regard_score.unwrap());
        let many_score = f64::from(aggregate(&many, &[], 0).regard_score.unwrap());
        // Same dismal stats, but 5 trades should sit much closer to 50.
        assert!((few_score - 50.0).abs() < (many_score - 50.0).abs());
        assert!(many_score > 80.0);
    }

    #[test]
    fn test_high_entry_scores_raise_the_verdict() {
        let safe: Vec<ScoredTrade> = (0..60).map(|_| scored(10.0, 20, Some(10.0))).collect();
        let degen: Vec<ScoredTrade> = (0..60).map(|_| scored(10.0, 20, Some(95.0))).collect();

        let safe_score = aggregate(&safe, &[], 0).regard_score.unwrap();
        let degen_score = aggregate(&degen, &[], 0).regard_score.unwrap();
        assert!(degen_score > safe_score);
    }

    #[test]
    fn test_churn_raises_the_verdict() {
        let patient: Vec<ScoredTrade> = (0..60).map(|_| scored(10.0, 45, None)).collect();
        let day_trader: Vec<ScoredTrade> = (0..60).map(|_| scored(10.0, 0, None)).collect();

        let patient_score = aggregate(&patient, &[], 0).regard_score.unwrap();
        let churn_score = aggregate(&day_trader, &[], 0).regard_score.unwrap();
        assert!(churn_score > patient_score);
    }

    #[test]
    fn test_open_positions_and_skips_are_reported() {
        let open = vec![OpenPosition {
            ticker: "AMC".to_string(),
            side: TradeSide::Long,
            quantity: 50.0,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
            entry_price: 4.5,
        }];
        let result = aggregate(&[scored(10.0, 2, Some(40.0))], &open, 3);
        assert_eq!(result.open_positions, 1);
        assert_eq!(result.skipped_rows, 3);
        assert_eq!(result.avg_entry_score, Some(40.0));
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let trades = vec![
            scored(50.0, 2, Some(70.0)),
            scored(-30.0, 1, Some(85.0)),
            scored(20.0, 10, None),
        ];
        let a = aggregate(&trades, &[], 1);
        let b = aggregate(&trades, &[], 1);
        assert_eq!(a, b);
    }
}
