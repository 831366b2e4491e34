use crate::history::HistoryEntry;
use crate::trade_scoring::UserRegardResult;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Below this many decided trades the report carries a low-confidence note.
const LOW_CONFIDENCE_SAMPLE: u32 = 20;

/// Trajectory table rows shown in the report, most recent first.
const TRAJECTORY_ROWS: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("not enough decided trades to build a report")]
    InsufficientData,
}

fn verdict(score: u8) -> &'static str {
    match score {
        0..=19 => "Disciplined. Your broker is bored of you.",
        20..=39 => "Mostly sensible, with the occasional dart throw.",
        40..=59 => "One foot in the index fund, one foot in the casino.",
        60..=79 => "The group chat is a core input to your process.",
        _ => "Full casino. Please hydrate between positions.",
    }
}

/// Render a markdown report for a finished upload analysis. Deterministic
/// for a given result, history slice, and timestamp, so re-rendering never
/// churns stored artifacts. `history` holds score snapshots for the tickers
/// the user traded, ascending by time; pass an empty slice to omit the
/// trajectory section.
pub fn render_report(
    user_id: &str,
    result: &UserRegardResult,
    history: &[HistoryEntry],
    generated_at: DateTime<Utc>,
) -> Result<String, ReportError> {
    let score = match (result.regard_score, result.sample_size) {
        (Some(score), n) if n > 0 => score,
        _ => return Err(ReportError::InsufficientData),
    };

    let mut out = String::new();
    let _ = writeln!(out, "# Regard Score Report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **User:** {user_id}");
    let _ = writeln!(
        out,
        "- **Generated:** {}",
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Score: {score} / 100");
    let _ = writeln!(out);
    let _ = writeln!(out, "> {}", verdict(score));
    let _ = writeln!(out);

    if result.sample_size < LOW_CONFIDENCE_SAMPLE {
        let _ = writeln!(
            out,
            "_Low confidence: only {} decided trades. The score is pulled toward neutral until more history is uploaded._",
            result.sample_size
        );
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "## Breakdown");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Metric | Value |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Matched trades | {} |", result.trade_count);
    let _ = writeln!(out, "| Wins / losses | {} / {} |", result.wins, result.losses);
    if let Some(rate) = result.win_rate {
        let _ = writeln!(out, "| Win rate | {:.1}% |", rate * 100.0);
    }
    if let Some(avg) = result.avg_entry_score {
        let _ = writeln!(out, "| Avg ticker score at entry | {avg:.1} |");
    }
    if let Some(secs) = result.avg_holding_period_secs {
        let _ = writeln!(out, "| Avg holding period | {:.1} days |", secs as f64 / 86_400.0);
    }
    let _ = writeln!(out, "| Open positions | {} |", result.open_positions);
    if result.skipped_rows > 0 {
        let _ = writeln!(out, "| Skipped rows | {} |", result.skipped_rows);
    }

    if !history.is_empty() {
        let (mut ai, mut fallback, mut error) = (0_usize, 0_usize, 0_usize);
        for entry in history {
            match entry.scoring_mode.as_str() {
                "ai" => ai += 1,
                "fallback" => fallback += 1,
                _ => error += 1,
            }
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "## Ticker score history");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} snapshots across your tickers ({ai} ai, {fallback} fallback, {error} error).",
            history.len()
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "| When | Ticker | Score | Mode |");
        let _ = writeln!(out, "|---|---|---|---|");
        for entry in history.iter().rev().take(TRAJECTORY_ROWS) {
            let score = entry
                .score_rounded
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} |",
                entry.timestamp_utc.format("%Y-%m-%d %H:%M"),
                entry.ticker,
                score,
                entry.scoring_mode
            );
        }
    }

    Ok(out)
}
