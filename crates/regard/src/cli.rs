use crate::report;
use crate::trade_scoring::UserRegardResult;
use anyhow::Result;
use common::db::Database;
use rusqlite::OptionalExtension;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Score { symbol: String },
    Analyze { user_id: String, path: String },
    History { ticker: String },
    Summary { user_id: String },
    Report { user_id: String },
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "score" => {
            let symbol = args
                .next()
                .ok_or_else(|| "usage: regard score <ticker>".to_string())?;
            Ok(Command::Score { symbol })
        }
        "analyze" => {
            let user_id = args
                .next()
                .ok_or_else(|| "usage: regard analyze <user> <csv-file>".to_string())?;
            let path = args
                .next()
                .ok_or_else(|| "usage: regard analyze <user> <csv-file>".to_string())?;
            Ok(Command::Analyze { user_id, path })
        }
        "history" => {
            let ticker = args
                .next()
                .ok_or_else(|| "usage: regard history <ticker>".to_string())?;
            Ok(Command::History { ticker })
        }
        "summary" => {
            let user_id = args
                .next()
                .ok_or_else(|| "usage: regard summary <user>".to_string())?;
            Ok(Command::Summary { user_id })
        }
        "report" => {
            let user_id = args
                .next()
                .ok_or_else(|| "usage: regard report <user>".to_string())?;
            Ok(Command::Report { user_id })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

/// Read-only commands against the local database. `Run`, `Score`, and
/// `Analyze` are handled in main since they need the async stack.
pub fn run_command(db: &Database, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run | Command::Score { .. } | Command::Analyze { .. } => Ok(()),
        Command::History { ticker } => show_history(db, &ticker),
        Command::Summary { user_id } => show_summary(db, &user_id),
        Command::Report { user_id } => show_report(db, &user_id),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub timestamp_utc: String,
    pub score_rounded: Option<i64>,
    pub scoring_mode: String,
    pub completeness: Option<String>,
}

pub fn query_history(db: &Database, ticker: &str) -> Result<Vec<HistoryRow>> {
    let mut stmt = db.conn.prepare(
        r#"
        SELECT timestamp_utc, score_rounded, scoring_mode, completeness
        FROM regard_history
        WHERE ticker = ?1
        ORDER BY timestamp_utc DESC
        LIMIT 50
        "#,
    )?;
    let rows = stmt.query_map(rusqlite::params![ticker.to_uppercase()], |row| {
        Ok(HistoryRow {
            timestamp_utc: row.get(0)?,
            score_rounded: row.get(1)?,
            scoring_mode: row.get(2)?,
            completeness: row.get(3)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

fn show_history(db: &Database, ticker: &str) -> Result<()> {
    println!("Score history for {}:", ticker.to_uppercase());
    for r in query_history(db, ticker)? {
        println!(
            "{}  score={:?}  mode={}  completeness={:?}",
            r.timestamp_utc, r.score_rounded, r.scoring_mode, r.completeness
        );
    }
    Ok(())
}

pub fn query_summary(db: &Database, user_id: &str) -> Result<Option<UserRegardResult>> {
    let summary = db
        .conn
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
        .optional()?;

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

    let (trade_count, avg_holding): (u32, Option<f64>) = db.conn.query_row(
        "SELECT COUNT(*), AVG(holding_period_secs) FROM user_trades WHERE user_id = ?1",
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
}

fn show_summary(db: &Database, user_id: &str) -> Result<()> {
    match query_summary(db, user_id)? {
        Some(r) => {
            println!("User: {user_id}");
            println!("  regard_score={:?}", r.regard_score);
            println!(
                "  wins={}  losses={}  win_rate={:?}  sample={}",
                r.wins, r.losses, r.win_rate, r.sample_size
            );
            println!(
                "  trades={}  open_positions={}  skipped_rows={}",
                r.trade_count, r.open_positions, r.skipped_rows
            );
        }
        None => println!("No analysis stored for {user_id}."),
    }
    Ok(())
}

fn show_report(db: &Database, user_id: &str) -> Result<()> {
    let Some(result) = query_summary(db, user_id)? else {
        println!("No analysis stored for {user_id}.");
        return Ok(());
    };
    // The trajectory section needs the async history reader; the offline
    // view prints the verdict and stats only.
    match report::render_report(user_id, &result, &[], chrono::Utc::now()) {
        Ok(markdown) => println!("{markdown}"),
        Err(e) => println!("Cannot build report: {e}"),
    }
    Ok(())
}
