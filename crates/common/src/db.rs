use anyhow::Result;
use rusqlite::Connection;

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and run migrations — all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Startup migrations require a write lock. On production systems we can race with
        // concurrent readers/writers (upload pipelines, admin sqlite3 sessions, deploy checks).
        // If we hard-fail on `database is locked`, systemd will crash-loop. Instead we retry
        // migrations with backoff until the lock clears.
        //
        // IMPORTANT: Use a short SQLite busy_timeout per attempt so we can handle backoff in Rust.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    migrate_regard_history_forward_return_columns(conn)?;
                    migrate_user_regard_summaries_position_columns(conn)?;
                    // For normal runtime operations we still want a longer busy_timeout.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    ///
    /// The closure receives `&mut rusqlite::Connection` and can perform
    /// arbitrary sync SQLite operations. The result is sent back via oneshot
    /// channel.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// This measures the full wall-clock time of the operation, including queueing
    /// on the dedicated SQLite thread and execution of all SQL in the closure.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "regard_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "regard_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("regard_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // busy_timeout via the rusqlite API — makes SQLite retry for up to 30s
        // when the database is locked by another connection.
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        migrate_regard_history_forward_return_columns(&self.conn).map_err(anyhow::Error::from)?;
        migrate_user_regard_summaries_position_columns(&self.conn).map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// Add forward-return columns to regard_history if missing (for existing DBs
/// created before forward-return backfill was introduced).
fn migrate_regard_history_forward_return_columns(
    conn: &Connection,
) -> std::result::Result<(), rusqlite::Error> {
    for name in ["forward_return_24h", "forward_return_3d", "forward_return_7d"] {
        let has: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('regard_history') WHERE name=?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        if has == 0 {
            conn.execute(
                &format!("ALTER TABLE regard_history ADD COLUMN {name} REAL"),
                [],
            )?;
        }
    }
    Ok(())
}

/// Add open-position columns to user_regard_summaries if missing.
fn migrate_user_regard_summaries_position_columns(
    conn: &Connection,
) -> std::result::Result<(), rusqlite::Error> {
    let required: [(&str, &str); 3] = [
        ("skipped_rows", "INTEGER NOT NULL DEFAULT 0"),
        ("open_positions", "INTEGER NOT NULL DEFAULT 0"),
        ("avg_entry_score", "REAL"),
    ];
    for (name, ty) in required {
        let has: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('user_regard_summaries') WHERE name=?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        if has == 0 {
            conn.execute(
                &format!("ALTER TABLE user_regard_summaries ADD COLUMN {name} {ty}"),
                [],
            )?;
        }
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS regard_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    timestamp_utc TEXT NOT NULL,
    score_raw REAL,
    score_rounded INTEGER,
    scoring_mode TEXT NOT NULL,        -- ai, fallback, error
    ai_success INTEGER NOT NULL DEFAULT 0,
    base_score REAL,
    ai_score INTEGER,
    completeness TEXT,                 -- full, partial, unknown
    missing_factors TEXT,              -- JSON array of factor names
    total_mentions INTEGER NOT NULL DEFAULT 0,
    low_sample_size INTEGER NOT NULL DEFAULT 0,
    price_at_snapshot REAL,
    change_24h_pct REAL,
    volume_24h REAL,
    market_cap REAL,
    model_version TEXT,
    scoring_version TEXT,
    config_snapshot TEXT,              -- JSON of the weights used
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    side TEXT NOT NULL,                -- LONG or SHORT
    quantity REAL NOT NULL,
    entry_time TEXT NOT NULL,
    exit_time TEXT NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    holding_period_secs INTEGER NOT NULL,
    entry_fees REAL NOT NULL DEFAULT 0.0,
    exit_fees REAL NOT NULL DEFAULT 0.0,
    regard_score_at_entry REAL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_regard_summaries (
    user_id TEXT PRIMARY KEY,
    regard_score INTEGER,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    win_rate REAL,
    sample_size INTEGER NOT NULL DEFAULT 0,
    skipped_rows INTEGER NOT NULL DEFAULT 0,
    open_positions INTEGER NOT NULL DEFAULT 0,
    avg_entry_score REAL,
    last_updated TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_regard_history_ticker_ts ON regard_history(ticker, timestamp_utc);
CREATE INDEX IF NOT EXISTS idx_regard_history_created_at ON regard_history(created_at);
CREATE INDEX IF NOT EXISTS idx_user_trades_user ON user_trades(user_id);
CREATE INDEX IF NOT EXISTS idx_user_trades_user_entry_time ON user_trades(user_id, entry_time);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_all_tables() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        assert!(tables.contains(&"regard_history".to_string()));
        assert!(tables.contains(&"user_trades".to_string()));
        assert!(tables.contains(&"user_regard_summaries".to_string()));
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap(); // second call must not fail
    }

    #[test]
    fn test_migrations_create_expected_indexes() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let indexes: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        // Required for history lookups and per-user trade reads to stay fast.
        let expected = [
            "idx_regard_history_ticker_ts",
            "idx_regard_history_created_at",
            "idx_user_trades_user",
            "idx_user_trades_user_entry_time",
        ];

        for name in expected {
            assert!(
                indexes.contains(&name.to_string()),
                "missing index {name}; existing indexes: {indexes:?}"
            );
        }
    }

    #[test]
    fn test_regard_history_has_forward_return_columns() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let cols: Vec<String> = db
            .conn
            .prepare("SELECT name FROM pragma_table_info('regard_history') ORDER BY cid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        for col in ["forward_return_24h", "forward_return_3d", "forward_return_7d"] {
            assert!(
                cols.contains(&col.to_string()),
                "missing column {col}; got {cols:?}"
            );
        }
    }

    #[test]
    fn test_summaries_have_position_columns() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let cols: Vec<String> = db
            .conn
            .prepare("SELECT name FROM pragma_table_info('user_regard_summaries') ORDER BY cid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        for col in ["skipped_rows", "open_positions", "avg_entry_score"] {
            assert!(
                cols.contains(&col.to_string()),
                "missing column {col}; got {cols:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_async_db_open_runs_migrations() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"regard_history".to_string()));
        assert!(tables.contains(&"user_trades".to_string()));
        assert!(tables.contains(&"user_regard_summaries".to_string()));
    }

    #[tokio::test]
    async fn test_async_db_is_clone_and_send() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let db2 = db.clone();

        // Write from one clone
        db.call(|conn| {
            conn.execute(
                "INSERT INTO regard_history (ticker, timestamp_utc, scoring_mode)
                 VALUES ('GME', '2026-08-01T00:00:00+00:00', 'fallback')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        // Read from the other clone — same underlying connection
        let ticker: String = db2
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT ticker FROM regard_history WHERE scoring_mode = 'fallback'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();

        assert_eq!(ticker, "GME");
    }

    #[tokio::test]
    async fn test_async_db_call_returns_error_on_bad_sql() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_summary_upsert_by_user_id() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        db.conn
            .execute(
                "INSERT INTO user_regard_summaries (user_id, regard_score, wins, losses, win_rate, sample_size)
                 VALUES ('u1', 62, 3, 7, 0.3, 10)
                 ON CONFLICT(user_id) DO UPDATE SET regard_score = excluded.regard_score",
                [],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO user_regard_summaries (user_id, regard_score, wins, losses, win_rate, sample_size)
                 VALUES ('u1', 48, 5, 5, 0.5, 10)
                 ON CONFLICT(user_id) DO UPDATE SET regard_score = excluded.regard_score",
                [],
            )
            .unwrap();

        let (count, score): (i64, i64) = db
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(regard_score) FROM user_regard_summaries WHERE user_id = 'u1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(score, 48);
    }
}
