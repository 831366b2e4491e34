use anyhow::Result;
use common::config::Config;
use common::market_api::MarketClient;
use std::sync::Arc;
use std::time::Duration;

mod cli;
mod fetchers;
mod history;
mod maintenance;
mod metrics;
mod narrative;
mod pipeline;
mod progress;
mod report;
mod scheduler;
mod score_engine;
mod service;
mod trade_ingest;
mod trade_scoring;

use narrative::{BlendWeights, OpenAiNarrative};
use pipeline::{PipelineDeps, PipelineSettings};
use progress::UploadStatus;
use score_engine::ScoreWeights;
use service::RegardService;

fn build_settings(config: &Config) -> PipelineSettings {
    PipelineSettings {
        weights: ScoreWeights {
            hype: config.scoring.weights_hype,
            volatility: config.scoring.weights_volatility,
            liquidity: config.scoring.weights_liquidity,
            risk: config.scoring.weights_risk,
        },
        unknown_threshold: config.scoring.unknown_missing_threshold,
        ai_enabled: config.ai.enabled,
        ai_timeout: Duration::from_secs(config.ai.timeout_secs),
        blend: BlendWeights {
            ai: config.ai.ai_weight,
            base: config.ai.base_weight,
        },
        history_tolerance_days: config.scoring.history_tolerance_days,
        max_file_bytes: config.upload.max_file_bytes,
        max_run_secs: config.upload.max_run_secs,
    }
}

fn build_service(
    config: &Config,
    db: common::db::AsyncDb,
) -> Result<RegardService<MarketClient, MarketClient, OpenAiNarrative>> {
    let provider_timeout = Duration::from_secs(config.providers.request_timeout_secs);
    let deps = PipelineDeps {
        market: MarketClient::new(
            &config.providers.market_api_url,
            &config.providers.mentions_api_url,
            provider_timeout,
        )?,
        mentions: MarketClient::new(
            &config.providers.market_api_url,
            &config.providers.mentions_api_url,
            provider_timeout,
        )?,
        narrative: OpenAiNarrative::new(
            &config.ai.base_url,
            &config.ai.model,
            Duration::from_secs(config.ai.timeout_secs),
        )?,
    };
    Ok(RegardService::new(
        db,
        deps,
        build_settings(config),
        config.scoring.history_lookback_days,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("regard", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    tracing::info!("regard score service starting");

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    match cmd {
        cli::Command::Run => run_daemon(config).await,
        cli::Command::Score { symbol } => score_once(&config, &symbol).await,
        cli::Command::Analyze { user_id, path } => analyze_once(&config, &user_id, &path).await,
        // Read-only commands use sync Database — they exit immediately.
        other => {
            let db = common::db::Database::open(&config.database.path)?;
            db.run_migrations()?;
            cli::run_command(&db, other)
        }
    }
}

/// Score one ticker and print the verdict.
async fn score_once(config: &Config, symbol: &str) -> Result<()> {
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let svc = build_service(config, db)?;
    let scored = svc.compute_score(symbol).await?;

    println!("{}", scored.symbol);
    match scored.score_rounded {
        Some(score) => println!("  regard_score={score}  mode={}", scored.mode.as_str()),
        None => println!("  no score (mode={})", scored.mode.as_str()),
    }
    println!("  completeness={}", scored.completeness.as_str());
    if !scored.missing_factors.is_empty() {
        let missing: Vec<&str> = scored.missing_factors.iter().map(|f| f.as_str()).collect();
        println!("  missing_factors={missing:?}");
    }
    if let (Some(base), Some(ai)) = (scored.base_score, scored.ai_score) {
        println!("  base={base:.1}  ai={ai}");
    }
    Ok(())
}

/// Run a trade-history upload from the command line and print the report.
async fn analyze_once(config: &Config, user_id: &str, path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let svc = build_service(config, db)?;
    svc.start_upload(user_id, content)
        .map_err(anyhow::Error::new)?;

    let mut last_stage = "";
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Some(progress) = svc.get_progress(user_id) else {
            anyhow::bail!("upload progress vanished for {user_id}");
        };
        if progress.stage != last_stage {
            last_stage = progress.stage;
            println!("[{:>3}%] {}", progress.percentage, progress.message);
        }
        match progress.status {
            UploadStatus::InProgress => {}
            UploadStatus::Failed => {
                anyhow::bail!(
                    "analysis failed: {}",
                    progress.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            UploadStatus::Complete => break,
        }
    }

    let report = svc.generate_report(user_id, chrono::Utc::now()).await?;
    println!("\n{report}");
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let svc = Arc::new(build_service(&config, db.clone())?);
    let tracker = svc.tracker();
    let market = Arc::new(MarketClient::new(
        &config.providers.market_api_url,
        &config.providers.mentions_api_url,
        Duration::from_secs(config.providers.request_timeout_secs),
    )?);

    let (wal_checkpoint_tx, mut wal_checkpoint_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (progress_purge_tx, mut progress_purge_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (forward_returns_tx, mut forward_returns_rx) = tokio::sync::mpsc::channel::<()>(8);

    let scheduler_jobs = vec![
        scheduler::JobSpec {
            name: "wal_checkpoint".to_string(),
            interval: Duration::from_secs(300),
            tick: wal_checkpoint_tx,
            run_immediately: false, // no need to checkpoint at startup
        },
        scheduler::JobSpec {
            name: "progress_purge".to_string(),
            interval: Duration::from_secs(config.upload.progress_purge_interval_secs),
            tick: progress_purge_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "forward_returns".to_string(),
            interval: Duration::from_secs(3600),
            tick: forward_returns_tx,
            run_immediately: true,
        },
    ];

    // Spawn worker loops before the scheduler so immediate ticks land.
    tokio::spawn({
        let db = db.clone();
        async move {
            while wal_checkpoint_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wal_checkpoint");
                let _g = span.enter();
                match maintenance::run_wal_checkpoint_once(&db).await {
                    Ok((log, checkpointed)) => {
                        tracing::info!(log, checkpointed, "wal_checkpoint done");
                    }
                    Err(e) => tracing::error!(error = %e, "wal_checkpoint failed"),
                }
            }
        }
    });

    tokio::spawn({
        let tracker = tracker.clone();
        let ttl = Duration::from_secs(config.upload.progress_ttl_secs);
        async move {
            while progress_purge_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "progress_purge");
                let _g = span.enter();
                maintenance::run_progress_purge_once(&tracker, ttl);
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let market = market.clone();
        async move {
            while forward_returns_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "forward_returns");
                let _g = span.enter();
                match history::backfill_forward_returns(&db, market.as_ref()).await {
                    Ok(updated) => tracing::info!(updated, "forward_returns done"),
                    Err(e) => tracing::error!(error = %e, "forward_returns failed"),
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(scheduler_jobs);
    tracing::info!("maintenance scheduler started; service ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    // Give spawned tasks a moment to finish, then force exit.
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
