use anyhow::Result;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub scoring: Scoring,
    pub ai: Ai,
    pub providers: Providers,
    pub upload: Upload,
    pub observability: Observability,
}

#[derive(Debug, Deserialize)]
pub struct General {
    pub service_name: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Scoring {
    pub weights_hype: f64,
    pub weights_volatility: f64,
    pub weights_liquidity: f64,
    pub weights_risk: f64,
    pub unknown_missing_threshold: usize,
    pub history_lookback_days: u32,
    pub history_tolerance_days: u32,
}

#[derive(Debug, Deserialize)]
pub struct Ai {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub ai_weight: f64,
    pub base_weight: f64,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
    pub market_api_url: String,
    pub mentions_api_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Upload {
    pub max_file_bytes: usize,
    pub max_run_secs: u64,
    pub progress_ttl_secs: u64,
    pub progress_purge_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string("config/default.toml")?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
