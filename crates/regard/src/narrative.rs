use crate::score_engine::{self, ScoreBreakdown, ScoreWeights};
use anyhow::{Context, Result};
use common::types::{DataCompleteness, MissingFactor, ScoringMode, TickerSignal};
use serde::Deserialize;
use std::time::Duration;

/// AI-heavy blend: the narrative overlay dominates when both are available.
#[derive(Debug, Clone, Copy)]
pub struct BlendWeights {
    pub ai: f64,
    pub base: f64,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self { ai: 0.65, base: 0.35 }
    }
}

/// Narrative assessment of a ticker's degen profile, 0-100.
///
/// Implementations must treat every failure as recoverable: callers degrade
/// to the deterministic engine output, they never retry synchronously.
pub trait NarrativeProvider {
    fn assess(
        &self,
        signal: &TickerSignal,
        base_score: Option<f64>,
        completeness: DataCompleteness,
        missing_factors: &[MissingFactor],
    ) -> impl std::future::Future<Output = Result<u8>> + Send;
}

/// One scored ticker with full provenance: which path produced the number
/// and how trustworthy the inputs were.
#[derive(Debug, Clone)]
pub struct ScoredTicker {
    pub symbol: String,
    pub score_raw: Option<f64>,
    pub score_rounded: Option<u8>,
    pub base_score: Option<f64>,
    pub ai_score: Option<u8>,
    pub breakdown: Option<ScoreBreakdown>,
    pub completeness: DataCompleteness,
    pub missing_factors: Vec<MissingFactor>,
    pub mode: ScoringMode,
    pub ai_success: bool,
}

/// Score a ticker, choosing the scoring mode.
///
/// The engine runs first; its failure alone is what produces mode `error`.
/// The AI call is a single attempt bounded by `ai_timeout` — timeout,
/// transport error, and out-of-range payloads all degrade to `fallback`
/// without propagating.
pub async fn score_with_mode<N: NarrativeProvider>(
    signal: &TickerSignal,
    weights: &ScoreWeights,
    unknown_threshold: usize,
    narrative: &N,
    allow_ai: bool,
    ai_timeout: Duration,
    blend: &BlendWeights,
) -> ScoredTicker {
    let (base_score, breakdown, completeness, missing_factors) =
        match score_engine::compute_score(signal, weights, unknown_threshold) {
            Ok(out) => (
                Some(out.breakdown.composite),
                Some(out.breakdown),
                out.completeness,
                out.missing_factors,
            ),
            Err(e) => {
                tracing::warn!(symbol = %signal.symbol, error = %e, "base score unavailable");
                let score_engine::ScoringError::InsufficientData(missing) = e;
                (None, None, DataCompleteness::Unknown, missing)
            }
        };

    let ai_score = if allow_ai {
        match tokio::time::timeout(
            ai_timeout,
            narrative.assess(signal, base_score, completeness, &missing_factors),
        )
        .await
        {
            Ok(Ok(score)) => Some(score.min(100)),
            Ok(Err(e)) => {
                tracing::warn!(symbol = %signal.symbol, error = %e, "narrative assessment failed; falling back");
                metrics::counter!("regard_ai_failures_total", "kind" => "error").increment(1);
                None
            }
            Err(_) => {
                tracing::warn!(symbol = %signal.symbol, timeout = ?ai_timeout, "narrative assessment timed out; falling back");
                metrics::counter!("regard_ai_failures_total", "kind" => "timeout").increment(1);
                None
            }
        }
    } else {
        None
    };

    let score_raw = match (base_score, ai_score) {
        (Some(b), Some(a)) => Some(blend.base * b + blend.ai * f64::from(a)),
        (None, Some(a)) => Some(f64::from(a)),
        (Some(b), None) => Some(b),
        (None, None) => None,
    };
    let score_rounded = score_raw.map(|s| s.round().clamp(0.0, 100.0) as u8);

    let (mode, ai_success) = if ai_score.is_some() {
        (ScoringMode::Ai, true)
    } else if base_score.is_some() {
        (ScoringMode::Fallback, false)
    } else {
        (ScoringMode::Error, false)
    };
    metrics::counter!("regard_scores_total", "mode" => mode.as_str()).increment(1);

    ScoredTicker {
        symbol: signal.symbol.clone(),
        score_raw,
        score_rounded,
        base_score,
        ai_score,
        breakdown,
        completeness,
        missing_factors,
        mode,
        ai_success,
    }
}

/// Chat-completions client for the narrative provider.
pub struct OpenAiNarrative {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct AssessmentPayload {
    #[serde(rename = "regardScore")]
    regard_score: f64,
}

impl OpenAiNarrative {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
        })
    }

    fn build_user_message(
        signal: &TickerSignal,
        base_score: Option<f64>,
        completeness: DataCompleteness,
        missing_factors: &[MissingFactor],
    ) -> String {
        let context = serde_json::json!({
            "symbol": signal.symbol,
            "price": signal.price,
            "change_24h_pct": signal.change_24h_pct,
            "volume": signal.volume,
            "market_cap": signal.market_cap,
            "beta": signal.beta,
            "profit_margins": signal.profit_margins,
            "short_ratio": signal.short_ratio,
            "mentions_24h": signal.mentions_24h,
            "mentions_7d": signal.mentions_7d,
            "base_score": base_score,
            "data_completeness": completeness.as_str(),
            "missing_factors": missing_factors.iter().map(|f| f.as_str()).collect::<Vec<_>>(),
        });
        format!(
            "Rate this ticker's REGARD SCORE from 0 to 100 (100 = full casino, 0 = boring and safe).\n\
             Ticker context:\n{context}\n\n\
             Respond with a single JSON object: {{\"regardScore\": <number between 0 and 100>}}. JSON only."
        )
    }
}

impl NarrativeProvider for OpenAiNarrative {
    async fn assess(
        &self,
        signal: &TickerSignal,
        base_score: Option<f64>,
        completeness: DataCompleteness,
        missing_factors: &[MissingFactor],
    ) -> Result<u8> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You rate how speculative a stock is on a 0-100 scale. Higher always means more degenerate.",
                },
                {
                    "role": "user",
                    "content": Self::build_user_message(signal, base_score, completeness, missing_factors),
                },
            ],
            "temperature": 0.7,
            "max_tokens": 100,
            "response_format": {"type": "json_object"},
        });

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp: ChatResponse = req
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("narrative response was not valid JSON")?;

        let content = resp
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .context("narrative response had no content")?;
        let payload: AssessmentPayload =
            serde_json::from_str(content).context("narrative payload was not the expected JSON")?;

        if !(0.0..=100.0).contains(&payload.regard_score) {
            anyhow::bail!("narrative score out of range: {}", payload.regard_score);
        }
        Ok(payload.regard_score.round() as u8)
    }
}

/// Deterministic stand-in for offline runs and tests: echoes the base score
/// nudged toward the configured bias.
pub struct StubNarrative {
    pub fixed: u8,
    pub fail: bool,
    pub delay: Duration,
}

impl Default for StubNarrative {
    fn default() -> Self {
        Self {
            fixed: 50,
            fail: false,
            delay: Duration::ZERO,
        }
    }
}

impl NarrativeProvider for StubNarrative {
    async fn assess(
        &self,
        _signal: &TickerSignal,
        _base_score: Option<f64>,
        _completeness: DataCompleteness,
        _missing_factors: &[MissingFactor],
    ) -> Result<u8> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("narrative service unavailable (HTTP 500)");
        }
        Ok(self.fixed)
    }
}
