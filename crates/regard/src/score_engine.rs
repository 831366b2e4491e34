use common::types::{DataCompleteness, MissingFactor, TickerSignal};
use thiserror::Error;

/// Bump whenever weights or formulas change so history rows stay interpretable.
pub const SCORING_VERSION: &str = "v1.0";
pub const MODEL_VERSION: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("insufficient data: missing required fields {0:?}")]
    InsufficientData(Vec<MissingFactor>),
}

/// Weights for the composite regard score. Higher composite = more degen.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    /// Social mention volume and 24h price move.
    pub hype: f64,
    /// Beta and move magnitude.
    pub volatility: f64,
    /// Thin volume / small float (illiquidity is the degen signal).
    pub liquidity: f64,
    /// Microcap size, unprofitability, short interest.
    pub risk: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            hype: 0.35,
            volatility: 0.25,
            liquidity: 0.20,
            risk: 0.20,
        }
    }
}

/// Sub-scores are degen intensities in [0, 1]; `None` when every input that
/// feeds the sub-score was absent. Composite is 0-100, clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub hype: Option<f64>,
    pub volatility: Option<f64>,
    pub liquidity: Option<f64>,
    pub risk: Option<f64>,
    pub composite: f64,
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub breakdown: ScoreBreakdown,
    pub completeness: DataCompleteness,
    pub missing_factors: Vec<MissingFactor>,
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Mention volume on a log scale: ~10k mentions in 24h saturates at 1.0.
fn mention_score(mentions_24h: Option<u64>, mentions_7d: Option<u64>) -> Option<f64> {
    // Prefer the 24h window; fall back to a daily average of the 7d window.
    let daily = match (mentions_24h, mentions_7d) {
        (Some(m), _) => m as f64,
        (None, Some(w)) => w as f64 / 7.0,
        (None, None) => return None,
    };
    Some(clamp01((daily + 1.0).log10() / 4.0))
}

/// |24h move| scaled so a 20% day saturates at 1.0.
fn move_score(change_24h_pct: Option<f64>) -> Option<f64> {
    change_24h_pct.map(|c| clamp01(c.abs() / 20.0))
}

/// Beta mapped linearly: 0.8 and below is calm, 2.5+ is full casino.
fn beta_score(beta: Option<f64>) -> Option<f64> {
    beta.map(|b| clamp01((b - 0.8) / 1.7))
}

/// Thin daily volume. Tiers match the liquidity bands the history audit uses.
fn volume_score(volume: f64) -> f64 {
    if volume < 100_000.0 {
        1.0
    } else if volume < 500_000.0 {
        0.66
    } else if volume < 1_000_000.0 {
        0.33
    } else {
        0.0
    }
}

fn float_score(float_shares: Option<f64>) -> Option<f64> {
    float_shares.map(|f| {
        if f < 20_000_000.0 {
            1.0
        } else if f < 100_000_000.0 {
            0.5
        } else {
            0.0
        }
    })
}

fn market_cap_score(market_cap: Option<f64>) -> Option<f64> {
    market_cap.map(|mc| {
        if mc < 50_000_000.0 {
            1.0
        } else if mc < 300_000_000.0 {
            0.66
        } else if mc < 2_000_000_000.0 {
            0.33
        } else {
            0.0
        }
    })
}

fn margin_score(profit_margins: Option<f64>) -> Option<f64> {
    profit_margins.map(|m| {
        if m < 0.0 {
            1.0
        } else if m < 0.05 {
            0.5
        } else {
            0.0
        }
    })
}

fn short_interest_score(short_ratio: Option<f64>) -> Option<f64> {
    short_ratio.map(|s| {
        // Providers report this either as days-to-cover or percent-of-float.
        let s = if s > 1.0 && s <= 100.0 { s } else { s * 100.0 };
        if s > 10.0 {
            1.0
        } else if s > 5.0 {
            0.66
        } else if s > 2.0 {
            0.33
        } else {
            0.0
        }
    })
}

fn mean_of_present(parts: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = parts.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Compute the composite regard score for one ticker.
///
/// Pure function of the signal: no I/O, no clock. Required fields are price
/// and volume; missing either is `ScoringError::InsufficientData`. Optional
/// fields are skipped (never zero-filled) and recorded in `missing_factors`
/// in a fixed order. `unknown_threshold` is the optional-factor count at
/// which completeness degrades from `partial` to `unknown`.
pub fn compute_score(
    signal: &TickerSignal,
    weights: &ScoreWeights,
    unknown_threshold: usize,
) -> Result<EngineOutput, ScoringError> {
    let mut required_missing = Vec::new();
    if signal.price.is_none() {
        required_missing.push(MissingFactor::Price);
    }
    if signal.volume.is_none() {
        required_missing.push(MissingFactor::Volume);
    }
    if !required_missing.is_empty() {
        return Err(ScoringError::InsufficientData(required_missing));
    }
    let volume = signal.volume.unwrap_or_default();

    let mut missing = Vec::new();
    if signal.market_cap.is_none() {
        missing.push(MissingFactor::MarketCap);
    }
    if signal.beta.is_none() {
        missing.push(MissingFactor::Beta);
    }
    if signal.profit_margins.is_none() {
        missing.push(MissingFactor::ProfitMargins);
    }
    if signal.short_ratio.is_none() {
        missing.push(MissingFactor::ShortRatio);
    }
    if signal.float_shares.is_none() {
        missing.push(MissingFactor::FloatShares);
    }
    if signal.mentions_24h.is_none() && signal.mentions_7d.is_none() {
        missing.push(MissingFactor::Mentions);
    }
    if signal.change_24h_pct.is_none() {
        missing.push(MissingFactor::Change24h);
    }

    let hype = mean_of_present(&[
        mention_score(signal.mentions_24h, signal.mentions_7d),
        move_score(signal.change_24h_pct),
    ]);
    let volatility = mean_of_present(&[
        beta_score(signal.beta),
        move_score(signal.change_24h_pct),
    ]);
    let liquidity = mean_of_present(&[
        Some(volume_score(volume)),
        float_score(signal.float_shares),
    ]);
    let risk = mean_of_present(&[
        market_cap_score(signal.market_cap),
        margin_score(signal.profit_margins),
        short_interest_score(signal.short_ratio),
    ]);

    // Weighted mean over the sub-scores that had any input; weights for fully
    // absent sub-scores are excluded rather than treated as zero signal.
    let mut weighted = 0.0;
    let mut total_w = 0.0;
    for (sub, w) in [
        (hype, weights.hype),
        (volatility, weights.volatility),
        (liquidity, weights.liquidity),
        (risk, weights.risk),
    ] {
        if let Some(s) = sub {
            weighted += s * w;
            total_w += w;
        }
    }
    // liquidity always has the required volume component, so total_w > 0.
    let composite = (100.0 * weighted / total_w).clamp(0.0, 100.0);

    let completeness = if missing.is_empty() {
        DataCompleteness::Full
    } else if missing.len() >= unknown_threshold {
        DataCompleteness::Unknown
    } else {
        DataCompleteness::Partial
    };

    Ok(EngineOutput {
        breakdown: ScoreBreakdown {
            hype,
            volatility,
            liquidity,
            risk,
            composite,
        },
        completeness,
        missing_factors: missing,
    })
}
