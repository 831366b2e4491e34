use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    Ai,
    Fallback,
    Error,
}

impl ScoringMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Fallback => "fallback",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCompleteness {
    Full,
    Partial,
    Unknown,
}

impl DataCompleteness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Unknown => "unknown",
        }
    }
}

/// Signal fields the score engine tracks absence for.
///
/// `Price` and `Volume` are required — missing either aborts scoring.
/// The rest are optional and only degrade completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingFactor {
    Price,
    Volume,
    MarketCap,
    Beta,
    ProfitMargins,
    ShortRatio,
    FloatShares,
    Mentions,
    Change24h,
}

impl MissingFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Volume => "volume",
            Self::MarketCap => "market_cap",
            Self::Beta => "beta",
            Self::ProfitMargins => "profit_margins",
            Self::ShortRatio => "short_ratio",
            Self::FloatShares => "float_shares",
            Self::Mentions => "mentions",
            Self::Change24h => "change_24h",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

/// Per-ticker input to the score engine, assembled from provider responses.
///
/// Absent fields mean "provider did not supply", never zero. The engine skips
/// them and records the gap — do not zero-fill when assembling.
#[derive(Debug, Clone, Default)]
pub struct TickerSignal {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_24h_pct: Option<f64>,
    pub volume: Option<f64>,
    pub market_cap: Option<f64>,
    pub float_shares: Option<f64>,
    pub beta: Option<f64>,
    pub profit_margins: Option<f64>,
    pub short_ratio: Option<f64>,
    pub mentions_24h: Option<u64>,
    pub mentions_7d: Option<u64>,
}

/// Quote from the market-data provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiQuote {
    pub symbol: Option<String>,
    pub price: Option<f64>,
    #[serde(rename = "changePercent")]
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    #[serde(rename = "previousClose")]
    pub previous_close: Option<f64>,
}

/// Company profile / fundamentals from the market-data provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiProfile {
    pub symbol: Option<String>,
    #[serde(rename = "companyName")]
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub beta: Option<f64>,
    #[serde(rename = "profitMargins")]
    pub profit_margins: Option<f64>,
    #[serde(rename = "shortRatio")]
    pub short_ratio: Option<f64>,
    #[serde(rename = "floatShares")]
    pub float_shares: Option<f64>,
}

/// Social mention counts from the mentions provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiMentions {
    pub symbol: Option<String>,
    #[serde(rename = "mentions24h")]
    pub mentions_24h: Option<u64>,
    #[serde(rename = "mentions7d")]
    pub mentions_7d: Option<u64>,
}
