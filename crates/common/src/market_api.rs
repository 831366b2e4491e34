use crate::types::{ApiMentions, ApiProfile, ApiQuote};
use anyhow::Result;
use reqwest::Url;
use std::time::Duration;

/// HTTP client for the market-data and mentions providers.
///
/// Every request carries an explicit timeout; slow providers surface as
/// errors here and degrade at the caller, they never hang a pipeline run.
pub struct MarketClient {
    http: reqwest::Client,
    market_api_url: String,
    mentions_api_url: String,
}

impl MarketClient {
    pub fn new(market_api_url: &str, mentions_api_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            market_api_url: market_api_url.trim_end_matches('/').to_string(),
            mentions_api_url: mentions_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn quote_url(&self, symbol: &str) -> String {
        let mut url = Url::parse(&format!("{}/quote", self.market_api_url))
            .expect("market_api_url must be a valid absolute URL");
        url.query_pairs_mut().append_pair("symbol", symbol);
        url.to_string()
    }

    pub fn profile_url(&self, symbol: &str) -> String {
        let mut url = Url::parse(&format!("{}/profile", self.market_api_url))
            .expect("market_api_url must be a valid absolute URL");
        url.query_pairs_mut().append_pair("symbol", symbol);
        url.to_string()
    }

    pub fn mentions_url(&self, symbol: &str) -> String {
        let mut url = Url::parse(&format!("{}/mentions", self.mentions_api_url))
            .expect("mentions_api_url must be a valid absolute URL");
        url.query_pairs_mut().append_pair("symbol", symbol);
        url.to_string()
    }

    pub async fn fetch_quote_raw(&self, symbol: &str) -> Result<ApiQuote> {
        let body = self
            .http
            .get(self.quote_url(symbol))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn fetch_profile_raw(&self, symbol: &str) -> Result<ApiProfile> {
        let body = self
            .http
            .get(self.profile_url(symbol))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn fetch_mentions_raw(&self, symbol: &str) -> Result<ApiMentions> {
        let body = self
            .http
            .get(self.mentions_url(symbol))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}
