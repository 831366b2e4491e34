use anyhow::Result;
use common::market_api::MarketClient;
use common::types::{ApiMentions, ApiProfile, ApiQuote, TickerSignal};
use std::time::Instant;

/// Market-data lookups needed to assemble a [`TickerSignal`].
pub trait SignalFetcher {
    #[allow(dead_code)]
    fn quote_url(&self, symbol: &str) -> String;
    fn fetch_quote(&self, symbol: &str)
        -> impl std::future::Future<Output = Result<ApiQuote>> + Send;
    fn fetch_profile(
        &self,
        symbol: &str,
    ) -> impl std::future::Future<Output = Result<ApiProfile>> + Send;
}

pub trait MentionsFetcher {
    #[allow(dead_code)]
    fn mentions_url(&self, symbol: &str) -> String;
    fn fetch_mentions(
        &self,
        symbol: &str,
    ) -> impl std::future::Future<Output = Result<ApiMentions>> + Send;
}

impl SignalFetcher for MarketClient {
    fn quote_url(&self, symbol: &str) -> String {
        MarketClient::quote_url(self, symbol)
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<ApiQuote> {
        let start = Instant::now();
        let res = self.fetch_quote_raw(symbol).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("regard_api_latency_ms", "endpoint" => "quote").record(ms);
        match res {
            Ok(v) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "quote", "status" => "ok").increment(1);
                Ok(v)
            }
            Err(e) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "quote", "status" => "error").increment(1);
                Err(e)
            }
        }
    }

    async fn fetch_profile(&self, symbol: &str) -> Result<ApiProfile> {
        let start = Instant::now();
        let res = self.fetch_profile_raw(symbol).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("regard_api_latency_ms", "endpoint" => "profile").record(ms);
        match res {
            Ok(v) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "profile", "status" => "ok").increment(1);
                Ok(v)
            }
            Err(e) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "profile", "status" => "error").increment(1);
                Err(e)
            }
        }
    }
}

impl MentionsFetcher for MarketClient {
    fn mentions_url(&self, symbol: &str) -> String {
        MarketClient::mentions_url(self, symbol)
    }

    async fn fetch_mentions(&self, symbol: &str) -> Result<ApiMentions> {
        let start = Instant::now();
        let res = self.fetch_mentions_raw(symbol).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("regard_api_latency_ms", "endpoint" => "mentions").record(ms);
        match res {
            Ok(v) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "mentions", "status" => "ok").increment(1);
                Ok(v)
            }
            Err(e) => {
                metrics::counter!("regard_api_requests_total", "endpoint" => "mentions", "status" => "error").increment(1);
                Err(e)
            }
        }
    }
}

/// Assemble a signal from whatever the providers returned. Profile and
/// mentions lookups are optional enrichment: their failure leaves the
/// corresponding fields absent instead of failing the signal.
pub async fn fetch_signal<S, M>(market: &S, mentions: &M, symbol: &str) -> Result<TickerSignal>
where
    S: SignalFetcher,
    M: MentionsFetcher,
{
    let symbol_upper = symbol.to_uppercase();
    let quote = market.fetch_quote(&symbol_upper).await?;

    let profile = match market.fetch_profile(&symbol_upper).await {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(symbol = %symbol_upper, error = %e, "profile lookup failed; continuing without fundamentals");
            None
        }
    };
    let counts = match mentions.fetch_mentions(&symbol_upper).await {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(symbol = %symbol_upper, error = %e, "mentions lookup failed; continuing without social counts");
            None
        }
    };

    Ok(TickerSignal {
        symbol: symbol_upper,
        price: quote.price,
        change_24h_pct: quote.change_percent,
        volume: quote.volume,
        market_cap: quote.market_cap,
        float_shares: profile.as_ref().and_then(|p| p.float_shares),
        beta: profile.as_ref().and_then(|p| p.beta),
        profit_margins: profile.as_ref().and_then(|p| p.profit_margins),
        short_ratio: profile.as_ref().and_then(|p| p.short_ratio),
        mentions_24h: counts.as_ref().and_then(|m| m.mentions_24h),
        mentions_7d: counts.as_ref().and_then(|m| m.mentions_7d),
    })
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeMarket;
    use super::*;

    #[tokio::test]
    async fn test_fetch_signal_assembles_all_fields() {
        let fake = FakeMarket::default();
        let signal = fetch_signal(&fake, &fake, "gme").await.unwrap();
        assert_eq!(signal.symbol, "GME");
        assert_eq!(signal.price, Some(24.1));
        assert_eq!(signal.beta, Some(2.1));
        assert_eq!(signal.mentions_24h, Some(400));
    }

    #[tokio::test]
    async fn test_fetch_signal_survives_enrichment_failures() {
        let fake = FakeMarket {
            profile: None,
            mentions: None,
            ..FakeMarket::default()
        };
        let signal = fetch_signal(&fake, &fake, "GME").await.unwrap();
        assert_eq!(signal.price, Some(24.1));
        assert!(signal.beta.is_none());
        assert!(signal.mentions_24h.is_none());
    }

    #[tokio::test]
    async fn test_fetch_signal_fails_when_quote_fails() {
        let fake = FakeMarket {
            fail_quote: true,
            ..FakeMarket::default()
        };
        assert!(fetch_signal(&fake, &fake, "GME").await.is_err());
    }
}
