//! HTTP oracle
//!
//! Yields come from a JSON endpoint (`GET {yield_api_url}/yields/{network}`),
//! prices from the Pyth Hermes `latest_price_feeds` API.

use super::{YieldOracle, YieldQuote};
use crate::config::{Network, OracleConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Pyth price feed ids keyed by asset symbol
const PRICE_FEEDS: &[(&str, &str)] = &[
    ("ETH", "0xff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace"),
    ("BTC", "0xe62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43"),
    ("USDC", "0xeaa020c61cc479712813461ce153894a96a6c00b21ed0cfc2798d1f9a9e9c94a"),
    ("USDT", "0x2b89b9dc8fdf9f34709a5b106b472f0f39bb6ca9ce04b0fd7f2e971688e2e53b"),
    ("DAI", "0xb0948a5e5313200c632b51bb5ca32f6de0d36e9950a942d19751e833f70dabfd"),
    ("MATIC", "0x5de33a9112c2b700b8d30b8a3402c103578ccfa2765696471cc672bd5cf6ac52"),
    ("AVAX", "0x93da3352f9f1d105fdfe4971cfa80e9dd777bfc5d0f683ebb6e1294b92137bb7"),
    ("OP", "0x385f64d993f7b77d8182ed5003d97c60aa3361f3cecfe711544d2d59165e9bdf"),
    ("ARB", "0x3fa4252848f9f0a1480be62745a4629d9eb1322aebab8a791e344b3b9c1adcf5"),
    ("CELO", "0x7d669ddcdd23d9ef1fa9a9cc022ba055ec900e91c4cb960f3c20429d4447a411"),
];

/// Pyth feed id for an asset symbol
pub fn price_feed_id(asset: &str) -> Option<&'static str> {
    let asset = asset.to_uppercase();
    PRICE_FEEDS
        .iter()
        .find(|(symbol, _)| *symbol == asset)
        .map(|(_, id)| *id)
}

#[derive(Debug, Deserialize)]
struct YieldResponse {
    apr: f64,
    tvl: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PriceFeed {
    price: PythPrice,
}

#[derive(Debug, Deserialize)]
struct PythPrice {
    price: String,
    expo: i32,
}

impl PythPrice {
    fn value(&self) -> Result<f64> {
        let raw: i64 = self
            .price
            .parse()
            .map_err(|e| Error::Oracle(format!("invalid pyth price {}: {}", self.price, e)))?;
        Ok(raw as f64 * 10_f64.powi(self.expo))
    }
}

pub struct HttpOracle {
    client: Client,
    hermes_url: String,
    yield_api_url: String,
}

impl HttpOracle {
    pub fn new(hermes_url: &str, yield_api_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            hermes_url: hermes_url.trim_end_matches('/').to_string(),
            yield_api_url: yield_api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &OracleConfig, timeout: Duration) -> Result<Self> {
        Self::new(&config.hermes_url, &config.yield_api_url, timeout)
    }

    fn yield_url(&self, network: Network) -> Result<Url> {
        Url::parse(&format!("{}/yields/{}", self.yield_api_url, network.name()))
            .map_err(|e| Error::Config(format!("invalid yield api url: {}", e)))
    }

    fn price_url(&self, feed_id: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/api/latest_price_feeds", self.hermes_url))
            .map_err(|e| Error::Config(format!("invalid hermes url: {}", e)))?;
        url.query_pairs_mut().append_pair("ids[]", feed_id);
        Ok(url)
    }
}

#[async_trait]
impl YieldOracle for HttpOracle {
    async fn get_yield(&self, network: Network) -> Result<YieldQuote> {
        let response = self.client.get(self.yield_url(network)?).send().await?;
        if !response.status().is_success() {
            return Err(Error::Oracle(format!(
                "yield api returned {} for {}",
                response.status(),
                network
            )));
        }

        let body: YieldResponse = response.json().await?;
        if !(body.apr >= 0.0 && body.tvl >= 0.0) {
            return Err(Error::Oracle(format!(
                "yield api returned invalid figures for {}: apr={} tvl={}",
                network, body.apr, body.tvl
            )));
        }

        Ok(YieldQuote {
            apr: body.apr,
            tvl: body.tvl,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
        })
    }

    async fn get_price(&self, asset: &str) -> Result<f64> {
        let feed_id = price_feed_id(asset)
            .ok_or_else(|| Error::Oracle(format!("no price feed for {}", asset)))?;

        let response = self.client.get(self.price_url(feed_id)?).send().await?;
        if !response.status().is_success() {
            return Err(Error::Oracle(format!(
                "hermes returned {} for {}",
                response.status(),
                asset
            )));
        }

        let feeds: Vec<PriceFeed> = response.json().await?;
        let feed = feeds
            .first()
            .ok_or_else(|| Error::Oracle(format!("empty price feed for {}", asset)))?;
        feed.price.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_price_feed_lookup() {
        assert_eq!(
            price_feed_id("eth"),
            Some("0xff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace")
        );
        assert!(price_feed_id("DOGE").is_none());
    }

    #[test]
    fn test_pyth_price_scaling() {
        let feeds: Vec<PriceFeed> = serde_json::from_value(json!([{
            "id": "ff61",
            "price": { "price": "250012345678", "conf": "1", "expo": -8, "publish_time": 1 }
        }]))
        .unwrap();
        let value = feeds[0].price.value().unwrap();
        assert!((value - 2500.12345678).abs() < 1e-6);
    }

    #[test]
    fn test_urls() {
        let oracle = HttpOracle::new(
            "https://hermes.pyth.network/",
            "https://yields.example.com",
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(
            oracle.yield_url(Network::WorldChain).unwrap().as_str(),
            "https://yields.example.com/yields/world-chain"
        );
        let price_url = oracle.price_url("0xabc").unwrap();
        assert_eq!(price_url.path(), "/api/latest_price_feeds");
        assert_eq!(price_url.query(), Some("ids%5B%5D=0xabc"));
    }
}
