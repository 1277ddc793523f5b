// ===============================
// src/upstream.rs
// ===============================
//
// Upstream market data adapters:
// - ChainSource : full option chain per underlying (list of RawContract)
// - SpotSource  : current / previous close per ticker
// - CboeClient  : HTTP implementation for both (delayed quotes, no auth)
//
// Notes:
// - Tidak ada retry otomatis. Sumber data gratis dan rate-limited; kegagalan
//   dikembalikan ke caller sebagai UpstreamError.
// - Index cash-settled (SPX, NDX, ...) diminta dengan prefix '_' oleh upstream.
//

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{RawContract, SpotQuote};
use crate::metrics::{CHAIN_FETCHES, UPSTREAM_LATENCY_MS};

const BROWSER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const INDEX_TICKERS: &[&str] = &["SPX", "NDX", "RUT", "VIX", "XSP", "DJX", "OEX"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("upstream returned {status} {reason}")]
    Status { status: u16, reason: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),
    #[error("upstream request timed out")]
    Timeout,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            UpstreamError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            }
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn fetch_chain(&self, ticker: &str) -> Result<Vec<RawContract>, UpstreamError>;
}

#[async_trait]
pub trait SpotSource: Send + Sync {
    async fn fetch_spot(&self, ticker: &str) -> Result<SpotQuote, UpstreamError>;
}

// ---- wire documents ----

#[derive(Debug, Deserialize)]
struct ChainDocument { data: ChainData }
#[derive(Debug, Deserialize)]
struct ChainData {
    #[serde(default)]
    options: Vec<RawContract>,
}

#[derive(Debug, Deserialize)]
struct QuoteDocument { data: QuoteData }
#[derive(Debug, Deserialize)]
struct QuoteData {
    current_price: Option<f64>,
    prev_day_close: Option<f64>,
}

/// Path segment the upstream expects for a ticker.
pub fn upstream_ticker(ticker: &str) -> String {
    let t = ticker.trim().to_ascii_uppercase();
    if INDEX_TICKERS.contains(&t.as_str()) { format!("_{t}") } else { t }
}

pub struct CboeClient {
    http: reqwest::Client,
    chain_base: String,
    quote_base: String,
}

impl CboeClient {
    pub fn new(chain_base: &str, quote_base: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .user_agent(BROWSER_UA)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            chain_base: chain_base.trim_end_matches('/').to_string(),
            quote_base: quote_base.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, UpstreamError> {
        let rsp = self.http.get(url).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        let body = rsp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ChainSource for CboeClient {
    async fn fetch_chain(&self, ticker: &str) -> Result<Vec<RawContract>, UpstreamError> {
        let url = format!("{}/{}.json", self.chain_base, urlencoding::encode(&upstream_ticker(ticker)));
        let started = Instant::now();
        let res = self.get_json::<ChainDocument>(&url).await;
        UPSTREAM_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1000.0);

        match res {
            Ok(doc) => {
                CHAIN_FETCHES.with_label_values(&["ok"]).inc();
                debug!(%ticker, count = doc.data.options.len(), "chain fetched");
                Ok(doc.data.options)
            }
            Err(e) => {
                CHAIN_FETCHES.with_label_values(&["error"]).inc();
                warn!(%ticker, error = %e, "chain fetch failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl SpotSource for CboeClient {
    async fn fetch_spot(&self, ticker: &str) -> Result<SpotQuote, UpstreamError> {
        let url = format!("{}/{}.json", self.quote_base, urlencoding::encode(&upstream_ticker(ticker)));
        let doc: QuoteDocument = self.get_json(&url).await.map_err(|e| {
            warn!(%ticker, error = %e, "quote fetch failed");
            e
        })?;
        let price = doc
            .data
            .current_price
            .ok_or_else(|| UpstreamError::Decode("quote without current_price".into()))?;
        Ok(SpotQuote {
            ticker: ticker.trim().to_ascii_uppercase(),
            price,
            prev_close: doc.data.prev_day_close.unwrap_or(price),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_tickers_get_prefix() {
        assert_eq!(upstream_ticker("spx"), "_SPX");
        assert_eq!(upstream_ticker(" AAPL "), "AAPL");
    }

    #[test]
    fn parses_chain_document() {
        let body = r#"{"timestamp":"2026-10-15 15:00:00","data":{"current_price":105.2,
            "options":[{"option":"XYZ261120C00110000","bid":1.1,"ask":1.3,"iv":0.31,
            "open_interest":120,"volume":15,"delta":0.35,"last_trade_price":1.2,"prev_day_close":1.0}]}}"#;
        let doc: ChainDocument = serde_json::from_str(body).unwrap();
        assert_eq!(doc.data.options.len(), 1);
        assert_eq!(doc.data.options[0].symbol, "XYZ261120C00110000");
        assert_eq!(doc.data.options[0].open_interest, 120.0);
    }

    #[test]
    fn parses_quote_document() {
        let doc: QuoteDocument =
            serde_json::from_str(r#"{"data":{"current_price":101.5,"close":100.0,"prev_day_close":99.0}}"#).unwrap();
        assert_eq!(doc.data.current_price, Some(101.5));
        assert_eq!(doc.data.prev_day_close, Some(99.0));
    }
}
