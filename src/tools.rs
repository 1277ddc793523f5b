// ===============================
// src/tools.rs (tool yang bisa dipanggil model)
// ===============================
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::domain::{FilteredContract, ToolInvocation};
use crate::provider::ToolSpec;
use crate::query::{self, ChainFilter, ChainQuery, KindFilter, HARD_CAP};
use crate::upstream::{SpotSource, UpstreamError};
use crate::volatility;

pub const CHAIN_TOOL: &str = "get_option_chain";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("tool timed out")]
    Timeout,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;
    async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError>;
}

/// Arguments as the model sends them; every filter field is optional.
#[derive(Debug, Deserialize)]
struct ChainToolArgs {
    ticker: String,
    option_type: Option<String>,
    min_dte: Option<f64>,
    max_dte: Option<f64>,
    otm_only: Option<bool>,
    max_results: Option<f64>,
}

impl ChainToolArgs {
    fn into_filter(self) -> Result<(String, ChainFilter), ToolError> {
        let ticker = self.ticker.trim().to_ascii_uppercase();
        if ticker.is_empty() {
            return Err(ToolError::InvalidArguments("ticker is required".into()));
        }
        let d = ChainFilter::default();
        let kind = match self.option_type.as_deref() {
            None => d.kind,
            Some(s) => KindFilter::parse(s)
                .ok_or_else(|| ToolError::InvalidArguments(format!("option_type `{s}` is not calls|puts|both")))?,
        };
        let filter = ChainFilter {
            kind,
            min_dte: self.min_dte.map(|v| v.round() as i64).unwrap_or(d.min_dte),
            max_dte: self.max_dte.map(|v| v.round() as i64).unwrap_or(d.max_dte),
            otm_only: self.otm_only.unwrap_or(d.otm_only),
            max_results: self.max_results.map(|v| v.max(0.0) as usize).unwrap_or(d.max_results),
            underlying_price: None,
        };
        Ok((ticker, filter))
    }
}

#[derive(Debug, Serialize)]
struct ChainToolOutput {
    ticker: String,
    underlying_price: Option<f64>,
    iv30: Option<f64>,
    count: usize,
    contracts: Vec<FilteredContract>,
}

pub struct ChainTool {
    query: Arc<ChainQuery>,
    spot: Arc<dyn SpotSource>,
}

impl ChainTool {
    pub fn new(query: Arc<ChainQuery>, spot: Arc<dyn SpotSource>) -> Self { Self { query, spot } }

    pub fn spec() -> ToolSpec {
        ToolSpec {
            name: CHAIN_TOOL.to_string(),
            description: "Fetch a filtered option chain for one underlying. Returns the nearest-dated, \
                          closest-to-the-money contracts first with bid/ask/mid, IV, delta, volume and \
                          open interest, plus the underlying price and a 30-day IV estimate."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ticker": { "type": "string", "description": "Underlying symbol, e.g. AAPL or SPX" },
                    "option_type": { "type": "string", "enum": ["calls", "puts", "both"], "description": "Default both" },
                    "min_dte": { "type": "integer", "description": "Minimum days to expiry, default 20" },
                    "max_dte": { "type": "integer", "description": "Maximum days to expiry, default 90" },
                    "otm_only": { "type": "boolean", "description": "Only out-of-the-money contracts, default true" },
                    "max_results": { "type": "integer", "description": format!("Default 25, capped at {HARD_CAP}") }
                },
                "required": ["ticker"]
            }),
        }
    }

    async fn run_chain(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let args: ChainToolArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let (ticker, mut filter) = args.into_filter()?;

        // spot best-effort: gagal -> filter OTM dilewati
        let spot = match self.spot.fetch_spot(&ticker).await {
            Ok(q) => Some(q.price),
            Err(e) => {
                debug!(%ticker, error = %e, "spot unavailable, OTM filter skipped");
                None
            }
        };
        filter.underlying_price = spot;

        // satu snapshot chain untuk filter dan iv30
        let cache = self.query.cache();
        let chain = cache.get_chain(&ticker).await?;
        let today = cache.clock().today();
        let contracts = query::apply_filter(&chain, &filter, today);
        let iv30 = spot.and_then(|s| volatility::estimate_30day_iv(&chain, s, today));

        let out = ChainToolOutput { ticker, underlying_price: spot, iv30, count: contracts.len(), contracts };
        serde_json::to_string(&out).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

#[async_trait]
impl ToolExecutor for ChainTool {
    fn specs(&self) -> Vec<ToolSpec> { vec![Self::spec()] }

    async fn execute(&self, invocation: &ToolInvocation) -> Result<String, ToolError> {
        match invocation.name.as_str() {
            CHAIN_TOOL => self.run_chain(invocation.arguments.clone()).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}
