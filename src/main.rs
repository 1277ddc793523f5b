// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/options_copilot_rust

 # chain & iv
curl -s 'localhost:8080/api/chain/AAPL?type=calls&min_dte=20&max_dte=60' | jq '.contracts[:3]'
curl -s localhost:8080/api/iv30/SPX

# chat (SSE)
curl -N -s localhost:8080/api/chat -d '{"messages":[{"role":"user","content":"covered call ideas for my AAPL?"}]}'

# metrics
curl -s localhost:9898/metrics | egrep '^(chat_turns_total|tool_invocations_total|chain_cache_lookups_total)'

*/
/*
=============================================================================
Project : options_copilot_rust — async options-chain copilot service in Rust
Module  : <module_name>.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Fetches and caches delayed option chains, filters them for an
          LLM tool, estimates 30-day implied volatility, runs bounded
          tool-calling chat turns against Anthropic/OpenAI, extracts
          holdings/strategy mutations, exposes Prometheus metrics, and
          records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod symbol;
mod upstream;
mod cache;
mod volatility;
mod query;
mod mutation;
mod provider;
mod anthropic;        // Messages API
mod openai;           // Chat Completions API
mod tools;
mod orchestrator;
mod store;
mod context;
mod server;
#[cfg(test)]
mod testutil;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::anthropic::AnthropicProvider;
use crate::cache::ChainCache;
use crate::domain::{Event, SystemClock};
use crate::openai::OpenAiProvider;
use crate::provider::{Provider, Providers};
use crate::query::ChainQuery;
use crate::server::AppState;
use crate::store::DocumentStore;
use crate::tools::{ChainTool, ToolExecutor};
use crate::upstream::{CboeClient, SpotSource};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config & limits ----
    let (args, limits) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Upstream + cache ----
    let cboe = match CboeClient::new(&args.chain_base_url, &args.quote_base_url, args.http_timeout) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "cannot build upstream http client");
            return;
        }
    };
    let cache = Arc::new(ChainCache::new(cboe.clone(), Arc::new(SystemClock), args.cache_ttl_secs));
    let query = Arc::new(ChainQuery::new(cache));
    let spot: Arc<dyn SpotSource> = cboe;
    let tools: Arc<dyn ToolExecutor> = Arc::new(ChainTool::new(query.clone(), spot.clone()));

    // ---- Providers (hanya yang punya api key) ----
    let mut providers = Providers::default();
    if let Some(cfg) = args.anthropic.clone() {
        match AnthropicProvider::new(cfg, args.http_timeout) {
            Ok(p) => providers.anthropic = Some(Arc::new(p) as Arc<dyn Provider>),
            Err(e) => warn!(error = %e, "anthropic provider disabled"),
        }
    }
    if let Some(cfg) = args.openai.clone() {
        match OpenAiProvider::new(cfg, args.http_timeout) {
            Ok(p) => providers.openai = Some(Arc::new(p) as Arc<dyn Provider>),
            Err(e) => warn!(error = %e, "openai provider disabled"),
        }
    }
    for (name, slot) in [("anthropic", &providers.anthropic), ("openai", &providers.openai)] {
        crate::metrics::CONFIG_PROVIDER
            .with_label_values(&[name])
            .set(slot.is_some() as i64);
    }
    if providers.get(args.default_provider).is_err() {
        warn!(provider = args.default_provider.as_str(), "default provider has no api key; chat requests must pick another");
    }

    // ---- Recorder (optional) ----
    let recorder = args.record_file.clone().map(|path| {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        rec_tx
    });
    if let Some(tx) = &recorder {
        let _ = tx.try_send(Event::Note(format!("startup provider={}", args.default_provider.as_str())));
    }

    // ---- Human-friendly startup info ----
    info!(
        bind = %args.bind_addr,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir,
        provider = args.default_provider.as_str(),
        anthropic = args.anthropic.is_some(),
        openai = args.openai.is_some(),
        cache_ttl_secs = args.cache_ttl_secs,
        max_tool_rounds = limits.max_tool_rounds,
        "startup config"
    );

    let addr: SocketAddr = match args.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(bind = %args.bind_addr, error = %e, "invalid BIND_ADDR");
            return;
        }
    };

    let state = Arc::new(AppState {
        query,
        spot,
        tools: Some(tools),
        providers,
        default_provider: args.default_provider,
        store: DocumentStore::new(&args.data_dir),
        limits,
        recorder,
    });

    // ---- HTTP API ----
    tokio::select! {
        res = server::serve(addr, state) => {
            if let Err(e) = res {
                error!(error = %e, "http server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
}
