// ===============================
// src/config.rs
// ===============================
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
use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use crate::anthropic::AnthropicConfig;
use crate::cache::DEFAULT_TTL_SECS;
use crate::domain::ProviderKind;
use crate::openai::OpenAiConfig;

pub const DEFAULT_CHAIN_BASE_URL: &str = "https://cdn.cboe.com/api/global/delayed_quotes/options";
pub const DEFAULT_QUOTE_BASE_URL: &str = "https://cdn.cboe.com/api/global/delayed_quotes/quotes";

/// Flag command line; semua opsional, menimpa nilai dari ENV.
#[derive(Parser, Debug, Default)]
#[command(name = "options_copilot_rust", about = "Options chain copilot service")]
pub struct Cli {
    /// Listen address for the HTTP API (BIND_ADDR)
    #[arg(long)]
    pub bind: Option<String>,
    /// Prometheus port (METRICS_PORT)
    #[arg(long)]
    pub metrics_port: Option<u16>,
    /// Default provider: anthropic | openai (PROVIDER)
    #[arg(long)]
    pub provider: Option<String>,
    /// JSONL audit file (RECORD_FILE)
    #[arg(long)]
    pub record_file: Option<String>,
    /// Document store directory (DATA_DIR)
    #[arg(long)]
    pub data_dir: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    // server / files / metrics
    pub bind_addr: String,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub data_dir: String,

    // upstream market data
    pub chain_base_url: String,
    pub quote_base_url: String,
    pub cache_ttl_secs: i64,
    pub http_timeout: Duration,

    // providers (None = api key tidak diset)
    pub default_provider: ProviderKind,
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiConfig>,
}

/// Batas per chat turn.
#[derive(Clone, Debug)]
pub struct TurnLimits {
    pub max_tool_rounds: usize,
    pub provider_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            provider_timeout: Duration::from_millis(90_000),
            tool_timeout: Duration::from_millis(20_000),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn api_key(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn load() -> (Args, TurnLimits) {
    // Pastikan .env dibaca sebelum clap (agar default dari file ikut)
    let _ = dotenv();
    load_with(Cli::parse())
}

pub fn load_with(cli: Cli) -> (Args, TurnLimits) {
    // ===== Server =====
    let bind_addr = cli.bind.unwrap_or_else(|| env_string("BIND_ADDR", "127.0.0.1:8080"));
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env_or("METRICS_PORT", 9898));
    let record_file = cli.record_file.or_else(|| env::var("RECORD_FILE").ok());
    let data_dir = cli.data_dir.unwrap_or_else(|| env_string("DATA_DIR", "./data"));

    // ===== Upstream =====
    let chain_base_url = env_string("CHAIN_BASE_URL", DEFAULT_CHAIN_BASE_URL);
    let quote_base_url = env_string("QUOTE_BASE_URL", DEFAULT_QUOTE_BASE_URL);
    let cache_ttl_secs = env_or("CHAIN_CACHE_TTL_SECS", DEFAULT_TTL_SECS);
    let http_timeout = Duration::from_millis(env_or("HTTP_TIMEOUT_MS", 10_000));

    // ===== Providers =====
    // Contoh:
    //   PROVIDER=openai
    //   ANTHROPIC_API_KEY=...  OPENAI_API_KEY=...
    let default_provider = cli
        .provider
        .or_else(|| env::var("PROVIDER").ok())
        .and_then(|s| ProviderKind::parse(&s))
        .unwrap_or(ProviderKind::Anthropic);
    let max_tokens = env_or("MAX_TOKENS", 4096u32);

    let anthropic = api_key("ANTHROPIC_API_KEY").map(|api_key| AnthropicConfig {
        api_key,
        model: env_string("ANTHROPIC_MODEL", "claude-sonnet-4-5"),
        base_url: env_string("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
        max_tokens,
    });
    let openai = api_key("OPENAI_API_KEY").map(|api_key| OpenAiConfig {
        api_key,
        model: env_string("OPENAI_MODEL", "gpt-4.1"),
        base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com"),
        max_tokens,
    });

    let args = Args {
        bind_addr,
        metrics_port,
        record_file,
        data_dir,
        chain_base_url,
        quote_base_url,
        cache_ttl_secs,
        http_timeout,
        default_provider,
        anthropic,
        openai,
    };

    // ===== Limits =====
    let d = TurnLimits::default();
    let limits = TurnLimits {
        max_tool_rounds: env_or("MAX_TOOL_ROUNDS", d.max_tool_rounds),
        provider_timeout: env::var("PROVIDER_TIMEOUT_MS")
            .ok()
            .and_then(|x| x.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.provider_timeout),
        tool_timeout: env::var("TOOL_TIMEOUT_MS")
            .ok()
            .and_then(|x| x.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.tool_timeout),
    };
    (args, limits)
}
