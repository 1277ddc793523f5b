// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static CHAIN_FETCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("chain_fetches_total", "upstream option chain fetches (label: status)"),
        &["status"],
    )
    .unwrap()
});

pub static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("chain_cache_lookups_total", "chain cache lookups (label: result = hit|miss|expired)"),
        &["result"],
    )
    .unwrap()
});

// Latency of one upstream chain fetch (milliseconds)
pub static UPSTREAM_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("upstream_chain_latency_ms", "Latency of upstream chain fetch (ms)")
            .buckets(vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0]),
    )
    .unwrap()
});

// -------- Conversation --------
pub static TURNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("chat_turns_total", "chat turns by provider & outcome"),
        &["provider", "outcome"],
    )
    .unwrap()
});

pub static TOOL_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("tool_invocations_total", "tool invocations (labels: tool, status)"),
        &["tool", "status"],
    )
    .unwrap()
});

pub static TOOL_ROUNDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("tool_rounds_per_turn", "tool rounds executed per chat turn")
            .buckets(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 8.0]),
    )
    .unwrap()
});

pub static MUTATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("mutation_extractions_total", "mutation block extraction (label: result = parsed|failed|absent)"),
        &["result"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_PROVIDER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_provider", "providers with an api key configured (label: provider)"),
        &["provider"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(CHAIN_FETCHES.clone())),
        REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())),
        REGISTRY.register(Box::new(UPSTREAM_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(TURNS.clone())),
        REGISTRY.register(Box::new(TOOL_CALLS.clone())),
        REGISTRY.register(Box::new(TOOL_ROUNDS.clone())),
        REGISTRY.register(Box::new(MUTATIONS.clone())),
        REGISTRY.register(Box::new(CONFIG_PROVIDER.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// GET / atau /metrics -> text format; path lain 404
async fn metrics_response(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header(CONTENT_TYPE, TextEncoder::new().format_type())
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

// Listener terpisah dari API (port sendiri), scrape tidak lewat routing API
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(%addr, error = %e, "metrics bind failed");
            return;
        }
    };
    info!("metrics listening on http://{addr}/ (and /metrics)");
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(metrics_response)) });
    if let Err(e) = builder.serve(make_svc).await {
        error!(error = %e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_counters() {
        init();
        MUTATIONS.with_label_values(&["absent"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("mutation_extractions_total"));
    }

    #[tokio::test]
    async fn scrape_paths() {
        init();
        TURNS.with_label_values(&["anthropic", "ok"]).inc();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let rsp = metrics_response(req).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        assert!(rsp.headers()[CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
        let body = hyper::body::to_bytes(rsp.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("chat_turns_total"));

        let req = Request::builder().uri("/favicon.ico").body(Body::empty()).unwrap();
        assert_eq!(metrics_response(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }
}
