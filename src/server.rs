// ===============================
// src/server.rs (HTTP API + SSE chat)
// ===============================
//
//   GET  /api/chain/{ticker}?type=&min_dte=&max_dte=&otm_only=&max_results=&underlying_price=
//   GET  /api/iv30/{ticker}
//   GET  /api/term/{ticker}
//   GET  /api/quote/{ticker}
//   GET  /api/mid?ticker=&kind=&strike=&expiry=YYYY-MM-DD
//   GET  /api/store/{key}      PUT /api/store/{key}
//   POST /api/chat             -> text/event-stream, satu `data:` per ChatEvent
//   POST /api/mutation/apply
//
// Error selalu JSON `{ "error": "..." }`.
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::NaiveDate;
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TurnLimits;
use crate::context;
use crate::domain::{ChatEvent, ChatMessage, ConversationTurn, Event, MutationCommand, OptionKind, ProviderKind};
use crate::mutation;
use crate::orchestrator;
use crate::provider::{ProviderError, Providers};
use crate::query::{ChainFilter, ChainQuery, KindFilter};
use crate::store::{DocumentStore, StoreError};
use crate::tools::ToolExecutor;
use crate::upstream::{SpotSource, UpstreamError};
use crate::volatility;

pub struct AppState {
    pub query: Arc<ChainQuery>,
    pub spot: Arc<dyn SpotSource>,
    pub tools: Option<Arc<dyn ToolExecutor>>,
    pub providers: Providers,
    pub default_provider: ProviderKind,
    pub store: DocumentStore,
    pub limits: TurnLimits,
    pub recorder: Option<mpsc::Sender<Event>>,
}

impl AppState {
    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            // recorder lambat -> event dibuang, bukan menahan request
            let _ = tx.try_send(ev);
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self { Self { status, message: message.into() } }
    fn bad_request(message: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, message) }
}

impl From<UpstreamError> for ApiError {
    fn from(e: UpstreamError) -> Self {
        let status = match e {
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Status { status: 404, .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        let status = match e {
            ProviderError::MissingApiKey(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult = Result<Response<Body>, ApiError>;

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec());
    let mut rsp = Response::new(Body::from(bytes));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    rsp
}

fn error_response(e: ApiError) -> Response<Body> {
    json_response(e.status, &json!({ "error": e.message }))
}

fn parse_query(q: Option<&str>) -> HashMap<String, String> {
    q.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn param<T: std::str::FromStr>(q: &HashMap<String, String>, key: &str) -> Result<Option<T>, ApiError> {
    match q.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("invalid `{key}`: {raw}"))),
    }
}

fn normalize_ticker(raw: &str) -> Result<String, ApiError> {
    let decoded = urlencoding::decode(raw).map_err(|_| ApiError::bad_request("ticker is not valid UTF-8"))?;
    let t = decoded.trim().to_ascii_uppercase();
    if t.is_empty() || t.len() > 10 || !t.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'^') {
        return Err(ApiError::bad_request(format!("invalid ticker `{t}`")));
    }
    Ok(t)
}

async fn read_json<T: for<'de> Deserialize<'de>>(body: Body) -> Result<T, ApiError> {
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

/// GET /api/chain/{ticker}
async fn get_chain(st: &AppState, ticker: &str, q: &HashMap<String, String>) -> ApiResult {
    let ticker = normalize_ticker(ticker)?;
    let d = ChainFilter::default();
    let kind = match q.get("type") {
        Some(s) => KindFilter::parse(s).ok_or_else(|| ApiError::bad_request(format!("invalid `type`: {s}")))?,
        None => d.kind,
    };
    let mut filter = ChainFilter {
        kind,
        min_dte: param(q, "min_dte")?.unwrap_or(d.min_dte),
        max_dte: param(q, "max_dte")?.unwrap_or(d.max_dte),
        otm_only: param(q, "otm_only")?.unwrap_or(d.otm_only),
        max_results: param(q, "max_results")?.unwrap_or(d.max_results),
        underlying_price: param(q, "underlying_price")?,
    };
    if filter.otm_only && filter.underlying_price.is_none() {
        filter.underlying_price = st.spot.fetch_spot(&ticker).await.ok().map(|s| s.price);
    }

    let contracts = st.query.query(&ticker, &filter).await?;
    Ok(json_response(
        StatusCode::OK,
        &json!({
            "ticker": ticker,
            "underlying_price": filter.underlying_price,
            "count": contracts.len(),
            "contracts": contracts,
        }),
    ))
}

/// GET /api/iv30/{ticker}
async fn get_iv30(st: &AppState, ticker: &str) -> ApiResult {
    let ticker = normalize_ticker(ticker)?;
    let spot = st.spot.fetch_spot(&ticker).await?;
    let chain = st.query.cache().get_chain(&ticker).await?;
    let iv30 = volatility::estimate_30day_iv(&chain, spot.price, st.query.cache().clock().today());
    Ok(json_response(StatusCode::OK, &json!({ "ticker": ticker, "spot": spot.price, "iv30": iv30 })))
}

/// GET /api/term/{ticker}
async fn get_term(st: &AppState, ticker: &str) -> ApiResult {
    let ticker = normalize_ticker(ticker)?;
    let spot = st.spot.fetch_spot(&ticker).await?;
    let chain = st.query.cache().get_chain(&ticker).await?;
    let points = volatility::term_structure(&chain, spot.price, st.query.cache().clock().today());
    Ok(json_response(StatusCode::OK, &json!({ "ticker": ticker, "spot": spot.price, "points": points })))
}

/// GET /api/quote/{ticker}
async fn get_quote(st: &AppState, ticker: &str) -> ApiResult {
    let ticker = normalize_ticker(ticker)?;
    let quote = st.spot.fetch_spot(&ticker).await?;
    Ok(json_response(StatusCode::OK, &quote))
}

/// GET /api/mid?ticker=&kind=&strike=&expiry=
async fn get_mid(st: &AppState, q: &HashMap<String, String>) -> ApiResult {
    let ticker = normalize_ticker(q.get("ticker").map(String::as_str).unwrap_or(""))?;
    let kind = q
        .get("kind")
        .and_then(|k| OptionKind::parse(k))
        .ok_or_else(|| ApiError::bad_request("`kind` must be call or put"))?;
    let strike: f64 = param(q, "strike")?.ok_or_else(|| ApiError::bad_request("`strike` is required"))?;
    let expiry = q
        .get("expiry")
        .and_then(|e| NaiveDate::parse_from_str(e.trim(), "%Y-%m-%d").ok())
        .ok_or_else(|| ApiError::bad_request("`expiry` must be YYYY-MM-DD"))?;

    match st.query.cache().get_mid(&ticker, kind, strike, expiry).await {
        Some(mid) => Ok(json_response(StatusCode::OK, &mid)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "contract not found or chain unavailable")),
    }
}

/// GET /api/store/{key}
async fn get_doc(st: &AppState, key: &str) -> ApiResult {
    match st.store.get(key).await? {
        Some(doc) => Ok(json_response(StatusCode::OK, &doc)),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, format!("no document `{key}`"))),
    }
}

/// PUT /api/store/{key}
async fn put_doc(st: &AppState, key: &str, body: Body) -> ApiResult {
    let doc: Value = read_json(body).await?;
    st.store.put(key, &doc).await?;
    Ok(json_response(StatusCode::OK, &json!({ "stored": key })))
}

/// POST /api/mutation/apply
async fn apply_mutation(st: &AppState, body: Body) -> ApiResult {
    let cmd: MutationCommand = read_json(body).await?;
    mutation::validate(&cmd).map_err(ApiError::bad_request)?;
    let target = cmd.target();
    st.store.put(target.key(), &cmd.content_value()).await?;
    info!(target = target.key(), "mutation applied");
    st.record(Event::MutationApplied { target });
    Ok(json_response(StatusCode::OK, &json!({ "applied": target })))
}

fn default_true() -> bool { true }

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    provider: Option<ProviderKind>,
    #[serde(default = "default_true")]
    use_tools: bool,
}

fn sse_frame(ev: &ChatEvent) -> Bytes {
    let data = serde_json::to_string(ev).unwrap_or_else(|_| r#"{"type":"error","message":"encode"}"#.to_string());
    Bytes::from(format!("data: {data}\n\n"))
}

/// POST /api/chat
async fn post_chat(st: Arc<AppState>, body: Body) -> ApiResult {
    let req: ChatRequest = read_json(body).await?;
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    let kind = req.provider.unwrap_or(st.default_provider);
    let provider = st.providers.get(kind)?;
    let tools = if req.use_tools { st.tools.clone() } else { None };

    let today = st.query.cache().clock().today();
    let system_context = context::build(&st.store, st.spot.as_ref(), today, tools.is_some()).await;
    let turn = ConversationTurn { messages: req.messages, system_context, provider: kind };

    let turn_id = format!("{:016x}", rand::random::<u64>());
    info!(%turn_id, provider = kind.as_str(), tools = tools.is_some(), "chat turn started");
    let mut events = orchestrator::run_turn(turn, provider, tools, st.limits.clone());

    let (mut sender, body) = Body::channel();
    let state = st.clone();
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            let frame = sse_frame(&ev);
            state.record(Event::Chat { turn_id: turn_id.clone(), event: ev });
            if sender.send_data(frame).await.is_err() {
                // client putus -> drop `events`, turn ikut dibatalkan
                debug!(%turn_id, "sse client disconnected");
                return;
            }
        }
    });

    let mut rsp = Response::new(body);
    rsp.headers_mut().insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/event-stream"));
    rsp.headers_mut().insert(CACHE_CONTROL, hyper::header::HeaderValue::from_static("no-cache"));
    Ok(rsp)
}

async fn route(st: Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let q = parse_query(parts.uri.query());
    let segs: Vec<&str> = path.trim_matches('/').split('/').collect();

    let res = match (&parts.method, segs.as_slice()) {
        (&Method::GET, ["api", "chain", t]) => get_chain(&st, t, &q).await,
        (&Method::GET, ["api", "iv30", t]) => get_iv30(&st, t).await,
        (&Method::GET, ["api", "term", t]) => get_term(&st, t).await,
        (&Method::GET, ["api", "quote", t]) => get_quote(&st, t).await,
        (&Method::GET, ["api", "mid"]) => get_mid(&st, &q).await,
        (&Method::GET, ["api", "store", key]) => get_doc(&st, key).await,
        (&Method::PUT, ["api", "store", key]) => put_doc(&st, key, body).await,
        (&Method::POST, ["api", "chat"]) => post_chat(st.clone(), body).await,
        (&Method::POST, ["api", "mutation", "apply"]) => apply_mutation(&st, body).await,
        _ => Err(ApiError::new(StatusCode::NOT_FOUND, format!("no route for {} {}", parts.method, path))),
    };

    Ok(res.unwrap_or_else(|e| {
        if e.status.is_server_error() {
            warn!(%path, status = e.status.as_u16(), error = %e.message, "request failed");
        }
        error_response(e)
    }))
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| route(state.clone(), req))) }
    });
    info!(%addr, "http api listening");
    Server::bind(&addr).serve(make_svc).await
}
