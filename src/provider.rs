// ===============================
// src/provider.rs (provider-agnostic completion interface)
// ===============================
//
// Dua mode per provider:
// - submit_tool_round      : non-streaming, jawaban lengkap supaya keputusan
//                            tool_use bisa diperiksa
// - submit_streaming_final : streaming teks untuk ronde terakhir
//
// Implementasi: anthropic.rs, openai.rs. Orchestrator hanya kenal trait ini.
//

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{ProviderKind, ToolInvocation, TurnMessage};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no api key configured for {0}")]
    MissingApiKey(&'static str),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("provider call timed out")]
    Timeout,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() { ProviderError::Timeout } else { ProviderError::Transport(e.to_string()) }
    }
}

/// Tool definition advertised to the model (JSON-schema parameters).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Complete response of one non-streaming round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRoundReply {
    pub text: String,
    pub invocations: Vec<ToolInvocation>,
}

impl ToolRoundReply {
    pub fn wants_tools(&self) -> bool { !self.invocations.is_empty() }
}

pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn submit_tool_round(
        &self,
        system: &str,
        messages: &[TurnMessage],
        tools: &[ToolSpec],
    ) -> Result<ToolRoundReply, ProviderError>;

    async fn submit_streaming_final(
        &self,
        system: &str,
        messages: &[TurnMessage],
        tools: &[ToolSpec],
    ) -> Result<TextStream, ProviderError>;
}

/// Resolves the per-request provider selector.
#[derive(Default, Clone)]
pub struct Providers {
    pub anthropic: Option<Arc<dyn Provider>>,
    pub openai: Option<Arc<dyn Provider>>,
}

impl Providers {
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>, ProviderError> {
        let slot = match kind {
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::OpenAi => &self.openai,
        };
        slot.clone().ok_or(ProviderError::MissingApiKey(kind.as_str()))
    }
}

// ---- SSE ----

struct SseState<S> {
    inner: S,
    buf: Vec<u8>,
    ready: VecDeque<String>,
    done: bool,
}

impl<S> SseState<S> {
    // pindahkan baris lengkap dari buf ke antrian `data:` payload
    fn drain_lines(&mut self, flush: bool) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.push_line(&line);
        }
        if flush && !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(data) = line.strip_prefix("data:") {
            self.ready.push_back(data.trim_start().to_string());
        }
    }
}

/// Turns a chunked byte stream into the `data:` payloads of a Server-Sent Events body.
pub fn sse_data<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, ProviderError>>
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState { inner: bytes, buf: Vec::new(), ready: VecDeque::new(), done: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.ready.pop_front() {
                return Some((Ok(data), st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    st.drain_lines(false);
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ProviderError::Transport(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    st.drain_lines(true);
                }
            }
        }
    })
    .boxed()
}

/// Non-2xx response -> `ProviderError::Status` with the body for diagnostics.
pub async fn check_status(rsp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(ProviderError::Status { status: status.as_u16(), body })
}
