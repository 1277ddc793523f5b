// ===============================
// src/openai.rs (Chat Completions API)
// ===============================
//
// - system prompt = pesan pertama role "system"
// - tool call  : choices[0].message.tool_calls, arguments berupa string JSON
// - tool result: satu pesan role "tool" per hasil (tool_call_id)
// - streaming  : choices[0].delta.content, diakhiri `data: [DONE]`
//

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::{ProviderKind, ToolInvocation, TurnMessage};
use crate::provider::{check_status, sse_data, Provider, ProviderError, TextStream, ToolRoundReply, ToolSpec};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

pub struct OpenAiProvider {
    http: reqwest::Client,
    cfg: OpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}
#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
    finish_reason: Option<String>,
}
#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}
#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}
#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn wire_messages(system: &str, messages: &[TurnMessage]) -> Vec<Value> {
    let mut out = vec![json!({ "role": "system", "content": system })];
    for m in messages {
        match m {
            TurnMessage::User(text) => out.push(json!({ "role": "user", "content": text })),
            TurnMessage::Assistant(text) => out.push(json!({ "role": "assistant", "content": text })),
            TurnMessage::ToolCalls { text, calls } => {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_string() },
                    }))
                    .collect();
                let content = if text.is_empty() { Value::Null } else { Value::String(text.clone()) };
                out.push(json!({ "role": "assistant", "content": content, "tool_calls": calls }));
            }
            TurnMessage::ToolResults(results) => {
                for r in results {
                    out.push(json!({ "role": "tool", "tool_call_id": r.invocation_id, "content": r.content }));
                }
            }
        }
    }
    out
}

fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({
            "type": "function",
            "function": { "name": t.name, "description": t.description, "parameters": t.parameters },
        }))
        .collect()
}

fn parse_reply(rsp: CompletionResponse) -> Result<ToolRoundReply, ProviderError> {
    let choice = rsp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Decode("completion without choices".into()))?;
    let wants_tools = choice.finish_reason.as_deref() == Some("tool_calls") || !choice.message.tool_calls.is_empty();

    let invocations = if wants_tools {
        choice
            .message
            .tool_calls
            .into_iter()
            .map(|c| {
                // argumen rusak tetap diteruskan apa adanya; executor yang menolak
                let arguments = serde_json::from_str(&c.function.arguments)
                    .unwrap_or(Value::String(c.function.arguments));
                ToolInvocation { id: c.id, name: c.function.name, arguments }
            })
            .collect()
    } else {
        Vec::new()
    };
    Ok(ToolRoundReply { text: choice.message.content.unwrap_or_default(), invocations })
}

fn stream_text(data: &str) -> Option<Result<String, ProviderError>> {
    if data == "[DONE]" {
        return None;
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(ProviderError::Decode(e.to_string()))),
    };
    if let Some(msg) = v.pointer("/error/message").and_then(Value::as_str) {
        return Some(Err(ProviderError::Transport(msg.to_string())));
    }
    v.pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(|s| Ok(s.to_string()))
}

impl OpenAiProvider {
    pub fn new(cfg: OpenAiConfig, connect_timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http, cfg })
    }

    fn body(&self, system: &str, messages: &[TurnMessage], tools: &[ToolSpec], stream: bool) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "max_completion_tokens": self.cfg.max_tokens,
            "messages": wire_messages(system, messages),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(wire_tools(tools));
            // final streaming: tools hanya untuk riwayat tool_use, model wajib menjawab teks
            if stream {
                body["tool_choice"] = json!("none");
            }
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let rsp = self.http.post(url).bearer_auth(&self.cfg.api_key).json(body).send().await?;
        check_status(rsp).await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind { ProviderKind::OpenAi }

    async fn submit_tool_round(
        &self,
        system: &str,
        messages: &[TurnMessage],
        tools: &[ToolSpec],
    ) -> Result<ToolRoundReply, ProviderError> {
        let rsp = self.post(&self.body(system, messages, tools, false)).await?;
        let parsed: CompletionResponse = rsp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_reply(parsed)
    }

    async fn submit_streaming_final(
        &self,
        system: &str,
        messages: &[TurnMessage],
        tools: &[ToolSpec],
    ) -> Result<TextStream, ProviderError> {
        let rsp = self.post(&self.body(system, messages, tools, true)).await?;
        let events = sse_data(Box::pin(rsp.bytes_stream()));
        Ok(events
            .filter_map(|item| async move {
                match item {
                    Ok(data) => stream_text(&data),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed())
    }
}
