// ===============================
// src/anthropic.rs (Messages API)
// ===============================
//
// - tool round : POST /v1/messages (stream=false), stop_reason == "tool_use"
//                -> blok `tool_use` jadi ToolInvocation
// - final      : POST /v1/messages (stream=true), SSE `content_block_delta`
//                dengan `text_delta`
// - hasil tool dikirim balik sebagai pesan user berisi blok `tool_result`
//

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::{ProviderKind, ToolInvocation, TurnMessage};
use crate::provider::{check_status, sse_data, Provider, ProviderError, TextStream, ToolRoundReply, ToolSpec};

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

pub struct AnthropicProvider {
    http: reqwest::Client,
    cfg: AnthropicConfig,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

fn wire_messages(messages: &[TurnMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m {
            TurnMessage::User(text) => json!({ "role": "user", "content": text }),
            TurnMessage::Assistant(text) => json!({ "role": "assistant", "content": text }),
            TurnMessage::ToolCalls { text, calls } => {
                let mut blocks = Vec::with_capacity(calls.len() + 1);
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                for c in calls {
                    blocks.push(json!({ "type": "tool_use", "id": c.id, "name": c.name, "input": c.arguments }));
                }
                json!({ "role": "assistant", "content": blocks })
            }
            TurnMessage::ToolResults(results) => {
                let blocks: Vec<Value> = results
                    .iter()
                    .map(|r| json!({
                        "type": "tool_result",
                        "tool_use_id": r.invocation_id,
                        "content": r.content,
                        "is_error": r.is_error,
                    }))
                    .collect();
                json!({ "role": "user", "content": blocks })
            }
        })
        .collect()
}

fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
        .collect()
}

fn parse_reply(rsp: MessagesResponse) -> ToolRoundReply {
    let wants_tools = rsp.stop_reason.as_deref() == Some("tool_use");
    let mut reply = ToolRoundReply::default();
    for block in rsp.content {
        match block {
            ContentBlock::Text { text } => reply.text.push_str(&text),
            ContentBlock::ToolUse { id, name, input } if wants_tools => {
                reply.invocations.push(ToolInvocation { id, name, arguments: input })
            }
            _ => {}
        }
    }
    reply
}

// satu payload SSE -> potongan teks (None = event lain, diabaikan)
fn stream_text(data: &str) -> Option<Result<String, ProviderError>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(ProviderError::Decode(e.to_string()))),
    };
    match v.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = v.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            delta.get("text").and_then(Value::as_str).map(|t| Ok(t.to_string()))
        }
        Some("error") => {
            let msg = v.pointer("/error/message").and_then(Value::as_str).unwrap_or("stream error");
            Some(Err(ProviderError::Transport(msg.to_string())))
        }
        _ => None,
    }
}

impl AnthropicProvider {
    pub fn new(cfg: AnthropicConfig, connect_timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http, cfg })
    }

    fn body(&self, system: &str, messages: &[TurnMessage], tools: &[ToolSpec], stream: bool) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            "system": system,
            "messages": wire_messages(messages),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(wire_tools(tools));
            // final streaming: tools hanya untuk riwayat tool_use, model wajib menjawab teks
            if stream {
                body["tool_choice"] = json!({ "type": "none" });
            }
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.cfg.base_url.trim_end_matches('/'));
        let rsp = self
            .http
            .post(url)
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await?;
        check_status(rsp).await
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind { ProviderKind::Anthropic }

    async fn submit_tool_round(
        &self,
        system: &str,
        messages: &[TurnMessage],
        tools: &[ToolSpec],
    ) -> Result<ToolRoundReply, ProviderError> {
        let rsp = self.post(&self.body(system, messages, tools, false)).await?;
        let parsed: MessagesResponse = rsp.json().await.map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parse_reply(parsed))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ToolResult;

    fn provider() -> AnthropicProvider {
        let cfg = AnthropicConfig {
            api_key: "k".into(),
            model: "m".into(),
            base_url: "http://localhost".into(),
            max_tokens: 512,
        };
        AnthropicProvider::new(cfg, Duration::from_secs(1)).unwrap()
    }

    fn chain_spec() -> Vec<ToolSpec> {
        vec![ToolSpec { name: "get_option_chain".into(), description: "chain".into(), parameters: json!({"type": "object"}) }]
    }

    #[test]
    fn final_request_keeps_tools_but_forbids_tool_use() {
        let p = provider();
        let msgs = vec![TurnMessage::User("hi".into())];

        let round = p.body("sys", &msgs, &chain_spec(), false);
        assert_eq!(round["tools"].as_array().map(Vec::len), Some(1));
        assert!(round.get("tool_choice").is_none());

        let final_body = p.body("sys", &msgs, &chain_spec(), true);
        assert_eq!(final_body["stream"], true);
        assert_eq!(final_body["tools"].as_array().map(Vec::len), Some(1));
        assert_eq!(final_body["tool_choice"], json!({"type": "none"}));

        let no_tools = p.body("sys", &msgs, &[], true);
        assert!(no_tools.get("tools").is_none());
        assert!(no_tools.get("tool_choice").is_none());
    }

    #[test]
    fn tool_round_history_maps_to_content_blocks() {
        let msgs = vec![
            TurnMessage::User("puts on XYZ?".into()),
            TurnMessage::ToolCalls {
                text: String::new(),
                calls: vec![ToolInvocation { id: "tu_1".into(), name: "get_option_chain".into(), arguments: json!({"ticker": "XYZ"}) }],
            },
            TurnMessage::ToolResults(vec![ToolResult { invocation_id: "tu_1".into(), content: "[]".into(), is_error: false }]),
        ];
        let wire = wire_messages(&msgs);
        assert_eq!(wire[0], json!({"role": "user", "content": "puts on XYZ?"}));
        assert_eq!(wire[1]["content"].as_array().unwrap().len(), 1);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["content"][0]["input"]["ticker"], "XYZ");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "tu_1");
    }

    #[test]
    fn parses_tool_use_reply() {
        let rsp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [
                {"type": "text", "text": "Checking the chain."},
                {"type": "tool_use", "id": "tu_9", "name": "get_option_chain", "input": {"ticker": "QQQ", "option_type": "puts"}}
            ],
            "stop_reason": "tool_use"
        }))
        .unwrap();
        let reply = parse_reply(rsp);
        assert!(reply.wants_tools());
        assert_eq!(reply.text, "Checking the chain.");
        assert_eq!(reply.invocations[0].id, "tu_9");
    }

    #[test]
    fn end_turn_reply_has_no_invocations() {
        let rsp: MessagesResponse = serde_json::from_value(json!({
            "content": [{"type": "thinking", "thinking": "..."}, {"type": "text", "text": "Done."}],
            "stop_reason": "end_turn"
        }))
        .unwrap();
        let reply = parse_reply(rsp);
        assert!(!reply.wants_tools());
        assert_eq!(reply.text, "Done.");
    }

    #[test]
    fn stream_events_yield_text_deltas_only() {
        assert_eq!(
            stream_text(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#),
            Some(Ok("Hel".to_string()))
        );
        assert_eq!(stream_text(r#"{"type":"message_stop"}"#), None);
        assert_eq!(
            stream_text(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}"#),
            None
        );
        assert!(matches!(
            stream_text(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Some(Err(ProviderError::Transport(m))) if m == "Overloaded"
        ));
    }
}
