// ===============================
// src/orchestrator.rs (satu chat turn, provider-agnostic)
// ===============================
//
// State per turn:  ToolRound (0..max) -> FinalStreaming -> Done
//
// - Tanpa tool executor: langsung FinalStreaming.
// - ToolRound: request non-streaming supaya keputusan tool_use bisa dibaca utuh.
//   Tidak ada tool_use -> keluar loop lebih awal. Invocation dalam satu ronde
//   dijalankan paralel; ronde-ronde berikutnya berurutan.
// - Tool gagal -> hasil teks "Error: ..." dikirim balik ke model, turn lanjut.
// - Setelah loop (habis / keluar awal): satu request streaming, teks diteruskan
//   sebagai ChatEvent::Text, lalu tepat satu ChatEvent::Done.
// - Caller drop receiver -> task berhenti, request upstream yang jalan ikut batal.
//

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TurnLimits;
use crate::domain::{ChatEvent, ConversationTurn, ToolInvocation, ToolResult, TurnMessage};
use crate::metrics::{TOOL_CALLS, TOOL_ROUNDS, TURNS};
use crate::mutation;
use crate::provider::{Provider, ProviderError};
use crate::tools::{ToolError, ToolExecutor};

const EVENT_BUFFER: usize = 256;

/// Gate untuk delta streaming: teks mulai dari OPEN_DELIM tidak pernah diteruskan
/// ke client. Ekor yang bisa jadi awal delimiter ditahan sampai chunk berikutnya.
#[derive(Default)]
struct StreamGate {
    held: String,
    closed: bool,
}

impl StreamGate {
    fn push(&mut self, delta: &str) -> Option<String> {
        if self.closed {
            return None;
        }
        self.held.push_str(delta);
        if let Some(pos) = self.held.find(mutation::OPEN_DELIM) {
            self.closed = true;
            let visible = self.held[..pos].to_string();
            self.held.clear();
            return (!visible.is_empty()).then_some(visible);
        }
        // delimiter ASCII -> panjang suffix selalu di char boundary
        let keep = (1..mutation::OPEN_DELIM.len())
            .rev()
            .find(|&k| self.held.ends_with(&mutation::OPEN_DELIM[..k]))
            .unwrap_or(0);
        let cut = self.held.len() - keep;
        if cut == 0 {
            return None;
        }
        let visible: String = self.held.drain(..cut).collect();
        Some(visible)
    }

    fn finish(&mut self) -> Option<String> {
        if self.closed || self.held.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.held))
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    timeout(deadline, fut).await.unwrap_or(Err(ProviderError::Timeout))
}

async fn execute_one(exec: &dyn ToolExecutor, inv: &ToolInvocation, deadline: Duration) -> ToolResult {
    let res = match timeout(deadline, exec.execute(inv)).await {
        Ok(r) => r,
        Err(_) => Err(ToolError::Timeout),
    };
    match res {
        Ok(content) => {
            TOOL_CALLS.with_label_values(&[&inv.name, "ok"]).inc();
            ToolResult { invocation_id: inv.id.clone(), content, is_error: false }
        }
        Err(e) => {
            TOOL_CALLS.with_label_values(&[&inv.name, "error"]).inc();
            warn!(tool = %inv.name, error = %e, "tool invocation failed, returning error to model");
            ToolResult { invocation_id: inv.id.clone(), content: format!("Error: {e}"), is_error: true }
        }
    }
}

async fn drive(
    turn: &ConversationTurn,
    provider: &dyn Provider,
    tools: Option<&dyn ToolExecutor>,
    limits: &TurnLimits,
    tx: &mpsc::Sender<ChatEvent>,
    text: &mut String,
) -> Result<(), ProviderError> {
    let system = turn.system_context.as_str();
    let mut messages: Vec<TurnMessage> = turn.messages.iter().map(TurnMessage::from).collect();
    let specs = tools.map(|t| t.specs()).unwrap_or_default();

    let mut rounds = 0usize;
    if let Some(exec) = tools {
        while rounds < limits.max_tool_rounds {
            let reply = with_deadline(limits.provider_timeout, provider.submit_tool_round(system, &messages, &specs)).await?;
            if !reply.wants_tools() {
                break;
            }
            rounds += 1;
            debug!(round = rounds, invocations = reply.invocations.len(), "tool round");

            for inv in &reply.invocations {
                let _ = tx
                    .send(ChatEvent::ToolCall { id: inv.id.clone(), name: inv.name.clone(), arguments: inv.arguments.clone() })
                    .await;
            }
            let results = join_all(reply.invocations.iter().map(|inv| execute_one(exec, inv, limits.tool_timeout))).await;

            messages.push(TurnMessage::ToolCalls { text: reply.text, calls: reply.invocations });
            messages.push(TurnMessage::ToolResults(results));
        }
        if rounds == limits.max_tool_rounds {
            warn!(rounds, "tool round bound reached, forcing final answer");
        }
    }
    TOOL_ROUNDS.observe(rounds as f64);

    let mut stream =
        with_deadline(limits.provider_timeout, provider.submit_streaming_final(system, &messages, &specs)).await?;
    let mut gate = StreamGate::default();
    loop {
        // deadline per chunk (idle), bukan untuk seluruh stream
        match timeout(limits.provider_timeout, stream.next()).await {
            Err(_) => return Err(ProviderError::Timeout),
            Ok(None) => {
                if let Some(delta) = gate.finish() {
                    let _ = tx.send(ChatEvent::Text { delta }).await;
                }
                return Ok(());
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(delta))) => {
                text.push_str(&delta);
                if let Some(visible) = gate.push(&delta) {
                    let _ = tx.send(ChatEvent::Text { delta: visible }).await;
                }
            }
        }
    }
}

/// Runs one conversation turn in a background task and returns its event stream.
/// The stream always ends with exactly one [`ChatEvent::Done`] unless the caller
/// drops the receiver first, which cancels the turn.
pub fn run_turn(
    turn: ConversationTurn,
    provider: Arc<dyn Provider>,
    tools: Option<Arc<dyn ToolExecutor>>,
    limits: TurnLimits,
) -> mpsc::Receiver<ChatEvent> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    tokio::spawn(async move {
        let provider_name = provider.kind().as_str();
        let mut text = String::new();

        let res = tokio::select! {
            _ = tx.closed() => {
                TURNS.with_label_values(&[provider_name, "cancelled"]).inc();
                debug!(provider = provider_name, "turn abandoned by caller");
                return;
            }
            res = drive(&turn, provider.as_ref(), tools.as_deref(), &limits, &tx, &mut text) => res,
        };

        let done = match res {
            Ok(()) => {
                TURNS.with_label_values(&[provider_name, "ok"]).inc();
                let (shown, mutation) = mutation::extract(&text);
                let chars = shown.len();
                info!(provider = provider_name, chars, mutation = mutation.is_some(), "turn complete");
                ChatEvent::Done { text: shown, mutation }
            }
            Err(e) => {
                TURNS.with_label_values(&[provider_name, "error"]).inc();
                warn!(provider = provider_name, error = %e, "turn failed");
                let _ = tx.send(ChatEvent::Error { message: e.to_string() }).await;
                // blok mutation yang terpotong tidak ikut ditampilkan
                let partial = match text.find(mutation::OPEN_DELIM) {
                    Some(pos) => text[..pos].trim_end().to_string(),
                    None => text,
                };
                ChatEvent::Done { text: partial, mutation: None }
            }
        };
        let _ = tx.send(done).await;
    });

    rx
}
