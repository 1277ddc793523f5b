// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind { Call, Put }
impl OptionKind {
    pub fn code(&self) -> char { match self { OptionKind::Call => 'C', OptionKind::Put => 'P' } }
    pub fn from_code(c: char) -> Option<Self> {
        match c { 'C' => Some(OptionKind::Call), 'P' => Some(OptionKind::Put), _ => None }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "c" | "call" | "calls" => Some(OptionKind::Call),
            "p" | "put" | "puts" => Some(OptionKind::Put),
            _ => None,
        }
    }
}

/// Satu instrumen opsi seperti yang dilaporkan upstream.
/// Field names follow the upstream chain document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContract {
    #[serde(rename = "option")]
    pub symbol: String,
    #[serde(default, deserialize_with = "null_as_zero")] pub bid: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub ask: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub iv: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub open_interest: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub volume: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub delta: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub last_trade_price: f64,
    #[serde(default, deserialize_with = "null_as_zero")] pub prev_day_close: f64,
}
// upstream kadang kirim null untuk kontrak tanpa quote
fn null_as_zero<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(0.0))
}

impl RawContract {
    pub fn mid(&self) -> f64 { (self.bid + self.ask) / 2.0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedContract { pub underlying: String, pub expiry: NaiveDate, pub kind: OptionKind, pub strike: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredContract {
    pub symbol: String,
    pub kind: OptionKind,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub dte: i64,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub iv: f64,
    pub delta: f64,
    pub volume: f64,
    pub open_interest: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionMid { pub symbol: String, pub bid: f64, pub ask: f64, pub mid: f64, pub iv: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermStructurePoint { pub dte: i64, pub iv: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotQuote { pub ticker: String, pub price: f64, pub prev_close: f64 }

/// Whole calendar days from `today` to `expiry` (negative once expired).
pub fn days_to_expiry(expiry: NaiveDate, today: NaiveDate) -> i64 {
    (expiry - today).num_days()
}

/// Sumber waktu; diganti FixedClock di test.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn today(&self) -> NaiveDate { self.now().date_naive() }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

// ---- Conversation ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role { User, Assistant }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage { pub role: Role, pub content: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind { Anthropic, OpenAi }
impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "openai" | "gpt" | "chatgpt" => Some(ProviderKind::OpenAi),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { ProviderKind::Anthropic => "anthropic", ProviderKind::OpenAi => "openai" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system_context: String,
    pub provider: ProviderKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation { pub id: String, pub name: String, pub arguments: serde_json::Value }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult { pub invocation_id: String, pub content: String, pub is_error: bool }

/// Working message list for one turn, provider-agnostic.
/// Tiap provider menerjemahkan ini ke format wire masing-masing.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnMessage {
    User(String),
    Assistant(String),
    ToolCalls { text: String, calls: Vec<ToolInvocation> },
    ToolResults(Vec<ToolResult>),
}

impl From<&ChatMessage> for TurnMessage {
    fn from(m: &ChatMessage) -> Self {
        match m.role {
            Role::User => TurnMessage::User(m.content.clone()),
            Role::Assistant => TurnMessage::Assistant(m.content.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationTarget { Holdings, Strategy }
impl MutationTarget {
    pub fn key(&self) -> &'static str {
        match self { MutationTarget::Holdings => "holdings", MutationTarget::Strategy => "strategy" }
    }
}

/// Payload `{ "target": "holdings" | "strategy", "content": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", content = "content", rename_all = "lowercase")]
pub enum MutationCommand {
    Holdings(serde_json::Value),
    Strategy(String),
}
impl MutationCommand {
    pub fn target(&self) -> MutationTarget {
        match self { MutationCommand::Holdings(_) => MutationTarget::Holdings, MutationCommand::Strategy(_) => MutationTarget::Strategy }
    }
    pub fn content_value(&self) -> serde_json::Value {
        match self {
            MutationCommand::Holdings(v) => v.clone(),
            MutationCommand::Strategy(s) => serde_json::Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Text { delta: String },
    ToolCall { id: String, name: String, arguments: serde_json::Value },
    Error { message: String },
    Done { text: String, mutation: Option<MutationCommand> },
}
impl ChatEvent {
    pub fn is_terminal(&self) -> bool { matches!(self, ChatEvent::Done { .. }) }
}

/// Audit trail record (JSONL recorder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Chat { turn_id: String, event: ChatEvent },
    MutationApplied { target: MutationTarget },
    Note(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutation_payload_shape() {
        let cmd: MutationCommand =
            serde_json::from_value(json!({"target": "strategy", "content": "sell puts"})).unwrap();
        assert_eq!(cmd, MutationCommand::Strategy("sell puts".into()));
        assert_eq!(cmd.target(), MutationTarget::Strategy);

        let cmd: MutationCommand =
            serde_json::from_value(json!({"target": "holdings", "content": {"AAPL": 10}})).unwrap();
        assert_eq!(cmd.target().key(), "holdings");
    }

    #[test]
    fn raw_contract_defaults_missing_numbers() {
        let rc: RawContract = serde_json::from_value(json!({"option": "XYZ250117C00100000", "bid": 1.5})).unwrap();
        assert_eq!(rc.ask, 0.0);
        assert_eq!(rc.mid(), 0.75);

        let rc: RawContract = serde_json::from_value(json!({"option": "XYZ250117C00100000", "iv": null})).unwrap();
        assert_eq!(rc.iv, 0.0);
    }

    #[test]
    fn dte_counts_calendar_days() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 15).unwrap();
        assert_eq!(days_to_expiry(NaiveDate::from_ymd_opt(2026, 11, 14).unwrap(), today), 30);
        assert_eq!(days_to_expiry(NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(), today), -1);
    }
}
