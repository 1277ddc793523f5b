// ===============================
// src/context.rs (system context untuk setiap chat turn)
// ===============================
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::domain::SpotQuote;
use crate::mutation;
use crate::store::DocumentStore;
use crate::tools::CHAIN_TOOL;
use crate::upstream::SpotSource;

pub const HOLDINGS_KEY: &str = "holdings";
pub const STRATEGY_KEY: &str = "strategy";

/// Tickers mentioned by a holdings document.
/// Accepts `{ "AAPL": {...} }` or `[ { "ticker": "AAPL", ... } ]` (also `symbol`).
pub fn held_tickers(holdings: &Value) -> Vec<String> {
    let mut out: Vec<String> = match holdings {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|it| it.get("ticker").or_else(|| it.get("symbol")).and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    for t in out.iter_mut() {
        *t = t.trim().to_ascii_uppercase();
    }
    out.retain(|t| !t.is_empty());
    out.sort();
    out.dedup();
    out
}

pub fn render(
    holdings: Option<&Value>,
    strategy: Option<&str>,
    quotes: &[SpotQuote],
    today: NaiveDate,
    tools_enabled: bool,
) -> String {
    let mut s = String::from(
        "You are an options trading copilot. You help the user manage a covered-call and \
         cash-secured-put book. You never place orders.\n\n",
    );
    s.push_str(&format!("Today is {} (UTC).\n\n", today.format("%Y-%m-%d (%A)")));

    s.push_str("## Holdings\n");
    match holdings {
        Some(h) => s.push_str(&serde_json::to_string_pretty(h).unwrap_or_else(|_| h.to_string())),
        None => s.push_str("(none recorded)"),
    }
    s.push_str("\n\n## Strategy\n");
    s.push_str(strategy.filter(|t| !t.trim().is_empty()).unwrap_or("(none recorded)"));
    s.push_str("\n\n");

    if !quotes.is_empty() {
        s.push_str("## Spot prices (delayed)\n");
        for q in quotes {
            let chg = if q.prev_close > 0.0 { (q.price / q.prev_close - 1.0) * 100.0 } else { 0.0 };
            s.push_str(&format!("- {}: {:.2} ({:+.2}% vs prev close)\n", q.ticker, q.price, chg));
        }
        s.push('\n');
    }

    if tools_enabled {
        s.push_str(&format!(
            "Use the `{CHAIN_TOOL}` tool to look up live option chains before recommending \
             specific strikes or expiries. Quote bid/ask/mid and IV from tool output only.\n\n"
        ));
    }
    s.push_str(&mutation::protocol_instructions());
    s
}

/// Reads holdings/strategy from the store and spot quotes for held tickers.
/// Every source is best effort: a failure drops that section.
pub async fn build(store: &DocumentStore, spot: &dyn SpotSource, today: NaiveDate, tools_enabled: bool) -> String {
    let holdings = match store.get(HOLDINGS_KEY).await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "holdings unavailable for context");
            None
        }
    };
    let strategy = match store.get(STRATEGY_KEY).await {
        Ok(Some(Value::String(s))) => Some(s),
        Ok(Some(other)) => Some(other.to_string()),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "strategy unavailable for context");
            None
        }
    };

    let tickers = holdings.as_ref().map(held_tickers).unwrap_or_default();
    let quotes: Vec<SpotQuote> = join_all(tickers.iter().map(|t| spot.fetch_spot(t)))
        .await
        .into_iter()
        .filter_map(Result::ok)
        .collect();

    render(holdings.as_ref(), strategy.as_deref(), &quotes, today, tools_enabled)
}
