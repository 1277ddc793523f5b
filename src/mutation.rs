// ===============================
// src/mutation.rs (blok "apply change" di dalam teks model)
// ===============================
//
// Protokol:
//   <<<MUTATION>>>
//   {"target": "holdings" | "strategy", "content": <object | string>}
//   <<<END_MUTATION>>>
//
// - Hanya blok pertama yang dikenali.
// - Parse gagal -> fail open: teks asli dikembalikan utuh (termasuk blok mentah),
//   tanpa command. Dicatat di log + metric, bukan error ke user.
//

use tracing::warn;

use crate::domain::MutationCommand;
use crate::metrics::MUTATIONS;

pub const OPEN_DELIM: &str = "<<<MUTATION>>>";
pub const CLOSE_DELIM: &str = "<<<END_MUTATION>>>";

/// Instructions appended to the system context so the model knows the format.
pub fn protocol_instructions() -> String {
    format!(
        "To propose a change to the user's holdings or strategy, append exactly one block:\n\
         {OPEN_DELIM}\n\
         {{\"target\": \"holdings\", \"content\": <full holdings JSON object or array>}}\n\
         {CLOSE_DELIM}\n\
         or with \"target\": \"strategy\" and \"content\" as the full new strategy text (a JSON string).\n\
         The block is hidden from the user and applied only after they confirm."
    )
}

// model sering membungkus JSON dengan ```json ... ```
fn strip_code_fence(payload: &str) -> &str {
    let p = payload.trim();
    let Some(rest) = p.strip_prefix("```") else { return p };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Shape check shared by extraction and the apply endpoint.
pub fn validate(cmd: &MutationCommand) -> Result<(), String> {
    match cmd {
        MutationCommand::Holdings(v) if !(v.is_object() || v.is_array()) => {
            Err("holdings content must be a JSON object or array".into())
        }
        _ => Ok(()),
    }
}

fn parse_payload(payload: &str) -> Result<MutationCommand, String> {
    let cmd: MutationCommand = serde_json::from_str(strip_code_fence(payload)).map_err(|e| e.to_string())?;
    validate(&cmd)?;
    Ok(cmd)
}

// blok setelah blok pertama tidak dipakai, tapi tetap tidak boleh tampil ke user
fn strip_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN_DELIM) {
        out.push_str(rest[..start].trim_end());
        let body = &rest[start + OPEN_DELIM.len()..];
        match body.find(CLOSE_DELIM) {
            Some(end) => rest = body[end + CLOSE_DELIM.len()..].trim_start(),
            None => return out,
        }
        if !rest.is_empty() && !out.is_empty() {
            out.push_str("\n\n");
        }
    }
    out.push_str(rest);
    out
}

/// Split `text` into the user-visible text and the embedded command, if any.
pub fn extract(text: &str) -> (String, Option<MutationCommand>) {
    let Some(start) = text.find(OPEN_DELIM) else {
        MUTATIONS.with_label_values(&["absent"]).inc();
        return (text.to_string(), None);
    };
    let body_start = start + OPEN_DELIM.len();
    let Some(body_len) = text[body_start..].find(CLOSE_DELIM) else {
        MUTATIONS.with_label_values(&["failed"]).inc();
        warn!(len = text.len(), "mutation block without closing delimiter, keeping raw text");
        return (text.to_string(), None);
    };
    let payload = &text[body_start..body_start + body_len];

    match parse_payload(payload) {
        Ok(cmd) => {
            MUTATIONS.with_label_values(&["parsed"]).inc();
            let before = text[..start].trim_end();
            let rest = strip_blocks(&text[body_start + body_len + CLOSE_DELIM.len()..]);
            let after = rest.trim_start();
            let display = match (before.is_empty(), after.is_empty()) {
                (false, false) => format!("{before}\n\n{after}"),
                _ => format!("{before}{after}"),
            };
            (display.trim_end().to_string(), Some(cmd))
        }
        Err(e) => {
            MUTATIONS.with_label_values(&["failed"]).inc();
            warn!(payload_len = payload.len(), error = %e, "mutation payload rejected, keeping raw text");
            (text.to_string(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MutationTarget;
    use serde_json::json;

    #[test]
    fn extracts_holdings_and_hides_block() {
        let text = "I added 5 shares of AAPL.\n<<<MUTATION>>>\n{\"target\": \"holdings\", \"content\": {\"AAPL\": {\"shares\": 15}}}\n<<<END_MUTATION>>>\n";
        let (display, cmd) = extract(text);
        assert_eq!(display, "I added 5 shares of AAPL.");
        let cmd = cmd.unwrap();
        assert_eq!(cmd.target(), MutationTarget::Holdings);
        assert_eq!(cmd.content_value(), json!({"AAPL": {"shares": 15}}));
    }

    #[test]
    fn strategy_block_in_the_middle() {
        let text = "Updated.\n<<<MUTATION>>>```json\n{\"target\":\"strategy\",\"content\":\"Wheel on QQQ\"}\n```<<<END_MUTATION>>>\nAnything else?";
        let (display, cmd) = extract(text);
        assert_eq!(display, "Updated.\n\nAnything else?");
        assert_eq!(cmd, Some(MutationCommand::Strategy("Wheel on QQQ".into())));
    }

    #[test]
    fn no_delimiters_returns_text_unchanged() {
        let text = "  Just prose, no change.  ";
        let (display, cmd) = extract(text);
        assert_eq!(display, text);
        assert!(cmd.is_none());
    }

    #[test]
    fn malformed_payload_fails_open_with_raw_text() {
        for text in [
            "x <<<MUTATION>>>{not json}<<<END_MUTATION>>> y",
            "x <<<MUTATION>>>{\"target\":\"portfolio\",\"content\":{}}<<<END_MUTATION>>>",
            "x <<<MUTATION>>>{\"target\":\"holdings\",\"content\":\"AAPL 10\"}<<<END_MUTATION>>>",
            "x <<<MUTATION>>>{\"target\":\"strategy\",\"content\":{\"a\":1}}<<<END_MUTATION>>>",
            "x <<<MUTATION>>>{\"target\":\"strategy\",\"content\":\"unterminated\"}",
        ] {
            let (display, cmd) = extract(text);
            assert_eq!(display, text);
            assert!(cmd.is_none(), "{text}");
        }
    }

    #[test]
    fn only_first_block_is_recognised_and_later_blocks_are_hidden() {
        let text = "<<<MUTATION>>>{\"target\":\"strategy\",\"content\":\"one\"}<<<END_MUTATION>>>\n<<<MUTATION>>>{\"target\":\"strategy\",\"content\":\"two\"}<<<END_MUTATION>>>";
        let (display, cmd) = extract(text);
        assert_eq!(cmd, Some(MutationCommand::Strategy("one".into())));
        assert!(!display.contains("two"));
        assert!(!display.contains(OPEN_DELIM));

        let text = "ok\n<<<MUTATION>>>{\"target\":\"strategy\",\"content\":\"one\"}<<<END_MUTATION>>>\nmiddle\n<<<MUTATION>>>{\"target\":\"strategy\",\"content\":\"two\"}<<<END_MUTATION>>>\nbye\n<<<MUTATION>>>{dangling";
        let (display, cmd) = extract(text);
        assert_eq!(cmd, Some(MutationCommand::Strategy("one".into())));
        assert_eq!(display, "ok\n\nmiddle\n\nbye");
    }
}
