//! Format auto-detection and cross-routing (spec §4.3). A client
//! occasionally posts a body shaped for one dialect to another dialect's
//! endpoint (most often Messages-shaped bodies landing on
//! `/v1/chat/completions`); this module recognizes the unambiguous signals
//! and decides whether to transparently rewrite-and-redispatch or return a
//! redirect, per the operator's configured action. Ambiguous bodies are
//! left alone — spec §4.3 requires certainty, not a best guess.

use config::AutoDetectFormatAction;
use serde_json::Value;

/// A request body's wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    ChatCompletions,
    Responses,
    Messages,
}

impl Dialect {
    /// The canonical endpoint path for this dialect.
    pub fn canonical_path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Responses => "/v1/responses",
            Self::Messages => "/v1/messages",
        }
    }
}

/// What the auto-detector decided to do about a body that didn't match
/// the endpoint it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reroute {
    /// The body matches the endpoint it arrived on, or the signal was
    /// ambiguous; don't touch it.
    None,
    /// Rewrite the request to `dialect`'s canonical shape and re-dispatch
    /// it internally, returning that response to the client.
    Transparent { dialect: Dialect },
    /// Tell the client to resubmit at `dialect`'s canonical path.
    Redirect { dialect: Dialect },
}

/// Inspect a raw JSON body for the unambiguous dialect signals spec §4.3
/// defines. Returns `None` when no signal fires (a body can simply be a
/// well-formed ChatCompletions request, which has no positive signal of
/// its own — only the other two dialects leave a distinguishing mark).
pub fn detect(body: &Value) -> Option<Dialect> {
    let has_input = body.get("input").is_some();
    let has_messages = body.get("messages").is_some();

    // A `input` field with no `messages` field is unambiguously the
    // Responses API's request shape.
    if has_input && !has_messages {
        return Some(Dialect::Responses);
    }

    if has_messages && looks_like_messages_dialect(body) {
        return Some(Dialect::Messages);
    }

    None
}

/// Tool-use/tool-result content blocks, or a top-level `system` string
/// alongside other Claude-specific fields (`top_k`, `stop_sequences`)
/// that ChatCompletions never uses. A bare top-level `system` with no
/// other Claude signal is ambiguous (plenty of ChatCompletions-adjacent
/// clients send it) and must NOT be treated as a Messages signal on its
/// own.
fn looks_like_messages_dialect(body: &Value) -> bool {
    let messages_have_tool_blocks = body
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|messages| messages.iter().any(message_has_tool_content_block));

    let has_claude_specific_field = body.get("top_k").is_some() || body.get("stop_sequences").is_some();
    let has_system_alongside_claude_field = body.get("system").is_some() && has_claude_specific_field;

    messages_have_tool_blocks || has_system_alongside_claude_field
}

fn message_has_tool_content_block(message: &Value) -> bool {
    let Some(parts) = message.get("content").and_then(Value::as_array) else {
        return false;
    };

    parts.iter().any(|part| {
        matches!(
            part.get("type").and_then(Value::as_str),
            Some("tool_use") | Some("tool_result")
        )
    })
}

/// Decide what to do about a body that arrived at `arrived_at`'s endpoint,
/// given the operator's configured `action`.
pub fn reroute_for(arrived_at: Dialect, body: &Value, action: AutoDetectFormatAction) -> Reroute {
    let Some(detected) = detect(body) else {
        return Reroute::None;
    };

    if detected == arrived_at {
        return Reroute::None;
    }

    match action {
        AutoDetectFormatAction::Transparent => Reroute::Transparent { dialect: detected },
        AutoDetectFormatAction::Redirect => Reroute::Redirect { dialect: detected },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn responses_input_without_messages_is_unambiguous() {
        let body = json!({ "model": "gpt-4o", "input": "hello" });
        assert_eq!(detect(&body), Some(Dialect::Responses));
    }

    #[test]
    fn input_alongside_messages_is_ambiguous() {
        let body = json!({ "model": "gpt-4o", "input": "hello", "messages": [] });
        assert_eq!(detect(&body), None);
    }

    #[test]
    fn tool_use_block_signals_messages_dialect() {
        let body = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "assistant", "content": [{"type": "tool_use", "id": "t1", "name": "x", "input": {}}]}],
        });
        assert_eq!(detect(&body), Some(Dialect::Messages));
    }

    #[test]
    fn top_level_system_with_claude_specific_field_signals_messages_dialect() {
        let body = json!({
            "model": "claude-3-5-sonnet-20241022",
            "system": "be terse",
            "stop_sequences": ["\n"],
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert_eq!(detect(&body), Some(Dialect::Messages));
    }

    #[test]
    fn bare_top_level_system_alone_is_ambiguous_and_not_rerouted() {
        let body = json!({
            "model": "gpt-4o",
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert_eq!(detect(&body), None);
    }

    #[test]
    fn plain_chat_completions_body_has_no_signal() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        });
        assert_eq!(detect(&body), None);
    }

    #[test]
    fn reroute_none_when_dialect_matches_arrival_endpoint() {
        let body = json!({ "model": "gpt-4o", "input": "hello" });
        let reroute = reroute_for(Dialect::Responses, &body, AutoDetectFormatAction::Transparent);
        assert_eq!(reroute, Reroute::None);
    }

    #[test]
    fn reroute_transparent_rewrites_internally() {
        let body = json!({ "model": "gpt-4o", "input": "hello" });
        let reroute = reroute_for(Dialect::ChatCompletions, &body, AutoDetectFormatAction::Transparent);
        assert_eq!(reroute, Reroute::Transparent { dialect: Dialect::Responses });
    }

    #[test]
    fn reroute_redirect_tells_the_client_to_resubmit() {
        let body = json!({ "model": "gpt-4o", "input": "hello" });
        let reroute = reroute_for(Dialect::ChatCompletions, &body, AutoDetectFormatAction::Redirect);
        assert_eq!(reroute, Reroute::Redirect { dialect: Dialect::Responses });
    }
}
