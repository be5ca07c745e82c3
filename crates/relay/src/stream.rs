//! SSE stream relay (spec §4.4): an explicit state machine that tracks a
//! streamed response through `waiting_headers -> streaming -> terminating
//! -> closed` and detects the handful of shapes an upstream uses to signal
//! "this is the last event" before its TCP connection actually closes.

use serde_json::Value;

/// Where a streamed response currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Upstream connection established, first bytes not yet seen.
    WaitingHeaders,
    /// Events are flowing and none has signaled termination yet.
    Streaming,
    /// A terminal event was observed; the relay drains any buffered
    /// trailing bytes and then closes.
    Terminating,
    /// No more events will be forwarded to the client.
    Closed,
}

/// Drives one streamed request through its lifecycle and billing
/// checkpoints. Termination is detected from event *content*, not solely
/// from the upstream connection closing, because some vendors keep the
/// connection open briefly after their logical last event.
pub struct StreamRelay {
    state: StreamState,
    max_buffered_bytes: usize,
    buffered_bytes: usize,
    events_forwarded: u64,
}

/// Why a stream ended, so the controller knows whether to bill through
/// the last checkpoint (spec §8: "mid-stream disconnect bills through
/// last flush checkpoint, no refund beyond that") or treat it as a clean
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A terminal event was observed in-band.
    CompletedNormally,
    /// The upstream connection closed (or errored) before any terminal
    /// event was observed.
    DisconnectedMidStream,
    /// The configured byte budget was exceeded; the relay truncated the
    /// stream rather than buffering unboundedly.
    TruncatedBySizeCap,
    /// The client disconnected or the request was cancelled.
    Cancelled,
}

impl StreamRelay {
    /// `max_buffered_bytes` bounds how much of a single SSE frame (the
    /// data between two blank lines) the relay will accumulate before
    /// giving up on it and truncating, protecting against a vendor that
    /// never sends a frame boundary.
    pub fn new(max_buffered_bytes: usize) -> Self {
        Self {
            state: StreamState::WaitingHeaders,
            max_buffered_bytes,
            buffered_bytes: 0,
            events_forwarded: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn events_forwarded(&self) -> u64 {
        self.events_forwarded
    }

    /// Upstream responded and the relay is about to start forwarding
    /// events.
    pub fn on_headers_received(&mut self) {
        debug_assert_eq!(self.state, StreamState::WaitingHeaders);
        self.state = StreamState::Streaming;
    }

    /// Feed one SSE event's raw `data:` payload (and optional `event:`
    /// field, when the dialect uses named events rather than a `type`
    /// field inside the JSON body). Returns `true` if this event is the
    /// stream's terminal event, in which case the caller should forward it
    /// and then call [`Self::finish`].
    pub fn observe_event(&mut self, event_name: Option<&str>, data: &str) -> bool {
        if self.state == StreamState::Closed {
            return false;
        }

        self.buffered_bytes += data.len();
        self.events_forwarded += 1;

        if self.buffered_bytes > self.max_buffered_bytes {
            self.state = StreamState::Terminating;
            return true;
        }

        if is_terminal_event(event_name, data) {
            self.state = StreamState::Terminating;
            true
        } else {
            false
        }
    }

    /// Close the relay after the terminal event (or an upstream
    /// disconnect/error/cancellation) has been handled, returning how it
    /// ended.
    pub fn finish(&mut self, upstream_closed_cleanly: bool) -> StreamOutcome {
        let outcome = match self.state {
            StreamState::Terminating if self.buffered_bytes > self.max_buffered_bytes => StreamOutcome::TruncatedBySizeCap,
            StreamState::Terminating => StreamOutcome::CompletedNormally,
            _ if upstream_closed_cleanly => StreamOutcome::CompletedNormally,
            _ => StreamOutcome::DisconnectedMidStream,
        };

        self.state = StreamState::Closed;
        outcome
    }

    /// The client disconnected or the request was cancelled before a
    /// terminal event arrived.
    pub fn cancel(&mut self) -> StreamOutcome {
        self.state = StreamState::Closed;
        StreamOutcome::Cancelled
    }
}

/// Literal `[DONE]` (OpenAI's marker), a named `event: response.completed`
/// field (Responses API dialect), or a `type`/`status` field inside the
/// JSON payload matching one of the known terminal shapes (spec §4.4):
/// `type` in `{"response.completed", "response.cancelled", "response.error",
/// "done"}`, `response.status == "completed"`, or `delta.status ==
/// "completed"`.
fn is_terminal_event(event_name: Option<&str>, data: &str) -> bool {
    if data.trim() == "[DONE]" {
        return true;
    }

    if matches!(event_name, Some("response.completed")) {
        return true;
    }

    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return false;
    };

    if let Some(type_field) = value.get("type").and_then(Value::as_str) {
        if matches!(
            type_field,
            "response.completed" | "response.cancelled" | "response.error" | "done"
        ) {
            return true;
        }
    }

    let status_is_completed = |field: &str| {
        value
            .get(field)
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str)
            .is_some_and(|status| status == "completed")
    };

    status_is_completed("response") || status_is_completed("delta")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_openai_done_marker() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        assert!(relay.observe_event(None, "[DONE]"));
    }

    #[test]
    fn detects_named_response_completed_event() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        assert!(relay.observe_event(Some("response.completed"), r#"{"id":"resp_1"}"#));
    }

    #[test]
    fn detects_type_field_variants() {
        for kind in ["response.completed", "response.cancelled", "response.error", "done"] {
            let mut relay = StreamRelay::new(1 << 20);
            relay.on_headers_received();
            let payload = format!(r#"{{"type":"{kind}"}}"#);
            assert!(relay.observe_event(None, &payload), "expected {kind} to terminate");
        }
    }

    #[test]
    fn detects_nested_status_completed() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        assert!(relay.observe_event(None, r#"{"response":{"status":"completed"}}"#));

        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        assert!(relay.observe_event(None, r#"{"delta":{"status":"completed"}}"#));
    }

    #[test]
    fn ordinary_chunks_are_not_terminal() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        assert!(!relay.observe_event(None, r#"{"choices":[{"delta":{"content":"hi"}}]}"#));
        assert_eq!(relay.state(), StreamState::Streaming);
    }

    #[test]
    fn finish_after_terminal_event_is_a_clean_completion() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        relay.observe_event(None, "[DONE]");
        assert_eq!(relay.finish(true), StreamOutcome::CompletedNormally);
        assert_eq!(relay.state(), StreamState::Closed);
    }

    #[test]
    fn finish_without_terminal_event_is_a_disconnect() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        relay.observe_event(None, r#"{"choices":[{"delta":{"content":"partial"}}]}"#);
        assert_eq!(relay.finish(false), StreamOutcome::DisconnectedMidStream);
    }

    #[test]
    fn oversized_frame_is_truncated_not_buffered_forever() {
        let mut relay = StreamRelay::new(8);
        relay.on_headers_received();
        assert!(relay.observe_event(None, "this payload is definitely over the cap"));
        assert_eq!(relay.finish(false), StreamOutcome::TruncatedBySizeCap);
    }

    #[test]
    fn cancel_reports_cancelled_regardless_of_prior_state() {
        let mut relay = StreamRelay::new(1 << 20);
        relay.on_headers_received();
        relay.observe_event(None, r#"{"choices":[]}"#);
        assert_eq!(relay.cancel(), StreamOutcome::Cancelled);
    }
}
