//! Renders an adaptor's normalized chunk stream into one dialect's SSE
//! wire framing for the client. Termination/billing bookkeeping lives in
//! `stream::StreamRelay`; this is purely the presentation layer on top of
//! it, buffering one chunk of lookahead so the dialect's closing frames
//! (`[DONE]`, `message_stop`, `response.completed`) are emitted on
//! whichever chunk turns out to be last, not a guess made up front.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde_json::json;

use crate::adaptor::ChunkStream;
use crate::encode;
use crate::error::RelayError;
use crate::normalized::NormalizedChunk;

/// Which vendor-facing SSE framing a chunk stream renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDialect {
    Chat,
    Messages,
    Responses,
}

/// Adapts one `ChunkStream` into `Event`s for `axum::response::Sse`.
pub struct DialectStream {
    inner: ChunkStream,
    dialect: StreamDialect,
    created: i64,
    queue: VecDeque<Event>,
    pending: Option<NormalizedChunk>,
    emitted_any: bool,
    finished: bool,
}

impl DialectStream {
    pub fn new(inner: ChunkStream, dialect: StreamDialect, created: i64) -> Self {
        Self {
            inner,
            dialect,
            created,
            queue: VecDeque::new(),
            pending: None,
            emitted_any: false,
            finished: false,
        }
    }

    fn render(&mut self, chunk: NormalizedChunk, is_first: bool, is_last: bool) {
        match self.dialect {
            StreamDialect::Chat => {
                let payload = encode::chat_chunk_from_normalized(chunk, self.created, is_first);
                self.queue.push_back(sse_json(&payload));

                if is_last {
                    self.queue.push_back(Event::default().data("[DONE]"));
                }
            }
            StreamDialect::Messages => {
                for (event_name, data) in encode::messages_events_from_chunk(&chunk, is_first, is_last) {
                    self.queue.push_back(Event::default().event(event_name).data(data.to_string()));
                }
            }
            StreamDialect::Responses => {
                for data in encode::responses_events_from_chunk(&chunk, is_first, is_last) {
                    self.queue.push_back(sse_json(&data));
                }
            }
        }
    }

    fn render_error(&mut self, error: &RelayError) {
        let event = match self.dialect {
            StreamDialect::Chat => Event::default().data(
                json!({"error": {"message": error.client_message(), "type": error.error_type()}}).to_string(),
            ),
            StreamDialect::Messages => Event::default().event("error").data(
                json!({
                    "type": "error",
                    "error": {"type": error.error_type(), "message": error.client_message()},
                })
                .to_string(),
            ),
            StreamDialect::Responses => Event::default().data(
                json!({
                    "type": "response.failed",
                    "error": {"type": error.error_type(), "message": error.client_message()},
                })
                .to_string(),
            ),
        };

        self.queue.push_back(event);
    }
}

fn sse_json(value: &impl serde::Serialize) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()))
}

impl Stream for DialectStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            if this.finished {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    if let Some(previous) = this.pending.replace(chunk) {
                        let is_first = !this.emitted_any;
                        this.emitted_any = true;
                        this.render(previous, is_first, false);
                    }
                    continue;
                }
                Poll::Ready(Some(Err(err))) => {
                    this.finished = true;
                    this.pending = None;
                    this.render_error(&err);
                    continue;
                }
                Poll::Ready(None) => {
                    this.finished = true;

                    if let Some(last) = this.pending.take() {
                        let is_first = !this.emitted_any;
                        this.render(last, is_first, true);
                    }
                    continue;
                }
            }
        }
    }
}
