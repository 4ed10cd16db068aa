//! Server-Sent Events transport (C5).
//!
//! Grounded on the teacher's `api/sse.rs` (`Sse::new(...).keep_alive(...)`,
//! one `Event::default().event(type).data(json)` per record). The source
//! stream here is a per-invocation channel from the Coordinator rather than
//! a shared `broadcast::Receiver`, since each `/chat/stream` call is its own
//! agent invocation, not a shared room.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentEvent;

/// Fires `token` when the wrapped stream is dropped without reaching
/// exhaustion — the signal axum gives when the client disconnects before
/// `done` is produced (SPEC_FULL.md 4.5, "Drain on cancel").
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub fn cancel_on_drop(
    events: impl Stream<Item = AgentEvent> + Send + 'static,
    token: CancellationToken,
) -> impl Stream<Item = AgentEvent> + Send + 'static {
    async_stream::stream! {
        let _guard = CancelOnDrop(token);
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            yield event;
        }
    }
}

/// Wrap the Coordinator's event stream as an `axum` SSE response. Headers
/// disabling intermediary buffering (SPEC_FULL.md 4.5) are set by the
/// handler that returns this `Sse` value; `axum::response::sse::Sse`
/// already sets `Content-Type: text/event-stream`.
pub fn sse_stream(
    events: impl Stream<Item = AgentEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mapped = events.map(|event| Ok(agent_event_to_axum(&event)));

    Sse::new(mapped).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn agent_event_to_axum(event: &AgentEvent) -> Event {
    let (event_type, data) = match event {
        AgentEvent::Metadata { .. } => ("metadata", serde_json::to_value(event)),
        AgentEvent::AgentUpdated { .. } => ("agent_updated", serde_json::to_value(event)),
        AgentEvent::Data { .. } => ("data", serde_json::to_value(event)),
        AgentEvent::Done { .. } => ("done", serde_json::to_value(event)),
        AgentEvent::Error { .. } => ("error", serde_json::to_value(event)),
    };
    let data = data.unwrap_or(serde_json::Value::Null);
    Event::default().event(event_type).data(data.to_string())
}
