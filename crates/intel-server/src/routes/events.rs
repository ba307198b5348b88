use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use intel_core::orchestrator::RunEvent;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

fn event_name(ev: &RunEvent) -> &'static str {
    match ev {
        RunEvent::RunStarted { .. } => "run_started",
        RunEvent::ModuleUpdated { .. } => "module_updated",
        RunEvent::RunFinished { .. } => "run_finished",
    }
}

/// GET /events: SSE stream of run lifecycle events. Lagged messages are dropped.
pub async fn sse_events(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.orchestrator.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        let ev = msg.ok()?;
        let data = serde_json::to_string(&ev).ok()?;
        Some(Ok::<Event, Infallible>(
            Event::default().event(event_name(&ev)).data(data),
        ))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
