//! SSE transport: one long-lived `text/event-stream` response per client.
//!
//! Each connection registers a subscriber with the hub, emits one snapshot
//! of current state as its first frame, then relays every broadcast until
//! the hub closes the queue or the client goes away. Dropping the response
//! body drops the subscriber, which deregisters it — a disconnect never
//! touches the hub beyond that.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, StreamExt};

use crate::server::AppState;
use crate::wire::Envelope;

/// `GET /events/state`
pub async fn state_events(State(app): State<AppState>) -> Response {
    let subscriber = match app.hub.register().await {
        Ok(subscriber) => subscriber,
        Err(error) => {
            // streaming is unavailable; report it before any frame is owed
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "message": error.to_string() })),
            )
                .into_response();
        }
    };

    // Snapshot taken at subscription time: the client never sees a gap
    // between "connected" and "has initial state".
    let initial = match Envelope::state_change(&app.provider.get_state())
        .and_then(|envelope| serde_json::to_string(&envelope))
    {
        Ok(frame) => frame,
        Err(error) => {
            tracing::error!(%error, "initial snapshot not serializable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": "failed to render state" })),
            )
                .into_response();
        }
    };

    let frames = stream::once(async move { Ok::<_, Infallible>(Event::default().data(initial)) })
        .chain(subscriber.map(|frame| Ok(Event::default().data(frame))));

    let mut response = Sse::new(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
