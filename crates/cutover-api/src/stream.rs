//! Live deployment event stream over server-sent events.
//!
//! Each record carries the event id as the SSE `id` and the event as JSON
//! `data`. Idle periods produce comment keep-alives. The stream ends on any
//! tail error; clients reconnect with `Last-Event-ID` (or `since_id`) set to
//! the last id they saw.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Deserialize;
use tracing::{debug, warn};

use cutover_core::EventId;
use cutover_state::TailItem;

use crate::ApiState;
use crate::handlers::{error_response, parse_deployment_id, state_error};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub since_id: Option<EventId>,
}

/// Resume cursor: `Last-Event-ID` wins over the query parameter.
fn resume_cursor(headers: &HeaderMap, query: &StreamQuery) -> EventId {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(query.since_id)
        .unwrap_or(0)
}

/// GET /api/v1/deployments/{id}/events
pub async fn stream_deployment_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let id = match parse_deployment_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = state.repo.get(&id) {
        return state_error(&e);
    }

    let since_id = resume_cursor(&headers, &query);
    let tail = match state.log.tail(id, since_id, state.keepalive) {
        Ok(tail) => tail,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    debug!(deployment = %id, since_id, "event stream opened");

    let items = Box::pin(tail.into_stream());
    let events = stream::unfold(items, move |mut items| async move {
        match items.next().await? {
            Ok(TailItem::Event(event)) => match serde_json::to_string(&event) {
                Ok(json) => {
                    let record = Event::default().id(event.id.to_string()).data(json);
                    Some((Ok::<_, Infallible>(record), items))
                }
                Err(e) => {
                    warn!(deployment = %id, event_id = event.id, error = %e, "event encode failed");
                    None
                }
            },
            Ok(TailItem::KeepAlive) => Some((Ok(Event::default().comment("keepalive")), items)),
            Err(e) => {
                warn!(deployment = %id, error = %e, "event stream ended");
                None
            }
        }
    });

    Sse::new(events).into_response()
}
