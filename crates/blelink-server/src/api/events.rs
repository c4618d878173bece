//! Recent observer events.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::state::{EventRecord, SharedState, EVENT_CAPACITY};

/// Query parameters for the event log.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Most recent records to return; defaults to all kept records.
    pub limit: Option<usize>,
    /// Only records for this address.
    pub address: Option<String>,
}

/// Event log response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EventsResponse {
    /// Records, oldest first.
    pub events: Vec<EventRecord>,
}

/// List recent events.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "events",
    operation_id = "listEvents",
    summary = "List recent events",
    description = "Returns the most recent connection, adapter and request \
        events delivered to the server's observer. Scan results are not kept.",
    params(EventsQuery),
    responses(
        (status = 200, description = "Recent events", body = EventsResponse)
    )
)]
pub async fn list_events(
    State(state): State<SharedState>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let mut events = state.events.recent(EVENT_CAPACITY);
    if let Some(address) = &query.address {
        events.retain(|e| {
            e.address
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(address))
        });
    }
    if let Some(limit) = query.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }
    Json(EventsResponse { events })
}
