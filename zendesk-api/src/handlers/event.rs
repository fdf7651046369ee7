use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::classify::{classify, InboundEvent};
use crate::dispatch::DispatchOutcome;

use super::app::AppState;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Synced,
    Skipped,
    UnknownUser,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct EventResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventResponse {
    fn status(status: EventStatus) -> Json<Self> {
        Json(Self {
            status: Some(status),
            error: None,
        })
    }
}

/// Strings are written as they are, anything else as its JSON text. A missing value means now.
fn sent_at_value(sent_at: Option<&Value>) -> String {
    match sent_at {
        None | Some(Value::Null) => chrono::Utc::now().to_rfc3339(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<Json<EventResponse>, (StatusCode, Json<EventResponse>)> {
    metrics::counter!("zendesk_events_received_total").increment(1);

    let email = match classify(&event, &state.session) {
        Ok(email) => email,
        Err(skip) => {
            debug!(event = %event.event, "skipping event: {}", skip);
            metrics::counter!("zendesk_events_skipped_total", "reason" => skip.reason())
                .increment(1);
            return Ok(EventResponse::status(EventStatus::Skipped));
        }
    };

    let sent_at = sent_at_value(event.sent_at.as_ref());

    match state
        .dispatcher
        .dispatch(&email, &event.event, &sent_at)
        .await
    {
        Ok(DispatchOutcome::Updated { .. }) => Ok(EventResponse::status(EventStatus::Synced)),
        Ok(DispatchOutcome::UnknownUser) => Ok(EventResponse::status(EventStatus::UnknownUser)),
        Err(e) => {
            error!(event = %event.event, "failed to sync event to zendesk: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(EventResponse {
                    status: None,
                    error: Some(e.to_string()),
                }),
            ))
        }
    }
}
