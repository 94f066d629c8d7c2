//! Change-feed ingress: lets the write pipeline publish over HTTP.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{FeedAcceptedResponse, FeedMessage};
use crate::app_state::AppState;
use crate::domain::{ChangeEvent, ChangeTopic, ClearCacheMessage};
use crate::error::{ErrorResponse, LiveQueryError};

/// Header carrying the master key.
pub const MASTER_KEY_HEADER: &str = "x-parse-master-key";

/// `POST /feed/{topic}`: Publish a change-feed message.
///
/// # Errors
///
/// [`LiveQueryError::Unauthorized`] without the master key,
/// [`LiveQueryError::InvalidRequest`] for an unknown topic or a message
/// that doesn't fit it.
#[utoipa::path(
    post,
    path = "/api/v1/feed/{topic}",
    tag = "Feed",
    summary = "Publish a change-feed message",
    description = "Publishes an afterSave, afterDelete or clearCache message onto the change-feed bus. Requires the X-Parse-Master-Key header.",
    params(
        ("topic" = String, Path, description = "afterSave, afterDelete or clearCache"),
    ),
    request_body = FeedMessage,
    responses(
        (status = 202, description = "Message published", body = FeedAcceptedResponse),
        (status = 400, description = "Unknown topic or malformed message", body = ErrorResponse),
        (status = 403, description = "Missing or wrong master key", body = ErrorResponse),
    )
)]
pub async fn publish_feed(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    Json(FeedMessage(body)): Json<FeedMessage>,
) -> Result<impl IntoResponse, LiveQueryError> {
    let supplied = headers
        .get(MASTER_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    match (state.config.master_key.as_deref(), supplied) {
        (Some(expected), Some(given)) if expected == given => {}
        _ => return Err(LiveQueryError::Unauthorized),
    }

    let topic = ChangeTopic::parse(&topic)
        .ok_or_else(|| LiveQueryError::InvalidRequest(format!("unknown topic '{topic}'")))?;
    let payload = body.to_string();
    match topic {
        ChangeTopic::AfterSave | ChangeTopic::AfterDelete => {
            ChangeEvent::from_payload(&payload)?;
        }
        ChangeTopic::ClearCache => {
            serde_json::from_str::<ClearCacheMessage>(&payload).map_err(|e| {
                LiveQueryError::InvalidRequest(format!("malformed clearCache message: {e}"))
            })?;
        }
    }

    let channel = topic.channel(&state.config.application_id);
    state.publisher.publish(&channel, payload).await?;
    tracing::debug!(channel = %channel, "feed message published");

    Ok((
        StatusCode::ACCEPTED,
        Json(FeedAcceptedResponse {
            topic: topic.as_str().to_string(),
            channel,
        }),
    ))
}

/// Feed routes mounted under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new().route("/feed/{topic}", post(publish_feed))
}
