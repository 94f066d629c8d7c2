//! DTOs of the change-feed ingress endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Raw change-feed message: `{currentParseObject, originalParseObject?}`
/// for `afterSave` / `afterDelete`, `{userId}` for `clearCache`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct FeedMessage(pub Value);

/// Acknowledgement of a published feed message.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FeedAcceptedResponse {
    /// Topic the message was published under.
    pub topic: String,
    /// Full channel name.
    pub channel: String,
}
