//! OpenAPI document of the REST surface.

use utoipa::OpenApi;

use crate::api::dto::{FeedAcceptedResponse, FeedMessage, HealthResponse, StatsResponse};
use crate::api::handlers::{feed, system};
use crate::error::{ErrorBody, ErrorResponse};

/// OpenAPI description of every REST endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "livequery-gateway", description = "Live-query WebSocket gateway REST API"),
    paths(
        system::health_handler,
        system::stats_handler,
        feed::publish_feed,
    ),
    components(schemas(
        HealthResponse,
        StatsResponse,
        FeedMessage,
        FeedAcceptedResponse,
        ErrorResponse,
        ErrorBody,
    )),
    tags(
        (name = "System", description = "Health and statistics"),
        (name = "Feed", description = "Change-feed ingress"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_path() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/health"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/stats"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/feed/{topic}"));
    }
}
