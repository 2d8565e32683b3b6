//! HTTP API for client-submitted tracking records, plus the configuration
//! and per-instance data the page handler embeds for the browser client.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

use super::context::TrackContext;
use super::middleware::Tracker;
use super::{error_bad_request, error_internal};
use crate::model::{Params, View};

/// Payload the client POSTs when it transitions to a new application state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewView {
    /// Instance the view belongs to. Must match the route's instance.
    pub instance: i64,
    /// Client-assigned sequence number within the instance.
    pub seq: i64,
    /// Name of the application state being viewed.
    pub state: String,
    /// State parameters, stored as-is.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Params,
}

/// Record a view submitted by the client
///
/// The instance embedded in the payload must match the instance addressed
/// by the route; a mismatch means a forged payload or a client bug that
/// would corrupt another session's timeline.
#[utoipa::path(
    post,
    path = "/instances/{instance}/views",
    tag = "Tracking",
    params(
        ("instance" = i64, Path, description = "Instance the view belongs to")
    ),
    request_body = NewView,
    responses(
        (status = 200, description = "View recorded"),
        (status = 400, description = "Instance mismatch or invalid payload", body = super::ErrorResponse),
        (status = 500, description = "View could not be persisted", body = super::ErrorResponse)
    )
)]
pub async fn create_view(
    State(tracker): State<Tracker>,
    Path(instance): Path<i64>,
    Json(payload): Json<NewView>,
) -> Response {
    if instance <= 0 {
        return error_bad_request("instance must be positive");
    }
    if payload.instance != instance {
        warn!(
            payload_instance = payload.instance,
            route_instance = instance,
            "rejecting view whose instance does not match the route"
        );
        return error_bad_request("view instance does not match route instance");
    }

    let view = View {
        instance,
        seq: payload.seq,
        state: payload.state,
        params: payload.params,
        date: Utc::now(),
    };
    match tracker.store().insert_view(&view).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(error = %e, "insert_view failed");
            error_internal("view could not be recorded")
        }
    }
}

/// Routes for client-submitted tracking records.
pub fn api_router(tracker: Tracker) -> Router {
    Router::new()
        .route("/instances/{instance}/views", post(create_view))
        .with_state(tracker)
}

/// Configuration the client requires to send tracking information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ClientConfig {
    /// URL template the client POSTs new views to; `:instance` is
    /// substituted by the client.
    pub new_view_url: String,
}

/// Client configuration for an API mounted at `api_base`.
pub fn client_config(api_base: &str) -> ClientConfig {
    ClientConfig {
        new_view_url: format!(
            "{}/instances/:instance/views",
            api_base.trim_end_matches('/')
        ),
    }
}

/// Per-page-load data the client requires to send tracking information.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientData {
    /// Instance to associate with all views and calls from this page load.
    pub instance: Option<i64>,
}

pub fn client_data(cx: &TrackContext) -> ClientData {
    ClientData {
        instance: cx.instance(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, Store, ViewFilter};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router(store: MemStore) -> Router {
        api_router(Tracker::new(Arc::new(store), "web"))
    }

    fn post_view(instance: i64, payload: serde_json::Value) -> HttpRequest<Body> {
        HttpRequest::post(format!("/instances/{instance}/views"))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn instance_mismatch_is_rejected_and_nothing_persisted() {
        let store = MemStore::new();
        let response = router(store.clone())
            .oneshot(post_view(
                3,
                json!({"instance": 4, "seq": 1, "state": "contacts.list"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let views = store.query_views(&ViewFilter::default()).await.unwrap();
        assert!(views.is_empty());
    }

    #[tokio::test]
    async fn matching_instance_persists_one_row() {
        let store = MemStore::new();
        let response = router(store.clone())
            .oneshot(post_view(
                3,
                json!({"instance": 3, "seq": 1, "state": "contacts.list", "params": {"q": "smith"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let views = store.query_views(&ViewFilter::default()).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].instance, 3);
        assert_eq!(views[0].seq, 1);
        assert_eq!(views[0].state, "contacts.list");
        assert_eq!(views[0].params.0.get("q"), Some(&json!("smith")));
    }

    #[tokio::test]
    async fn resubmission_overwrites_instead_of_duplicating() {
        let store = MemStore::new();
        let app = router(store.clone());

        let first = app
            .clone()
            .oneshot(post_view(
                7,
                json!({"instance": 7, "seq": 2, "state": "a", "params": {"x": "1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(post_view(
                7,
                json!({"instance": 7, "seq": 2, "state": "b", "params": {"x": "2"}}),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);

        let views = store.query_views(&ViewFilter::default()).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, "b");
        assert_eq!(views[0].params.0.get("x"), Some(&json!("2")));
    }

    #[tokio::test]
    async fn nonpositive_instance_is_rejected() {
        let store = MemStore::new();
        let response = router(store)
            .oneshot(post_view(0, json!({"instance": 0, "seq": 1, "state": "a"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn client_config_builds_view_url() {
        assert_eq!(
            client_config("/api/track").new_view_url,
            "/api/track/instances/:instance/views"
        );
        assert_eq!(
            client_config("/api/track/").new_view_url,
            "/api/track/instances/:instance/views"
        );
    }

    #[test]
    fn client_data_reflects_context() {
        let cx = TrackContext::new();
        assert_eq!(client_data(&cx).instance, None);
        cx.set_instance(9);
        assert_eq!(client_data(&cx).instance, Some(9));
    }
}
