//! Call/view tracking core: identifier propagation, request-scoped context,
//! response instrumentation, and the recording middleware.

pub mod context;
pub mod handlers;
pub mod headers;
pub mod identity;
pub mod middleware;
pub mod outbound;
pub mod recorder;

pub use context::TrackContext;
pub use handlers::{
    api_router, client_config, client_data, create_view, ClientConfig, ClientData, NewView,
};
pub use headers::{
    add_parent_call_header, format_view_id, parent_call_id_from_headers, parse_view_id,
    view_id_from_headers, ViewIdError, PARENT_CALL_HEADER, VIEW_ID_HEADER,
};
pub use identity::{
    clear_client_id_cookie, client_id_from_request, cookie_value, decode_client_id,
    encode_client_id, make_client_id_cookie, CodecError, CookieCodec, HmacCodec,
    PassthroughCodec, CLIENT_ID_COOKIE,
};
pub use middleware::{instantiate_app, track_call, CurrentUserFn, TrackError, Tracker};
pub use outbound::{traced_client, ParentCall, ParentCallPropagator};
pub use recorder::{CallFinisher, RecordingBody};

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(code: StatusCode, message: &str) -> axum::response::Response {
    (
        code,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// Shortcut functions for common error codes
pub fn error_bad_request(message: &str) -> axum::response::Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn error_internal(message: &str) -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}
