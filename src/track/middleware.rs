//! The call recorder and application entry-point middleware.
//!
//! `track_call` wraps API handlers: it resolves the identifiers arriving on
//! the request, persists the call "started" record, runs the inner handler
//! through the response instrumentation, and guarantees a single "finished"
//! record whether the handler returns, faults, or the client disconnects.
//! A fault is observed and re-raised unchanged; tracking never converts it
//! into a different outcome.
//!
//! `instantiate_app` wraps handlers returning the base page of an
//! application: it issues the client-identity cookie when needed and
//! creates the instance record the client references in later views.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, Path, Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use futures::FutureExt;
use http::header::{HeaderMap, HeaderName, REFERER, USER_AGENT};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::context::TrackContext;
use super::headers::{parent_call_id_from_headers, view_id_from_headers, VIEW_ID_HEADER};
use super::identity::{client_id_from_request, make_client_id_cookie, CookieCodec, PassthroughCodec};
use super::recorder::{CallFinisher, RecordingBody};
use super::{error_bad_request, error_internal};
use crate::model::{Call, Instance, Params};
use crate::store::Store;

/// Hook resolving the currently authenticated user for a request. Errors
/// are treated as "no user", never as request failures.
pub type CurrentUserFn =
    Arc<dyn Fn(&Request) -> anyhow::Result<Option<String>> + Send + Sync>;

/// Error text a handler chooses to report for its call record. Insert into
/// the response extensions before returning.
#[derive(Debug, Clone)]
pub struct TrackError(pub String);

/// Shared state for the tracking middleware.
#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn Store>,
    codec: Arc<dyn CookieCodec>,
    current_user: Option<CurrentUserFn>,
    app: String,
    host: String,
    strict: bool,
}

impl Tracker {
    pub fn new(store: Arc<dyn Store>, app: impl Into<String>) -> Self {
        let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
        Self {
            store,
            codec: Arc::new(PassthroughCodec),
            current_user: None,
            app: app.into(),
            host,
            strict: false,
        }
    }

    /// Authenticate the identity cookie with the given codec.
    pub fn with_codec(mut self, codec: Arc<dyn CookieCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Install the currently-authenticated-user hook.
    pub fn with_current_user(mut self, hook: CurrentUserFn) -> Self {
        self.current_user = Some(hook);
        self
    }

    /// Fail requests with 500 when a tracking write fails. The default is
    /// lenient: tracking errors are logged and the request proceeds, so a
    /// tracking outage cannot become an application outage.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn CookieCodec> {
        &self.codec
    }

    fn resolve_user(&self, request: &Request) -> Option<String> {
        let hook = self.current_user.as_ref()?;
        match hook(request) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "current-user hook failed");
                None
            }
        }
    }
}

/// Middleware recording a Call/CallStatus pair for each request it wraps.
pub async fn track_call(
    State(tracker): State<Tracker>,
    matched_path: Option<MatchedPath>,
    path_params: Option<Path<Vec<(String, String)>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let cx = TrackContext::attach(request.extensions_mut());

    // Client identity: read-only here; a bad cookie degrades to "unknown".
    match client_id_from_request(request.headers(), tracker.codec.as_ref()) {
        Ok(Some(id)) => {
            cx.set_client_id(id);
        }
        Ok(None) => {}
        Err(e) => debug!(error = %e, "unreadable client id cookie ignored"),
    }

    // View attribution: a malformed header is a protocol violation and the
    // handler never runs.
    let view = match view_id_from_headers(request.headers()) {
        Ok(view) => view,
        Err(e) => {
            warn!(error = %e, "rejecting malformed view header");
            return error_bad_request(&format!("invalid {VIEW_ID_HEADER} header: {e}"));
        }
    };
    if let Some(view) = view {
        cx.set_view(view);
        cx.set_instance(view.instance);
    }

    let call = Call {
        id: 0,
        parent_call_id: parent_call_id_from_headers(request.headers()),
        view,
        app: tracker.app.clone(),
        host: tracker.host.clone(),
        remote_addr: remote_addr(&request),
        user_agent: header_str(request.headers(), USER_AGENT),
        user: tracker.resolve_user(&request),
        url: request.uri().to_string(),
        http_method: request.method().to_string(),
        route: matched_path.map(|p| p.as_str().to_string()),
        route_params: params_from_path(path_params.as_ref().map(|p| &p.0)),
        query_params: params_from_query(request.uri().query()),
        start: Utc::now(),
        status: None,
    };

    let call_id = match tracker.store.insert_call(&call).await {
        Ok(id) => Some(id),
        Err(e) => {
            error!(error = %e, "insert_call failed");
            if tracker.strict {
                return error_internal("call tracking unavailable");
            }
            None
        }
    };
    if let Some(id) = call_id {
        // Published before the handler runs so nested outbound calls (and
        // the handler itself) can read "my own call id".
        cx.set_call_id(id);
    }

    let outcome = AssertUnwindSafe(next.run(request)).catch_unwind().await;

    let response = match outcome {
        Ok(response) => response,
        Err(payload) => {
            // The handler terminated abnormally before a response head
            // existed. Record that, then let the fault keep propagating so
            // the surrounding infrastructure's own handling is unaffected.
            if let Some(id) = call_id {
                let finisher = CallFinisher::new(tracker.store.clone(), id, None, None);
                finisher.finish_now(true).await;
            }
            std::panic::resume_unwind(payload);
        }
    };

    let Some(call_id) = call_id else {
        return response;
    };

    let err = response
        .extensions()
        .get::<TrackError>()
        .map(|e| e.0.clone());
    let (parts, body) = response.into_parts();
    let finisher = CallFinisher::new(
        tracker.store.clone(),
        call_id,
        Some(parts.status.as_u16()),
        err,
    );
    Response::from_parts(parts, Body::new(RecordingBody::new(body, finisher)))
}

/// Middleware wrapping handlers that return the base page of an
/// application: ensures the client-identity cookie and creates the
/// instance record for this page load.
pub async fn instantiate_app(
    State(tracker): State<Tracker>,
    mut request: Request,
    next: Next,
) -> Response {
    let cx = TrackContext::attach(request.extensions_mut());

    let mut issued_cookie = None;
    let client_id = match client_id_from_request(request.headers(), tracker.codec.as_ref()) {
        Ok(Some(id)) => Some(id),
        absent_or_unreadable => {
            if let Err(e) = absent_or_unreadable {
                debug!(error = %e, "unreadable client id cookie; issuing a fresh identity");
            }
            match tracker.store.next_client_id().await {
                Ok(id) => {
                    match make_client_id_cookie(id, tracker.codec.as_ref()) {
                        Ok(cookie) => issued_cookie = Some(cookie),
                        Err(e) => error!(error = %e, "client id cookie could not be encoded"),
                    }
                    Some(id)
                }
                Err(e) => {
                    error!(error = %e, "next_client_id failed");
                    if tracker.strict {
                        return error_internal("client identity unavailable");
                    }
                    None
                }
            }
        }
    };
    if let Some(id) = client_id {
        cx.set_client_id(id);
    }

    if let Some(client_id) = client_id {
        let instance = Instance {
            id: 0,
            client_id,
            url: request.uri().to_string(),
            referrer_url: header_str(request.headers(), REFERER),
            user_agent: header_str(request.headers(), USER_AGENT),
            ip_address: remote_addr(&request),
            user: tracker.resolve_user(&request),
            start: Utc::now(),
        };
        match tracker.store.insert_instance(&instance).await {
            Ok(id) => {
                cx.set_instance(id);
            }
            Err(e) => {
                error!(error = %e, "insert_instance failed");
                if tracker.strict {
                    return error_internal("instance tracking unavailable");
                }
            }
        }
    }

    let mut response = next.run(request).await;
    if let Some(cookie) = issued_cookie {
        // On the response head, ahead of any body bytes.
        response
            .headers_mut()
            .append(http::header::SET_COOKIE, cookie);
    }
    response
}

fn remote_addr(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(&name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn params_from_path(pairs: Option<&Vec<(String, String)>>) -> Params {
    let mut params = Params::default();
    if let Some(pairs) = pairs {
        for (key, value) in pairs {
            params.insert(key.clone(), Value::String(value.clone()));
        }
    }
    params
}

/// Querystring parameters as lists of strings, repeated keys appended.
fn params_from_query(query: Option<&str>) -> Params {
    let mut params = Params::default();
    let Some(query) = query else {
        return params;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let entry = params
            .0
            .entry(key.into_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.into_owned()));
        }
    }
    params
}
