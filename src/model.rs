//! Data model for tracked calls, instances, and views.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Params is an unordered map of route or querystring parameter values.
///
/// Values are scalars or lists of scalars; the map is stored as a JSON blob
/// and never interpreted beyond pass-through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(pub HashMap<String, Value>);

impl Params {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Serialize for storage. A Params map always serializes cleanly.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data).map(Params)
    }
}

/// ViewId identifies one client-side application state transition: the
/// instance (page load) it happened in and the client-assigned sequence
/// number within that instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewId {
    /// Instance is the ID of the page load the view belongs to.
    pub instance: i64,

    /// Seq is the client-assigned sequence number, monotonic per instance.
    pub seq: i64,
}

/// Instance represents one page load / application instantiation by a client.
///
/// Created once by the entry-point middleware and never mutated thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// ID is the unique ID of this instance.
    pub id: i64,

    /// ClientID is the long-lived identifier of the browser that loaded the page.
    pub client_id: i64,

    /// URL is the full URL of the page request.
    pub url: String,

    /// ReferrerURL is the Referer header of the page request, if any.
    pub referrer_url: String,

    /// UserAgent is the client's User-Agent string.
    pub user_agent: String,

    /// IPAddress is the client's IP address, without the port.
    pub ip_address: String,

    /// User is the authenticated user, if the current-user hook resolved one.
    pub user: Option<String>,

    /// Start is when the page load occurred.
    pub start: DateTime<Utc>,
}

/// View represents a client viewing a named application state within an
/// instance. Keyed by (instance, seq); the sequence number is assigned by
/// the untrusted client, and resubmission of an existing key overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// Instance is the ID of the instance this view belongs to.
    pub instance: i64,

    /// Seq is the client-assigned sequence number of this view.
    pub seq: i64,

    /// State is the name of the application state that was viewed.
    pub state: String,

    /// Params is a map of the state parameters for this view.
    pub params: Params,

    /// Date is the server-observed time of the view submission.
    pub date: DateTime<Utc>,
}

/// Call represents one traced HTTP request/response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// ID is the unique, store-assigned ID of this call.
    pub id: i64,

    /// ParentCallID is the ID of the call that this call originated from,
    /// propagated from an upstream caller. None means this call is the root
    /// of a new causal tree.
    pub parent_call_id: Option<i64>,

    /// View is the (instance, seq) attribution sent by the client, if any.
    pub view: Option<ViewId>,

    /// App is the string identifier of the application (e.g., "web").
    pub app: String,

    /// Host is the machine that handled this call.
    pub host: String,

    /// RemoteAddr is the client's IP address, without the port.
    pub remote_addr: String,

    /// UserAgent is the client's User-Agent string.
    pub user_agent: String,

    /// User is the authenticated user, if the current-user hook resolved one.
    pub user: Option<String>,

    /// URL is the full URL of the request.
    pub url: String,

    /// HTTPMethod is the HTTP method of the request (GET, POST, etc.).
    pub http_method: String,

    /// Route is the matched route pattern, if the router exposed one.
    pub route: Option<String>,

    /// RouteParams is a map of the route parameters in the request.
    pub route_params: Params,

    /// QueryParams is a map of the querystring parameters in the request.
    pub query_params: Params,

    /// Start is when the request began.
    pub start: DateTime<Utc>,

    /// Status is the outcome of the call. None means the call's completion
    /// was never observed (crash, shutdown mid-request).
    pub status: Option<CallStatus>,
}

/// CallStatus is the outcome of a Call, written once after the inner handler
/// completes, faults, or the client disconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    /// End is when the request finished processing.
    pub end: DateTime<Utc>,

    /// BodyLength is the number of response body bytes observed.
    pub body_length: u64,

    /// HTTPStatus is the response status code. None when the handler
    /// terminated before a response head was produced.
    pub http_status: Option<u16>,

    /// Err is the error message the handler chose to report, if any.
    pub err: Option<String>,

    /// Panicked is true when the inner handler terminated abnormally
    /// instead of returning.
    pub panicked: bool,
}

impl Call {
    /// Elapsed duration of a finished call.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.status.as_ref().map(|s| s.end - self.start)
    }
}
