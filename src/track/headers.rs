//! Propagation headers carrying causality across request boundaries.
//!
//! Two channels, each independent: the parent-call header links a request to
//! the traced call that issued it, and the view header attributes a request
//! to a client-side view. A malformed view header is a protocol violation
//! (the client/server tracking contract has diverged) and surfaces as a 400;
//! a malformed parent-call header degrades silently, like an absent one.

use http::header::{HeaderMap, HeaderValue};
use tracing::warn;

use super::context::TrackContext;
use crate::model::ViewId;

/// Request header carrying the caller's call ID in decimal.
pub const PARENT_CALL_HEADER: &str = "x-webtrack-parent-call";

/// Request header carrying `"<instance-id> <sequence-number>"`.
pub const VIEW_ID_HEADER: &str = "x-webtrack-view";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ViewIdError {
    #[error("view header has {0} fields; must have exactly 2")]
    FieldCount(usize),

    #[error("view header field {0:?} is not a base-10 integer")]
    BadInteger(String),

    #[error("view header field {0} is negative")]
    Negative(i64),

    #[error("view header value is not valid ASCII")]
    NotAscii,
}

/// Parse a view header value: trimmed, split on a single ASCII space,
/// exactly two non-negative base-10 integers.
pub fn parse_view_id(value: &str) -> Result<ViewId, ViewIdError> {
    let fields: Vec<&str> = value.trim().split(' ').collect();
    if fields.len() != 2 {
        return Err(ViewIdError::FieldCount(fields.len()));
    }
    Ok(ViewId {
        instance: parse_field(fields[0])?,
        seq: parse_field(fields[1])?,
    })
}

fn parse_field(field: &str) -> Result<i64, ViewIdError> {
    let n: i64 = field
        .parse()
        .map_err(|_| ViewIdError::BadInteger(field.to_string()))?;
    if n < 0 {
        return Err(ViewIdError::Negative(n));
    }
    Ok(n)
}

/// The wire form of a view ID, as the client sends it.
pub fn format_view_id(id: ViewId) -> String {
    format!("{} {}", id.instance, id.seq)
}

/// Read the view attribution from the request headers.
///
/// Ok(None) when the header is absent; Err when it is present but
/// malformed, which callers surface as an HTTP 400.
pub fn view_id_from_headers(headers: &HeaderMap) -> Result<Option<ViewId>, ViewIdError> {
    match headers.get(VIEW_ID_HEADER) {
        None => Ok(None),
        Some(value) => {
            let s = value.to_str().map_err(|_| ViewIdError::NotAscii)?;
            parse_view_id(s).map(Some)
        }
    }
}

/// Read the parent call ID from the request headers. Absent or unparsable
/// values mean this call is the root of a new causal tree.
pub fn parent_call_id_from_headers(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(PARENT_CALL_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Attach the current call's ID as the parent-call header of an outbound
/// request. A no-op when no call is in scope.
pub fn add_parent_call_header(cx: &TrackContext, headers: &mut HeaderMap) {
    let Some(id) = cx.call_id() else {
        warn!("add_parent_call_header: no call id in scope; request left untouched");
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        headers.insert(PARENT_CALL_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_view_id_accepts_valid_pairs() {
        let tests = [
            ("1 2", ViewId { instance: 1, seq: 2 }),
            ("0 0", ViewId { instance: 0, seq: 0 }),
            ("123 456", ViewId { instance: 123, seq: 456 }),
            ("  7 8  ", ViewId { instance: 7, seq: 8 }),
        ];
        for (input, want) in tests {
            assert_eq!(parse_view_id(input).unwrap(), want, "input {input:?}");
        }
    }

    #[test]
    fn parse_view_id_rejects_bad_shapes() {
        let tests = [
            ("", ViewIdError::FieldCount(1)),
            ("1", ViewIdError::FieldCount(1)),
            ("1 2 3", ViewIdError::FieldCount(3)),
            ("1  2", ViewIdError::FieldCount(3)),
            ("a 2", ViewIdError::BadInteger("a".to_string())),
            ("1 b", ViewIdError::BadInteger("b".to_string())),
            ("1.5 2", ViewIdError::BadInteger("1.5".to_string())),
            ("-1 2", ViewIdError::Negative(-1)),
            ("1 -2", ViewIdError::Negative(-2)),
        ];
        for (input, want) in tests {
            assert_eq!(parse_view_id(input).unwrap_err(), want, "input {input:?}");
        }
    }

    #[test]
    fn view_id_round_trips_through_wire_form() {
        let id = ViewId {
            instance: 55,
            seq: 9,
        };
        assert_eq!(parse_view_id(&format_view_id(id)).unwrap(), id);
    }

    #[test]
    fn view_id_header_absent_is_none() {
        assert_eq!(view_id_from_headers(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn parent_call_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parent_call_id_from_headers(&headers), None);

        headers.insert(PARENT_CALL_HEADER, HeaderValue::from_static("9000"));
        assert_eq!(parent_call_id_from_headers(&headers), Some(9000));

        headers.insert(PARENT_CALL_HEADER, HeaderValue::from_static("not-a-number"));
        assert_eq!(parent_call_id_from_headers(&headers), None);
    }

    #[test]
    fn add_parent_call_header_requires_call_in_scope() {
        let cx = TrackContext::new();
        let mut headers = HeaderMap::new();
        add_parent_call_header(&cx, &mut headers);
        assert!(headers.is_empty());

        cx.set_call_id(31337);
        add_parent_call_header(&cx, &mut headers);
        assert_eq!(
            headers.get(PARENT_CALL_HEADER).unwrap().to_str().unwrap(),
            "31337"
        );
    }
}
