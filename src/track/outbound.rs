//! Outbound causality propagation.
//!
//! When code running inside a traced call issues an HTTP request to another
//! traced service, the current call's ID travels as the callee's parent-call
//! header. The propagator is reqwest client middleware: requests carrying a
//! [`ParentCall`] extension get the header, everything else passes through
//! unmodified.

use async_trait::async_trait;
use http::{Extensions, HeaderMap, HeaderValue};
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientWithMiddleware, Middleware, Next, Result};

use super::context::TrackContext;
use super::headers::PARENT_CALL_HEADER;

/// Marks an outbound request as caused by the given call. Attach with
/// `RequestBuilder::with_extension`.
#[derive(Debug, Clone, Copy)]
pub struct ParentCall(pub i64);

impl ParentCall {
    /// The parent-call marker for the request currently being served, if it
    /// is part of a traced chain.
    pub fn from_context(cx: &TrackContext) -> Option<ParentCall> {
        cx.call_id().map(ParentCall)
    }
}

/// Client middleware injecting the parent-call header.
pub struct ParentCallPropagator;

#[async_trait]
impl Middleware for ParentCallPropagator {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        inject_parent_call(extensions, req.headers_mut());
        next.run(req, extensions).await
    }
}

fn inject_parent_call(extensions: &Extensions, headers: &mut HeaderMap) {
    let Some(ParentCall(id)) = extensions.get::<ParentCall>().copied() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        headers.insert(PARENT_CALL_HEADER, value);
    }
}

/// A reqwest client that propagates parent-call IDs.
pub fn traced_client(client: Client) -> ClientWithMiddleware {
    reqwest_middleware::ClientBuilder::new(client)
        .with(ParentCallPropagator)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_header_only_with_parent_call_extension() {
        let mut headers = HeaderMap::new();

        // No extension: the request is left unmodified.
        inject_parent_call(&Extensions::new(), &mut headers);
        assert!(headers.is_empty());

        let mut extensions = Extensions::new();
        extensions.insert(ParentCall(4242));
        inject_parent_call(&extensions, &mut headers);
        assert_eq!(
            headers.get(PARENT_CALL_HEADER).unwrap().to_str().unwrap(),
            "4242"
        );
    }

    #[test]
    fn parent_call_from_context_requires_call_in_scope() {
        let cx = TrackContext::new();
        assert!(ParentCall::from_context(&cx).is_none());
        cx.set_call_id(17);
        assert_eq!(ParentCall::from_context(&cx).map(|p| p.0), Some(17));
    }
}
