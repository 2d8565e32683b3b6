//! Response instrumentation.
//!
//! [`RecordingBody`] wraps the response body handed back by the inner
//! handler, forwarding every frame unbuffered while accumulating the byte
//! count. Its [`CallFinisher`] persists the call outcome exactly once, on
//! whichever terminal event comes first: end of stream, stream error, a
//! panic inside the stream (recorded, then resumed), or drop, which covers
//! client disconnects mid-response.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::Utc;
use http_body::{Body, Frame, SizeHint};
use tracing::error;

use crate::model::CallStatus;
use crate::store::Store;

/// Writes a call's outcome record at most once.
pub struct CallFinisher {
    store: Arc<dyn Store>,
    call_id: i64,
    http_status: Option<u16>,
    body_length: u64,
    err: Option<String>,
    done: bool,
}

impl CallFinisher {
    pub fn new(
        store: Arc<dyn Store>,
        call_id: i64,
        http_status: Option<u16>,
        err: Option<String>,
    ) -> Self {
        Self {
            store,
            call_id,
            http_status,
            body_length: 0,
            err,
            done: false,
        }
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.body_length += n;
    }

    pub fn set_err(&mut self, err: String) {
        self.err.get_or_insert(err);
    }

    fn status(&self, panicked: bool) -> CallStatus {
        CallStatus {
            end: Utc::now(),
            body_length: self.body_length,
            http_status: self.http_status,
            err: self.err.clone(),
            panicked,
        }
    }

    /// Persist the outcome with what was observed so far. Subsequent calls
    /// (and the Drop fallback) are no-ops.
    pub fn finish(&mut self, panicked: bool) {
        if self.done {
            return;
        }
        self.done = true;

        let store = self.store.clone();
        let call_id = self.call_id;
        let status = self.status(panicked);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.set_call_status(call_id, &status).await {
                        error!(call_id, error = %e, "set_call_status failed");
                    }
                });
            }
            Err(_) => error!(call_id, "no runtime to record call status"),
        }
    }

    /// Persist the outcome and wait for the write. Used on the panic path,
    /// where the middleware is still in async context.
    pub async fn finish_now(mut self, panicked: bool) {
        if self.done {
            return;
        }
        self.done = true;

        let status = self.status(panicked);
        if let Err(e) = self.store.set_call_status(self.call_id, &status).await {
            error!(call_id = self.call_id, error = %e, "set_call_status failed");
        }
    }
}

impl Drop for CallFinisher {
    fn drop(&mut self) {
        // Response dropped before the body finished: the client went away.
        // Record whatever was observed.
        self.finish(false);
    }
}

/// A pass-through body observing status-bearing byte traffic.
pub struct RecordingBody<B> {
    inner: B,
    finisher: CallFinisher,
}

impl<B> RecordingBody<B> {
    pub fn new(inner: B, finisher: CallFinisher) -> Self {
        Self { inner, finisher }
    }
}

impl<B> Body for RecordingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: ToString,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        let poll = match catch_unwind(AssertUnwindSafe(|| Pin::new(&mut this.inner).poll_frame(cx)))
        {
            Ok(poll) => poll,
            Err(payload) => {
                // A streaming body faulted mid-response. Record the partial
                // observation and let the fault keep propagating.
                this.finisher.finish(true);
                resume_unwind(payload);
            }
        };

        match poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.finisher.add_bytes(data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finisher.set_err(e.to_string());
                this.finisher.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finisher.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
