//! Request-scoped context store.
//!
//! A [`TrackContext`] is created when a request enters the tracking
//! middleware and carried in the request extensions. Each slot is
//! write-once; reads return `None` for slots that were never resolved.
//! The context is cheap to clone and safe to hand to any task spawned to
//! serve the same request.

use std::sync::{Arc, OnceLock};

use http::Extensions;

use crate::model::ViewId;

#[derive(Default)]
struct Slots {
    client_id: OnceLock<i64>,
    instance: OnceLock<i64>,
    view: OnceLock<ViewId>,
    call_id: OnceLock<i64>,
}

/// The identifiers resolved for one inbound request.
#[derive(Clone, Default)]
pub struct TrackContext {
    inner: Arc<Slots>,
}

impl TrackContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the context already attached to the request, or attaches a
    /// fresh one. Layered tracking middleware shares a single context.
    pub fn attach(extensions: &mut Extensions) -> TrackContext {
        if let Some(cx) = extensions.get::<TrackContext>() {
            return cx.clone();
        }
        let cx = TrackContext::new();
        extensions.insert(cx.clone());
        cx
    }

    pub fn get(extensions: &Extensions) -> Option<TrackContext> {
        extensions.get::<TrackContext>().cloned()
    }

    /// The long-lived client identity resolved from the cookie, if any.
    pub fn client_id(&self) -> Option<i64> {
        self.inner.client_id.get().copied()
    }

    /// Records the client identity. Returns false if it was already set.
    pub fn set_client_id(&self, id: i64) -> bool {
        self.inner.client_id.set(id).is_ok()
    }

    /// The instance (page load) this request belongs to, if known.
    pub fn instance(&self) -> Option<i64> {
        self.inner.instance.get().copied()
    }

    pub fn set_instance(&self, id: i64) -> bool {
        self.inner.instance.set(id).is_ok()
    }

    /// The (instance, seq) view attribution sent by the client, if any.
    pub fn view(&self) -> Option<ViewId> {
        self.inner.view.get().copied()
    }

    pub fn set_view(&self, id: ViewId) -> bool {
        self.inner.view.set(id).is_ok()
    }

    /// The ID of the call currently being served, if this request is traced.
    pub fn call_id(&self) -> Option<i64> {
        self.inner.call_id.get().copied()
    }

    pub fn set_call_id(&self, id: i64) -> bool {
        self.inner.call_id.set(id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_write_once() {
        let cx = TrackContext::new();
        assert_eq!(cx.call_id(), None);
        assert!(cx.set_call_id(7));
        assert!(!cx.set_call_id(8));
        assert_eq!(cx.call_id(), Some(7));
    }

    #[test]
    fn attach_reuses_existing_context() {
        let mut extensions = Extensions::new();
        let a = TrackContext::attach(&mut extensions);
        a.set_client_id(3);
        let b = TrackContext::attach(&mut extensions);
        assert_eq!(b.client_id(), Some(3));
    }

    #[test]
    fn clones_share_slots_across_tasks() {
        let cx = TrackContext::new();
        let clone = cx.clone();
        std::thread::spawn(move || {
            clone.set_view(ViewId {
                instance: 1,
                seq: 2,
            });
        })
        .join()
        .unwrap();
        assert_eq!(
            cx.view(),
            Some(ViewId {
                instance: 1,
                seq: 2
            })
        );
    }
}
