//! In-memory persistence gateway, used by tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CallFilter, Store, StoreError, ViewFilter};
use crate::model::{Call, CallStatus, Instance, View};
use crate::prelude::RwArc;

#[derive(Default)]
struct MemInner {
    next_client_id: i64,
    calls: Vec<Call>,
    instances: Vec<Instance>,
    views: HashMap<(i64, i64), View>,
}

/// A [`Store`] keeping everything in process memory.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: RwArc<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemInner::default())),
        }
    }

    /// Number of client identities allocated so far.
    pub async fn client_ids_allocated(&self) -> i64 {
        self.inner.read().await.next_client_id
    }
}

#[async_trait]
impl Store for MemStore {
    async fn next_client_id(&self) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_client_id += 1;
        Ok(inner.next_client_id)
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        let id = inner.instances.len() as i64 + 1;
        inner.instances.push(Instance {
            id,
            ..instance.clone()
        });
        Ok(id)
    }

    async fn insert_call(&self, call: &Call) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        let id = inner.calls.len() as i64 + 1;
        inner.calls.push(Call {
            id,
            status: None,
            ..call.clone()
        });
        Ok(id)
    }

    async fn set_call_status(&self, call_id: i64, status: &CallStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let call = inner
            .calls
            .iter_mut()
            .find(|c| c.id == call_id)
            .ok_or_else(|| StoreError::Database(format!("no call with id {call_id}")))?;
        call.status = Some(status.clone());
        Ok(())
    }

    async fn insert_view(&self, view: &View) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .views
            .insert((view.instance, view.seq), view.clone());
        Ok(())
    }

    async fn query_calls(&self, filter: &CallFilter) -> Result<Vec<Call>, StoreError> {
        let inner = self.inner.read().await;
        let mut calls: Vec<Call> = inner
            .calls
            .iter()
            .filter(|c| {
                filter
                    .parent_call_id
                    .map_or(true, |p| c.parent_call_id == Some(p))
            })
            .filter(|c| {
                filter
                    .instance
                    .map_or(true, |i| c.view.map(|v| v.instance) == Some(i))
            })
            .filter(|c| !filter.unfinished_only || c.status.is_none())
            .cloned()
            .collect();
        calls.reverse();
        if let Some(limit) = filter.limit {
            calls.truncate(limit);
        }
        Ok(calls)
    }

    async fn query_views(&self, filter: &ViewFilter) -> Result<Vec<View>, StoreError> {
        let inner = self.inner.read().await;
        let mut views: Vec<View> = inner
            .views
            .values()
            .filter(|v| filter.instance.map_or(true, |i| v.instance == i))
            .cloned()
            .collect();
        views.sort_by_key(|v| (std::cmp::Reverse(v.instance), std::cmp::Reverse(v.seq)));
        if let Some(limit) = filter.limit {
            views.truncate(limit);
        }
        Ok(views)
    }
}
