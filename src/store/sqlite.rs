//! SQLite-backed persistence gateway.
//!
//! All database access happens on a dedicated worker thread owning the
//! connection; async callers submit closures over an mpsc channel and await
//! the reply on a oneshot. The schema is created on open.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};
use tokio::sync::oneshot;
use tracing::{error, info};

use super::{CallFilter, Store, StoreError, ViewFilter};
use crate::model::{Call, CallStatus, Instance, Params, View, ViewId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS client_id_seq (
  value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS instance (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  client_id INTEGER NOT NULL,
  url TEXT NOT NULL,
  referrer_url TEXT NOT NULL,
  user_agent TEXT NOT NULL,
  ip_address TEXT NOT NULL,
  user TEXT NULL,
  start TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS call (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_call_id INTEGER NULL,
  view_instance INTEGER NULL,
  view_seq INTEGER NULL,
  app TEXT NOT NULL,
  host TEXT NOT NULL,
  remote_addr TEXT NOT NULL,
  user_agent TEXT NOT NULL,
  user TEXT NULL,
  url TEXT NOT NULL,
  http_method TEXT NOT NULL,
  route TEXT NULL,
  route_params TEXT NOT NULL,
  query_params TEXT NOT NULL,
  start TEXT NOT NULL,
  -- status fields, filled in post-request; \"end\" NULL means the call's
  -- completion was never observed
  \"end\" TEXT NULL,
  body_length INTEGER NULL,
  http_status INTEGER NULL,
  err TEXT NULL,
  panicked INTEGER NULL
);
CREATE INDEX IF NOT EXISTS call_parent_call_id ON call(parent_call_id);
CREATE TABLE IF NOT EXISTS \"view\" (
  instance_id INTEGER NOT NULL,
  seq INTEGER NOT NULL,
  state TEXT NOT NULL,
  params TEXT NOT NULL,
  date TEXT NOT NULL,
  PRIMARY KEY (instance_id, seq)
);
INSERT INTO client_id_seq (value)
  SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM client_id_seq);
";

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("failed to join store thread: {join_err:?}");
            }
        }
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
    db_path: Option<Arc<PathBuf>>,
}

impl SqliteStore {
    /// Open (creating if necessary) the database at `db_path`.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }
        let path_for_thread = db_path.clone();
        let store = Self::spawn_worker(move || {
            Connection::open(&path_for_thread).context("failed to open SQLite database")
        })?;
        info!("tracking database at {}", db_path.display());
        Ok(Self {
            db_path: Some(Arc::new(db_path)),
            ..store
        })
    }

    /// Open a private in-memory database. Used by tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn_worker(|| {
            Connection::open_in_memory().context("failed to open in-memory SQLite database")
        })
    }

    fn spawn_worker(
        open: impl FnOnce() -> Result<Connection> + Send + 'static,
    ) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("webtrack-store".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("failed to enable WAL mode: {err}");
                }

                let init_result = conn
                    .execute_batch(SCHEMA)
                    .context("failed to initialize tracking schema");
                if ready_tx.send(init_result).is_err() {
                    error!("store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }
            })
            .context("failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref().map(|p| p.as_path())
    }

    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| StoreError::Unavailable)?;

        reply_rx.await.map_err(|_| StoreError::Unavailable)?
    }
}

fn db_err(err: rusqlite::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Database(format!("invalid datetime '{value}': {err}")))
}

fn parse_params(value: &str) -> Result<Params, StoreError> {
    Params::from_json(value)
        .map_err(|err| StoreError::Database(format!("invalid params blob: {err}")))
}

fn call_from_row(row: &Row<'_>) -> Result<Call, StoreError> {
    let view = match (
        row.get::<_, Option<i64>>(2).map_err(db_err)?,
        row.get::<_, Option<i64>>(3).map_err(db_err)?,
    ) {
        (Some(instance), Some(seq)) => Some(ViewId { instance, seq }),
        _ => None,
    };

    let status = match row.get::<_, Option<String>>(15).map_err(db_err)? {
        Some(end) => Some(CallStatus {
            end: parse_datetime(&end)?,
            body_length: row.get::<_, Option<i64>>(16).map_err(db_err)?.unwrap_or(0) as u64,
            http_status: row
                .get::<_, Option<i64>>(17)
                .map_err(db_err)?
                .map(|s| s as u16),
            err: row.get(18).map_err(db_err)?,
            panicked: row
                .get::<_, Option<bool>>(19)
                .map_err(db_err)?
                .unwrap_or(false),
        }),
        None => None,
    };

    Ok(Call {
        id: row.get(0).map_err(db_err)?,
        parent_call_id: row.get(1).map_err(db_err)?,
        view,
        app: row.get(4).map_err(db_err)?,
        host: row.get(5).map_err(db_err)?,
        remote_addr: row.get(6).map_err(db_err)?,
        user_agent: row.get(7).map_err(db_err)?,
        user: row.get(8).map_err(db_err)?,
        url: row.get(9).map_err(db_err)?,
        http_method: row.get(10).map_err(db_err)?,
        route: row.get(11).map_err(db_err)?,
        route_params: parse_params(&row.get::<_, String>(12).map_err(db_err)?)?,
        query_params: parse_params(&row.get::<_, String>(13).map_err(db_err)?)?,
        start: parse_datetime(&row.get::<_, String>(14).map_err(db_err)?)?,
        status,
    })
}

const CALL_COLUMNS: &str = "id, parent_call_id, view_instance, view_seq, app, host, \
    remote_addr, user_agent, user, url, http_method, route, route_params, query_params, \
    start, \"end\", body_length, http_status, err, panicked";

#[async_trait]
impl Store for SqliteStore {
    async fn next_client_id(&self) -> Result<i64, StoreError> {
        self.execute(|conn| {
            conn.query_row(
                "UPDATE client_id_seq SET value = value + 1 RETURNING value",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
        .await
    }

    async fn insert_instance(&self, instance: &Instance) -> Result<i64, StoreError> {
        let record = instance.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO instance (client_id, url, referrer_url, user_agent, ip_address, user, start)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.client_id,
                    record.url,
                    record.referrer_url,
                    record.user_agent,
                    record.ip_address,
                    record.user,
                    record.start.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn insert_call(&self, call: &Call) -> Result<i64, StoreError> {
        let record = call.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO call (parent_call_id, view_instance, view_seq, app, host,
                   remote_addr, user_agent, user, url, http_method, route,
                   route_params, query_params, start)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.parent_call_id,
                    record.view.map(|v| v.instance),
                    record.view.map(|v| v.seq),
                    record.app,
                    record.host,
                    record.remote_addr,
                    record.user_agent,
                    record.user,
                    record.url,
                    record.http_method,
                    record.route,
                    record.route_params.to_json(),
                    record.query_params.to_json(),
                    record.start.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn set_call_status(&self, call_id: i64, status: &CallStatus) -> Result<(), StoreError> {
        let record = status.clone();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE call SET \"end\" = ?1, body_length = ?2, http_status = ?3,
                   err = ?4, panicked = ?5
                 WHERE id = ?6",
                params![
                    record.end.to_rfc3339(),
                    record.body_length as i64,
                    record.http_status.map(|s| s as i64),
                    record.err,
                    record.panicked,
                    call_id,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn insert_view(&self, view: &View) -> Result<(), StoreError> {
        let record = view.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO \"view\" (instance_id, seq, state, params, date)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(instance_id, seq) DO UPDATE SET
                   state = excluded.state,
                   params = excluded.params,
                   date = excluded.date",
                params![
                    record.instance,
                    record.seq,
                    record.state,
                    record.params.to_json(),
                    record.date.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn query_calls(&self, filter: &CallFilter) -> Result<Vec<Call>, StoreError> {
        let filter = filter.clone();
        self.execute(move |conn| {
            let mut sql = format!("SELECT {CALL_COLUMNS} FROM call");
            let mut clauses: Vec<String> = Vec::new();
            let mut args: Vec<&dyn ToSql> = Vec::new();

            if let Some(parent) = &filter.parent_call_id {
                clauses.push(format!("parent_call_id = ?{}", args.len() + 1));
                args.push(parent);
            }
            if let Some(instance) = &filter.instance {
                clauses.push(format!("view_instance = ?{}", args.len() + 1));
                args.push(instance);
            }
            if filter.unfinished_only {
                clauses.push("\"end\" IS NULL".to_string());
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY id DESC");
            let limit = filter.limit.map(|l| l as i64);
            if let Some(l) = &limit {
                sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
                args.push(l);
            }

            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let mut rows = stmt.query(&args[..]).map_err(db_err)?;
            let mut calls = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                calls.push(call_from_row(row)?);
            }
            Ok(calls)
        })
        .await
    }

    async fn query_views(&self, filter: &ViewFilter) -> Result<Vec<View>, StoreError> {
        let filter = filter.clone();
        self.execute(move |conn| {
            let mut sql =
                String::from("SELECT instance_id, seq, state, params, date FROM \"view\"");
            let mut args: Vec<&dyn ToSql> = Vec::new();

            if let Some(instance) = &filter.instance {
                sql.push_str(&format!(" WHERE instance_id = ?{}", args.len() + 1));
                args.push(instance);
            }
            sql.push_str(" ORDER BY instance_id DESC, seq DESC");
            let limit = filter.limit.map(|l| l as i64);
            if let Some(l) = &limit {
                sql.push_str(&format!(" LIMIT ?{}", args.len() + 1));
                args.push(l);
            }

            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let mut rows = stmt.query(&args[..]).map_err(db_err)?;
            let mut views = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                views.push(View {
                    instance: row.get(0).map_err(db_err)?,
                    seq: row.get(1).map_err(db_err)?,
                    state: row.get(2).map_err(db_err)?,
                    params: parse_params(&row.get::<_, String>(3).map_err(db_err)?)?,
                    date: parse_datetime(&row.get::<_, String>(4).map_err(db_err)?)?,
                });
            }
            Ok(views)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_call() -> Call {
        let mut route_params = Params::default();
        route_params.insert("id", json!("123"));
        let mut query_params = Params::default();
        query_params.insert("foo", json!(["bar"]));
        Call {
            id: 0,
            parent_call_id: Some(7),
            view: Some(ViewId {
                instance: 3,
                seq: 1,
            }),
            app: "web".to_string(),
            host: "testhost".to_string(),
            remote_addr: "1.2.3.4".to_string(),
            user_agent: "test-agent".to_string(),
            user: Some("alice".to_string()),
            url: "/api/contacts/123?foo=bar".to_string(),
            http_method: "GET".to_string(),
            route: Some("/api/contacts/{id}".to_string()),
            route_params,
            query_params,
            start: Utc::now(),
            status: None,
        }
    }

    #[tokio::test]
    async fn client_id_sequence_is_monotonic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.next_client_id().await.unwrap();
        let b = store.next_client_id().await.unwrap();
        let c = store.next_client_id().await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(c, 3);
    }

    #[tokio::test]
    async fn call_round_trip_with_status() {
        let store = SqliteStore::open_in_memory().unwrap();
        let call = sample_call();
        let id = store.insert_call(&call).await.unwrap();
        assert!(id > 0);

        // Unfinished until a status lands.
        let unfinished = store
            .query_calls(&CallFilter {
                unfinished_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 1);

        let status = CallStatus {
            end: Utc::now(),
            body_length: 512,
            http_status: Some(201),
            err: None,
            panicked: false,
        };
        store.set_call_status(id, &status).await.unwrap();

        let calls = store.query_calls(&CallFilter::default()).await.unwrap();
        assert_eq!(calls.len(), 1);
        let got = &calls[0];
        assert_eq!(got.id, id);
        assert_eq!(got.parent_call_id, Some(7));
        assert_eq!(got.view, call.view);
        assert_eq!(got.route_params, call.route_params);
        assert_eq!(got.query_params, call.query_params);
        let got_status = got.status.as_ref().unwrap();
        assert_eq!(got_status.body_length, 512);
        assert_eq!(got_status.http_status, Some(201));
        assert!(!got_status.panicked);

        let unfinished = store
            .query_calls(&CallFilter {
                unfinished_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(unfinished.is_empty());
    }

    #[tokio::test]
    async fn query_calls_filters_by_parent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let root = Call {
            parent_call_id: None,
            ..sample_call()
        };
        let root_id = store.insert_call(&root).await.unwrap();
        let child = Call {
            parent_call_id: Some(root_id),
            ..sample_call()
        };
        store.insert_call(&child).await.unwrap();

        let children = store
            .query_calls(&CallFilter {
                parent_call_id: Some(root_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_call_id, Some(root_id));
    }

    #[tokio::test]
    async fn view_upsert_overwrites_same_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut view = View {
            instance: 5,
            seq: 2,
            state: "contacts.list".to_string(),
            params: Params::default(),
            date: Utc::now(),
        };
        store.insert_view(&view).await.unwrap();

        view.state = "contacts.detail".to_string();
        store.insert_view(&view).await.unwrap();

        let views = store
            .query_views(&ViewFilter {
                instance: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].state, "contacts.detail");
    }

    #[tokio::test]
    async fn open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.db");
        let store = SqliteStore::open(path.clone()).unwrap();
        store.next_client_id().await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
