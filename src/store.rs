//! Persistence for apps, handlers and logs.
//!
//! The engine only talks to the [`Store`] trait. [`MemoryStore`] is the
//! in-process implementation used by the server and the tests.

use crate::model::{AppSummary, Handler, LogEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Errors reported by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("App {0} does not exist.")]
    AppNotFound(String),

    #[error("Handler {handler_id} does not exist in app {app_id}.")]
    HandlerNotFound { app_id: String, handler_id: String },

    #[error("App {0} already exists.")]
    AppExists(String),

    #[error("Handler {handler_id} already exists in app {app_id}.")]
    HandlerExists { app_id: String, handler_id: String },

    /// The handler reached its match cap before this match could be counted
    #[error("Handler {handler_id} in app {app_id} has reached its match limit.")]
    Exhausted { app_id: String, handler_id: String },

    #[error("{0}")]
    Backend(String),
}

/// Storage interface required by administration and the dispatcher.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register an app together with its ordered handlers in one step.
    /// Nothing is stored when any handler id is duplicated.
    async fn create_app(&self, app: AppSummary, handlers: Vec<Handler>)
        -> Result<(), StoreError>;

    /// Apps ordered most recently created first.
    async fn list_apps(&self) -> Result<Vec<AppSummary>, StoreError>;

    async fn retrieve_app(&self, app_id: &str) -> Result<AppSummary, StoreError>;

    /// Remove an app together with its handlers and logs.
    async fn delete_app(&self, app_id: &str) -> Result<(), StoreError>;

    /// Append a handler to the app's ordered handler list.
    async fn create_handler(&self, app_id: &str, handler: Handler) -> Result<(), StoreError>;

    /// Handlers in insertion order, with current match counts.
    async fn list_handlers(&self, app_id: &str) -> Result<Vec<Handler>, StoreError>;

    async fn retrieve_handler(&self, app_id: &str, handler_id: &str)
        -> Result<Handler, StoreError>;

    /// Record a match: atomically check the handler's cap and bump its
    /// count, then append the log. Fails with [`StoreError::Exhausted`]
    /// when the cap was already reached.
    async fn create_log(
        &self,
        app_id: &str,
        handler_id: &str,
        log: LogEntry,
    ) -> Result<(), StoreError>;

    async fn list_logs(&self, app_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Clear the app's logs, leaving handlers and their counts alone.
    async fn delete_logs(&self, app_id: &str) -> Result<(), StoreError>;
}

/// In-memory store.
///
/// Each app is an independent record; match counts are atomics so that the
/// cap check and increment is a single compare-and-swap per handler.
#[derive(Default)]
pub struct MemoryStore {
    apps: RwLock<HashMap<String, Arc<AppRecord>>>,
    sequence: AtomicU64,
}

struct AppRecord {
    summary: AppSummary,
    /// Creation order, used to list newest first
    sequence: u64,
    handlers: RwLock<Vec<StoredHandler>>,
    logs: Mutex<Vec<LogEntry>>,
}

struct StoredHandler {
    handler: Handler,
    total_matches: AtomicU32,
}

impl StoredHandler {
    fn new(mut handler: Handler) -> Self {
        let total_matches = AtomicU32::new(handler.total_matches);
        handler.total_matches = 0;
        Self {
            handler,
            total_matches,
        }
    }

    fn snapshot(&self) -> Handler {
        let mut handler = self.handler.clone();
        handler.total_matches = self.total_matches.load(Ordering::SeqCst);
        handler
    }

    /// Count one match unless the cap is reached.
    fn try_claim(&self) -> bool {
        let max_matches = self.handler.max_matches;
        self.total_matches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match max_matches {
                    Some(max) if current >= max => None,
                    _ => Some(current.saturating_add(1)),
                }
            })
            .is_ok()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn app(&self, app_id: &str) -> Result<Arc<AppRecord>, StoreError> {
        self.apps
            .read()
            .await
            .get(app_id)
            .cloned()
            .ok_or_else(|| StoreError::AppNotFound(app_id.to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_app(
        &self,
        app: AppSummary,
        handlers: Vec<Handler>,
    ) -> Result<(), StoreError> {
        let mut stored: Vec<StoredHandler> = Vec::with_capacity(handlers.len());
        for handler in handlers {
            if stored.iter().any(|s| s.handler.id == handler.id) {
                return Err(StoreError::HandlerExists {
                    app_id: app.id,
                    handler_id: handler.id,
                });
            }
            stored.push(StoredHandler::new(handler));
        }

        let mut apps = self.apps.write().await;
        if apps.contains_key(&app.id) {
            return Err(StoreError::AppExists(app.id));
        }

        let record = AppRecord {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            summary: app,
            handlers: RwLock::new(stored),
            logs: Mutex::new(Vec::new()),
        };
        apps.insert(record.summary.id.clone(), Arc::new(record));
        Ok(())
    }

    async fn list_apps(&self) -> Result<Vec<AppSummary>, StoreError> {
        let apps = self.apps.read().await;
        let mut records: Vec<_> = apps.values().collect();
        records.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(records.into_iter().map(|r| r.summary.clone()).collect())
    }

    async fn retrieve_app(&self, app_id: &str) -> Result<AppSummary, StoreError> {
        Ok(self.app(app_id).await?.summary.clone())
    }

    async fn delete_app(&self, app_id: &str) -> Result<(), StoreError> {
        self.apps
            .write()
            .await
            .remove(app_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::AppNotFound(app_id.to_string()))
    }

    async fn create_handler(&self, app_id: &str, handler: Handler) -> Result<(), StoreError> {
        let app = self.app(app_id).await?;
        let mut handlers = app.handlers.write().await;
        if handlers.iter().any(|s| s.handler.id == handler.id) {
            return Err(StoreError::HandlerExists {
                app_id: app_id.to_string(),
                handler_id: handler.id,
            });
        }
        handlers.push(StoredHandler::new(handler));
        Ok(())
    }

    async fn list_handlers(&self, app_id: &str) -> Result<Vec<Handler>, StoreError> {
        let app = self.app(app_id).await?;
        let handlers = app.handlers.read().await;
        Ok(handlers.iter().map(StoredHandler::snapshot).collect())
    }

    async fn retrieve_handler(
        &self,
        app_id: &str,
        handler_id: &str,
    ) -> Result<Handler, StoreError> {
        let app = self.app(app_id).await?;
        let handlers = app.handlers.read().await;
        handlers
            .iter()
            .find(|s| s.handler.id == handler_id)
            .map(StoredHandler::snapshot)
            .ok_or_else(|| StoreError::HandlerNotFound {
                app_id: app_id.to_string(),
                handler_id: handler_id.to_string(),
            })
    }

    async fn create_log(
        &self,
        app_id: &str,
        handler_id: &str,
        log: LogEntry,
    ) -> Result<(), StoreError> {
        let app = self.app(app_id).await?;
        let handlers = app.handlers.read().await;
        let stored = handlers
            .iter()
            .find(|s| s.handler.id == handler_id)
            .ok_or_else(|| StoreError::HandlerNotFound {
                app_id: app_id.to_string(),
                handler_id: handler_id.to_string(),
            })?;

        if !stored.try_claim() {
            debug!(app_id = %app_id, handler_id = %handler_id, "Match limit reached");
            return Err(StoreError::Exhausted {
                app_id: app_id.to_string(),
                handler_id: handler_id.to_string(),
            });
        }

        app.logs.lock().await.push(log);
        Ok(())
    }

    async fn list_logs(&self, app_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let app = self.app(app_id).await?;
        let logs = app.logs.lock().await;
        Ok(logs.clone())
    }

    async fn delete_logs(&self, app_id: &str) -> Result<(), StoreError> {
        let app = self.app(app_id).await?;
        app.logs.lock().await.clear();
        Ok(())
    }
}
