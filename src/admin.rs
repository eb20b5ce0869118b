//! App and handler lifecycle.

use crate::error::{Error, Result};
use crate::model::{self, AppSummary, Handler, LogEntry, NewApp};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Administration operations over a store.
#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn Store>,
}

impl Admin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register an app with its ordered handlers.
    ///
    /// Every handler is validated before anything is stored, and the app is
    /// stored together with its handlers, so a rejected app leaves no trace
    /// and no request ever sees a partial handler list.
    pub async fn create_app(&self, app: NewApp) -> Result<AppSummary> {
        let id = match app.id {
            Some(id) => {
                model::validate_app_id(&id).map_err(Error::Invalid)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        if app.handlers.is_keyed() {
            warn!(
                app_id = %id,
                "Handlers supplied as a keyed object; prefer an ordered list"
            );
        }

        let handlers: Vec<Handler> = app
            .handlers
            .into_ordered()
            .into_iter()
            .map(normalize)
            .collect();

        let mut seen = HashSet::new();
        for handler in &handlers {
            handler.validate().map_err(Error::Invalid)?;
            if !seen.insert(handler.id.as_str()) {
                return Err(Error::Conflict(format!(
                    "Handler {} already exists in app {}.",
                    handler.id, id
                )));
            }
        }

        let summary = AppSummary::new(id, Utc::now());
        let count = handlers.len();
        self.store.create_app(summary.clone(), handlers).await?;

        info!(app_id = %summary.id, handlers = count, "App created");
        Ok(summary)
    }

    /// Append a handler to an existing app.
    pub async fn create_handler(&self, app_id: &str, handler: Handler) -> Result<Handler> {
        let handler = normalize(handler);
        handler.validate().map_err(Error::Invalid)?;

        self.store.create_handler(app_id, handler.clone()).await?;
        info!(app_id = %app_id, handler_id = %handler.id, "Handler created");
        Ok(handler)
    }

    pub async fn list_apps(&self) -> Result<Vec<AppSummary>> {
        Ok(self.store.list_apps().await?)
    }

    pub async fn retrieve_app(&self, app_id: &str) -> Result<AppSummary> {
        Ok(self.store.retrieve_app(app_id).await?)
    }

    /// Remove an app with its handlers and logs. Not idempotent.
    pub async fn delete_app(&self, app_id: &str) -> Result<()> {
        self.store.delete_app(app_id).await?;
        info!(app_id = %app_id, "App deleted");
        Ok(())
    }

    pub async fn list_handlers(&self, app_id: &str) -> Result<Vec<Handler>> {
        Ok(self.store.list_handlers(app_id).await?)
    }

    pub async fn retrieve_handler(&self, app_id: &str, handler_id: &str) -> Result<Handler> {
        Ok(self.store.retrieve_handler(app_id, handler_id).await?)
    }

    pub async fn list_logs(&self, app_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.store.list_logs(app_id).await?)
    }

    /// Clear an app's logs; handler match counts are kept.
    pub async fn delete_logs(&self, app_id: &str) -> Result<()> {
        self.store.delete_logs(app_id).await?;
        info!(app_id = %app_id, "Logs deleted");
        Ok(())
    }
}

/// Reset counters and fold a zero cap into "unlimited".
fn normalize(mut handler: Handler) -> Handler {
    handler.total_matches = 0;
    if handler.max_matches == Some(0) {
        handler.max_matches = None;
    }
    handler
}
