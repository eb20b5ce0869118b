//! Simulated request dispatch.
//!
//! Resolves the app, picks a handler, counts and logs the match, then hands
//! the canned response to a timer task that releases it after the handler's
//! delay.

use crate::config::GlobalSettings;
use crate::error::{Error, Result};
use crate::matcher;
use crate::model::{LogEntry, RequestDescriptor, ResponseSpec};
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A committed match: the log entry already persisted and the response to
/// emit.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub log: LogEntry,
    pub response: ResponseSpec,
}

/// Request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
}

/// Dispatches test requests against the handlers of an app.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    settings: GlobalSettings,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Total requests matched to handlers.
    requests_matched: AtomicU64,
    /// Total requests with no eligible handler.
    requests_unmatched: AtomicU64,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, settings: GlobalSettings) -> Self {
        Self {
            store,
            settings,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
        }
    }

    /// Match a request and commit the match.
    ///
    /// On success the log entry is already stored. When another caller takes
    /// the last match of the selected handler first, the scan is repeated
    /// with fresh counts, so the request falls through to the next eligible
    /// handler exactly as a sequential run would.
    pub async fn simulate(&self, app_id: &str, request: RequestDescriptor) -> Result<Simulation> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        self.store.retrieve_app(app_id).await?;

        loop {
            let handlers = self.store.list_handlers(app_id).await?;

            let Some(handler) = matcher::find_match(&handlers, &request) else {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        app_id = %app_id,
                        method = %request.method,
                        path = %request.path(),
                        "No matching handler found"
                    );
                }
                return Err(Error::NoMatchFound {
                    app_id: app_id.to_string(),
                    method: request.method.clone(),
                    path: request.path().to_string(),
                });
            };

            let log = LogEntry::new(request.clone(), handler);
            match self.store.create_log(app_id, &handler.id, log.clone()).await {
                Ok(()) => {
                    self.requests_matched.fetch_add(1, Ordering::Relaxed);
                    if self.settings.log_matches {
                        info!(
                            app_id = %app_id,
                            handler_id = %handler.id,
                            method = %request.method,
                            path = %request.path(),
                            "Request matched handler"
                        );
                    }
                    return Ok(Simulation {
                        log,
                        response: handler.response.clone(),
                    });
                }
                Err(StoreError::Exhausted { handler_id, .. }) => {
                    debug!(
                        app_id = %app_id,
                        handler_id = %handler_id,
                        "Handler exhausted by a concurrent request, rescanning"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Release a response after its configured delay.
    ///
    /// The delay runs on its own timer task, so it holds no worker and is
    /// not cancelled when the caller stops waiting.
    pub fn schedule(&self, response: ResponseSpec) -> oneshot::Receiver<ResponseSpec> {
        let (tx, rx) = oneshot::channel();
        let delay = response.delay();

        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "Applying delay");
                tokio::time::sleep(delay).await;
            }
            if tx.send(response).is_err() {
                debug!("Caller went away before the response was emitted");
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::Admin;
    use crate::matcher::UrlPattern;
    use crate::model::{Handler, HandlerCollection, NewApp, RequestSpec};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::time::Instant;

    fn users_handler(id: &str, status: u16, max_matches: Option<u32>) -> Handler {
        Handler {
            id: id.to_string(),
            request: RequestSpec {
                method: Some("GET".to_string()),
                url_pattern: Some(UrlPattern::parse("/users/:id").unwrap()),
                ..Default::default()
            },
            response: ResponseSpec {
                status,
                ..Default::default()
            },
            max_matches,
            total_matches: 0,
        }
    }

    async fn setup(handlers: Vec<Handler>) -> (Arc<Dispatcher>, Admin, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = Admin::new(store.clone());
        let app = admin
            .create_app(NewApp {
                id: None,
                handlers: HandlerCollection::Ordered(handlers),
            })
            .await
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(store, GlobalSettings::default()));
        (dispatcher, admin, app.id)
    }

    fn get_user() -> RequestDescriptor {
        RequestDescriptor::new("http", "GET", "/users/123")
    }

    #[tokio::test]
    async fn test_max_matches_falls_through() {
        let (dispatcher, admin, app_id) = setup(vec![
            users_handler("H1", 500, Some(1)),
            users_handler("H2", 200, None),
        ])
        .await;

        let first = dispatcher.simulate(&app_id, get_user()).await.unwrap();
        assert_eq!(first.log.handler_id, "H1");
        assert_eq!(first.response.status, 500);

        let second = dispatcher.simulate(&app_id, get_user()).await.unwrap();
        assert_eq!(second.log.handler_id, "H2");
        assert_eq!(second.response.status, 200);

        let logs = admin.list_logs(&app_id).await.unwrap();
        let ids: Vec<_> = logs.iter().map(|l| l.handler_id.as_str()).collect();
        assert_eq!(ids, vec!["H1", "H2"]);
        assert_eq!(logs[0].request.relative_url, "/users/123");
    }

    #[tokio::test]
    async fn test_unknown_app_is_not_found() {
        let (dispatcher, _admin, _app_id) = setup(vec![]).await;
        let err = dispatcher.simulate("missing", get_user()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_eligible_handler() {
        let (dispatcher, admin, app_id) = setup(vec![users_handler("H1", 200, Some(1))]).await;

        dispatcher.simulate(&app_id, get_user()).await.unwrap();
        let err = dispatcher.simulate(&app_id, get_user()).await.unwrap_err();
        assert!(matches!(err, Error::NoMatchFound { .. }));

        let err = dispatcher
            .simulate(&app_id, RequestDescriptor::new("http", "POST", "/users/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchFound { .. }));

        assert_eq!(admin.list_logs(&app_id).await.unwrap().len(), 1);
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                requests_total: 3,
                requests_matched: 1,
                requests_unmatched: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_log_is_written_before_the_delay() {
        let mut slow = users_handler("slow", 200, None);
        slow.response.delay_millis = Some(60_000);
        let (dispatcher, admin, app_id) = setup(vec![slow]).await;

        let simulation = dispatcher.simulate(&app_id, get_user()).await.unwrap();
        let _pending = dispatcher.schedule(simulation.response);

        let logs = admin.list_logs(&app_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0], simulation.log);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_respect_cap() {
        let (dispatcher, admin, app_id) = setup(vec![
            users_handler("capped", 500, Some(5)),
            users_handler("fallback", 200, None),
        ])
        .await;

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let dispatcher = dispatcher.clone();
            let app_id = app_id.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.simulate(&app_id, get_user()).await
            }));
        }

        let mut capped = 0;
        let mut fallback = 0;
        for task in tasks {
            let simulation = task.await.unwrap().unwrap();
            match simulation.log.handler_id.as_str() {
                "capped" => capped += 1,
                "fallback" => fallback += 1,
                other => panic!("unexpected handler {}", other),
            }
        }
        assert_eq!(capped, 5);
        assert_eq!(fallback, 35);

        let handler = admin.retrieve_handler(&app_id, "capped").await.unwrap();
        assert_eq!(handler.total_matches, 5);
        assert_eq!(admin.list_logs(&app_id).await.unwrap().len(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_without_fallback() {
        let (dispatcher, admin, app_id) = setup(vec![users_handler("only", 200, Some(3))]).await;

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let dispatcher = dispatcher.clone();
            let app_id = app_id.clone();
            tasks.push(tokio::spawn(async move {
                dispatcher.simulate(&app_id, get_user()).await
            }));
        }

        let mut matched = 0;
        let mut unmatched = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => matched += 1,
                Err(Error::NoMatchFound { .. }) => unmatched += 1,
                Err(other) => panic!("unexpected error {}", other),
            }
        }
        assert_eq!(matched, 3);
        assert_eq!(unmatched, 17);
        assert_eq!(admin.list_logs(&app_id).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_honored() {
        let (dispatcher, _admin, _app_id) = setup(vec![]).await;
        let slow = ResponseSpec {
            delay_millis: Some(3000),
            ..Default::default()
        };

        let start = Instant::now();
        let response = dispatcher.schedule(slow).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert_eq!(response.status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_does_not_block_other_responses() {
        let (dispatcher, _admin, _app_id) = setup(vec![]).await;
        let slow = ResponseSpec {
            delay_millis: Some(3000),
            ..Default::default()
        };
        let fast = ResponseSpec {
            status: 201,
            ..Default::default()
        };

        let start = Instant::now();
        let slow_rx = dispatcher.schedule(slow);
        let fast_rx = dispatcher.schedule(fast);

        let response = fast_rx.await.unwrap();
        assert_eq!(response.status, 201);
        assert!(start.elapsed() < Duration::from_millis(3000));

        slow_rx.await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_response_is_harmless() {
        let (dispatcher, _admin, _app_id) = setup(vec![]).await;
        let rx = dispatcher.schedule(ResponseSpec {
            delay_millis: Some(100),
            ..Default::default()
        });
        drop(rx);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
