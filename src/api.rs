//! HTTP surface.
//!
//! Administration routes sit behind optional HTTP Basic authentication;
//! `/apps/{app_id}/test/*` is open and answered by the dispatcher.

use crate::admin::Admin;
use crate::config::{GlobalSettings, ServerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::model::{Handler, LogEntry, NewApp, RequestDescriptor, ResponseSpec};
use crate::store::Store;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Extension, Json, Router,
};
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct ApiState {
    pub admin: Admin,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ServerConfig>,
}

impl ApiState {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        Self {
            admin: Admin::new(store.clone()),
            dispatcher: Arc::new(Dispatcher::new(store, config.settings.clone())),
            config: Arc::new(config),
        }
    }

    /// Register the apps listed in the configuration.
    pub async fn register_configured_apps(&self) -> crate::error::Result<()> {
        for app in &self.config.apps {
            let summary = self.admin.create_app(app.clone()).await?;
            info!(app_id = %summary.id, url = %summary.url, "Registered configured app");
        }
        Ok(())
    }
}

/// Build the router with all routes and layers.
pub fn router(state: ApiState) -> Router {
    let admin_routes = Router::new()
        .route("/options", get(get_options))
        .route("/stats", get(get_stats))
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/{app_id}", get(retrieve_app).delete(delete_app))
        .route(
            "/apps/{app_id}/handlers",
            get(list_handlers).post(create_handler),
        )
        .route("/apps/{app_id}/handlers/{handler_id}", get(retrieve_handler))
        .route("/apps/{app_id}/logs", get(list_logs).delete(delete_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let test_routes = Router::new()
        .route("/apps/{app_id}/test", any(invoke))
        .route("/apps/{app_id}/test/", any(invoke))
        .route("/apps/{app_id}/test/{*rest}", any(invoke))
        .route_layer(middleware::from_fn(override_method));

    let log_requests = state.config.settings.log_requests;
    let router = admin_routes.merge(test_routes).with_state(state);

    if log_requests {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Serve until Ctrl+C.
pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(address = %addr, "HTTP server starting");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

pub(crate) async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Scheme of the connection a test request arrived on. Set by the HTTPS
/// listener; its absence means plain HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionScheme {
    Http,
    Https,
}

impl ConnectionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionScheme::Http => "http",
            ConnectionScheme::Https => "https",
        }
    }
}

/// Error response: `{"message": ...}` with a status per error kind.
#[derive(Debug)]
pub enum ApiError {
    Engine(Error),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Engine(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Engine(Error::Invalid(rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Engine(err) => {
                let status = match err {
                    Error::NotFound(_) => StatusCode::NOT_FOUND,
                    Error::Conflict(_) => StatusCode::CONFLICT,
                    Error::Invalid(_) => StatusCode::BAD_REQUEST,
                    Error::NoMatchFound { .. } | Error::Persistence(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
        };

        if status.is_server_error() {
            error!(error = ?self, "Request failed");
        }

        (status, Json(ErrorBody { message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn require_auth(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(auth) = &state.config.auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic_credentials)
        .map(|(username, password)| username == auth.username && password == auth.password)
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=Authorization Required")],
        )
            .into_response()
    }
}

/// Decode an `Authorization: Basic ...` value into username and password.
fn decode_basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

async fn get_options(State(state): State<ApiState>) -> Json<ServerConfig> {
    Json(state.config.redacted())
}

async fn get_stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.dispatcher.stats())
}

async fn create_app(
    State(state): State<ApiState>,
    payload: Result<Json<NewApp>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(app) = payload?;
    let summary = state.admin.create_app(app).await?;
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, summary.url.clone())],
        Json(summary),
    )
        .into_response())
}

async fn list_apps(State(state): State<ApiState>) -> ApiResult<Response> {
    Ok(Json(state.admin.list_apps().await?).into_response())
}

async fn retrieve_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.admin.retrieve_app(&app_id).await?).into_response())
}

async fn delete_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.admin.delete_app(&app_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_handler(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    payload: Result<Json<Handler>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(handler) = payload?;
    let handler = state.admin.create_handler(&app_id, handler).await?;
    let location = format!("/apps/{}/handlers/{}", app_id, handler.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(handler)).into_response())
}

async fn list_handlers(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.admin.list_handlers(&app_id).await?).into_response())
}

async fn retrieve_handler(
    State(state): State<ApiState>,
    Path((app_id, handler_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    Ok(Json(state.admin.retrieve_handler(&app_id, &handler_id).await?).into_response())
}

#[derive(Serialize)]
struct LogList {
    items: Vec<LogEntry>,
}

async fn list_logs(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> ApiResult<Response> {
    let items = state.admin.list_logs(&app_id).await?;
    Ok(Json(LogList { items }).into_response())
}

async fn delete_logs(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.admin.delete_logs(&app_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Let POST requests tunnel another method through the `__method` query
/// parameter or the `X-HTTP-Method-Override` header; the header wins.
async fn override_method(mut request: Request, next: Next) -> Response {
    if request.method() == Method::POST {
        let from_query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(params)| params.get("__method").cloned());
        let from_header = request
            .headers()
            .get("x-http-method-override")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        for candidate in [from_query, from_header].into_iter().flatten() {
            match Method::from_bytes(candidate.trim().to_ascii_uppercase().as_bytes()) {
                Ok(method) => *request.method_mut() = method,
                Err(_) => debug!(method = %candidate, "Ignoring invalid method override"),
            }
        }
    }
    next.run(request).await
}

/// `ANY /apps/{app_id}/test/*`
async fn invoke(
    State(state): State<ApiState>,
    Path(params): Path<HashMap<String, String>>,
    scheme: Option<Extension<ConnectionScheme>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let app_id = params
        .get("app_id")
        .cloned()
        .ok_or_else(|| ApiError::Internal("missing app id".to_string()))?;

    let scheme = scheme.map_or(ConnectionScheme::Http, |Extension(scheme)| scheme);
    let request = describe_request(
        &app_id,
        params.get("rest"),
        scheme,
        &method,
        &uri,
        &headers,
        &body,
    );
    let simulation = state.dispatcher.simulate(&app_id, request).await?;

    let response = state
        .dispatcher
        .schedule(simulation.response)
        .await
        .map_err(|_| ApiError::Internal("delayed response was dropped".to_string()))?;

    render_response(response, &state.config.settings)
}

/// Snapshot an inbound test request.
///
/// The protocol comes from `X-Forwarded-Proto` when a proxy set it, and
/// from the connection otherwise.
fn describe_request(
    app_id: &str,
    rest: Option<&String>,
    scheme: ConnectionScheme,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> RequestDescriptor {
    let prefix = format!("/apps/{}/test", app_id);
    let mut relative_url = match uri.path().strip_prefix(&prefix) {
        Some(path) => path.to_string(),
        None => format!("/{}", rest.map(String::as_str).unwrap_or("")),
    };
    if let Some(query) = uri.query() {
        relative_url.push('?');
        relative_url.push_str(query);
    }

    let full_url = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let protocol = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| scheme.as_str().to_string());

    let mut header_map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        header_map
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let body = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
            }),
        )
    };

    RequestDescriptor::new(&protocol, method.as_str(), &relative_url)
        .with_full_url(full_url)
        .with_headers(header_map)
        .with_body(body)
}

/// Emit a handler's canned response.
fn render_response(spec: ResponseSpec, settings: &GlobalSettings) -> ApiResult<Response> {
    let status = StatusCode::from_u16(spec.status)
        .map_err(|e| ApiError::Internal(format!("invalid status {}: {}", spec.status, e)))?;

    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;

    for (name, value) in &spec.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                if name == header::CONTENT_TYPE {
                    has_content_type = true;
                }
                builder = builder.header(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }

    let body = match &spec.body {
        Some(body) => {
            if !has_content_type {
                builder = builder.header(header::CONTENT_TYPE, settings.default_content_type.as_str());
            }
            let bytes = serde_json::to_vec(body)
                .map_err(|e| ApiError::Internal(format!("failed to encode body: {}", e)))?;
            Body::from(bytes)
        }
        None => Body::empty(),
    };

    builder
        .body(body)
        .map_err(|e| ApiError::Internal(format!("failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pa:ss");
        let decoded = decode_basic_credentials(&format!("Basic {}", encoded)).unwrap();
        assert_eq!(decoded, ("user".to_string(), "pa:ss".to_string()));

        assert!(decode_basic_credentials("Bearer token").is_none());
        assert!(decode_basic_credentials("Basic !!!").is_none());
    }

    #[test]
    fn test_describe_request() {
        let uri: Uri = "/apps/a1/test/users/123?expand=true".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS, http"));
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let rest = "users/123".to_string();

        let request = describe_request(
            "a1",
            Some(&rest),
            ConnectionScheme::Http,
            &Method::GET,
            &uri,
            &headers,
            &Bytes::from_static(br#"{"name":"x"}"#),
        );

        assert_eq!(request.protocol, "https");
        assert_eq!(request.method, "GET");
        assert_eq!(request.relative_url, "/users/123?expand=true");
        assert_eq!(request.full_url, "/apps/a1/test/users/123?expand=true");
        assert_eq!(request.path(), "/users/123");
        assert_eq!(request.headers["accept"], "text/plain, application/json");
        assert_eq!(request.body.unwrap()["name"], "x");
    }

    #[test]
    fn test_describe_request_plain_body() {
        let uri: Uri = "/apps/a1/test".parse().unwrap();
        let request = describe_request(
            "a1",
            None,
            ConnectionScheme::Http,
            &Method::POST,
            &uri,
            &HeaderMap::new(),
            &Bytes::from_static(b"not json"),
        );

        assert_eq!(request.protocol, "http");
        assert_eq!(request.path(), "/");
        assert_eq!(request.body, Some(serde_json::Value::String("not json".to_string())));
    }

    #[test]
    fn test_describe_request_connection_scheme() {
        let uri: Uri = "/apps/a1/test/".parse().unwrap();
        let request = describe_request(
            "a1",
            None,
            ConnectionScheme::Https,
            &Method::GET,
            &uri,
            &HeaderMap::new(),
            &Bytes::new(),
        );
        assert_eq!(request.protocol, "https");
        assert_eq!(request.relative_url, "/");
        assert!(request.body.is_none());

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        let request = describe_request(
            "a1",
            None,
            ConnectionScheme::Https,
            &Method::GET,
            &uri,
            &headers,
            &Bytes::new(),
        );
        assert_eq!(request.protocol, "http");
    }

    #[test]
    fn test_render_response() {
        let mut spec = ResponseSpec {
            status: 201,
            body: Some(serde_json::json!({"ok": true})),
            ..Default::default()
        };
        spec.headers.insert("X-Mock".to_string(), "yes".to_string());
        spec.headers.insert("Bad Header".to_string(), "x".to_string());

        let response = render_response(spec, &GlobalSettings::default()).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-mock"], "yes");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
    }

    #[test]
    fn test_render_response_keeps_configured_content_type() {
        let mut spec = ResponseSpec {
            body: Some(serde_json::json!("hello")),
            ..Default::default()
        };
        spec.headers.insert("Content-Type".to_string(), "text/plain".to_string());

        let response = render_response(spec, &GlobalSettings::default()).unwrap();
        let values: Vec<_> = response.headers().get_all(header::CONTENT_TYPE).iter().collect();
        assert_eq!(values, vec!["text/plain"]);
    }

    #[test]
    fn test_render_response_without_body() {
        let response = render_response(ResponseSpec::default(), &GlobalSettings::default()).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
    }
}
