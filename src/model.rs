//! Apps, handlers and log entries.
//!
//! Field names serialize in camelCase, which is the wire format of the
//! administration API.

use crate::matcher::UrlPattern;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// URL of an app on the administration API.
pub fn app_url(app_id: &str) -> String {
    format!("/apps/{}", app_id)
}

/// Check that a client-chosen app id is usable as a single URL path
/// segment: unreserved characters only, and not a dot segment.
pub fn validate_app_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("app id cannot be empty".to_string());
    }
    if id == "." || id == ".." {
        return Err(format!("app id '{}' is a dot segment", id));
    }
    let unreserved = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-');
    if !id.chars().all(unreserved) {
        return Err(format!(
            "app id '{}' may only contain letters, digits, '.', '_', '~' and '-'",
            id
        ));
    }
    Ok(())
}

/// Public representation of a registered app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSummary {
    pub id: String,
    pub url: String,
    pub created: DateTime<Utc>,
}

impl AppSummary {
    pub fn new(id: impl Into<String>, created: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            url: app_url(&id),
            id,
            created,
        }
    }
}

/// Registration payload for a new app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewApp {
    /// Explicit id; one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub handlers: HandlerCollection,
}

/// Handlers as supplied by a client.
///
/// The ordered form is canonical. The keyed form is accepted for
/// compatibility and keeps the order its keys were written in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandlerCollection {
    Ordered(Vec<Handler>),
    Keyed(KeyedHandlers),
}

/// Handlers keyed by id, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedHandlers(pub Vec<(String, Handler)>);

impl Serialize for KeyedHandlers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(id, handler)| (id, handler)))
    }
}

impl<'de> Deserialize<'de> for KeyedHandlers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyedVisitor;

        impl<'de> Visitor<'de> for KeyedVisitor {
            type Value = KeyedHandlers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of handler id to handler")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, handler)) = map.next_entry::<String, NullableHandler>()? {
                    entries.push((id, handler.0));
                }
                Ok(KeyedHandlers(entries))
            }
        }

        deserializer.deserialize_map(KeyedVisitor)
    }
}

/// A keyed entry may be `null`, which stands for a default handler.
struct NullableHandler(Handler);

impl<'de> Deserialize<'de> for NullableHandler {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        null_as_default(deserializer).map(NullableHandler)
    }
}

impl Default for HandlerCollection {
    fn default() -> Self {
        HandlerCollection::Ordered(Vec::new())
    }
}

impl HandlerCollection {
    pub fn is_keyed(&self) -> bool {
        matches!(self, HandlerCollection::Keyed(_))
    }

    pub fn len(&self) -> usize {
        match self {
            HandlerCollection::Ordered(handlers) => handlers.len(),
            HandlerCollection::Keyed(KeyedHandlers(handlers)) => handlers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into an explicit ordered list.
    ///
    /// Ordered handlers without an id get their ordinal index; keyed
    /// handlers take their key as id.
    pub fn into_ordered(self) -> Vec<Handler> {
        match self {
            HandlerCollection::Ordered(handlers) => handlers
                .into_iter()
                .enumerate()
                .map(|(ordinal, mut handler)| {
                    if handler.id.is_empty() {
                        handler.id = ordinal.to_string();
                    }
                    handler
                })
                .collect(),
            HandlerCollection::Keyed(KeyedHandlers(handlers)) => handlers
                .into_iter()
                .map(|(id, mut handler)| {
                    handler.id = id;
                    handler
                })
                .collect(),
        }
    }
}

/// A request-match predicate plus canned response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handler {
    /// Unique within the owning app
    #[serde(default)]
    pub id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub request: RequestSpec,

    #[serde(default, deserialize_with = "null_as_default")]
    pub response: ResponseSpec,

    /// Maximum number of matches (unset = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_matches: Option<u32>,

    /// Matches recorded so far
    #[serde(default)]
    pub total_matches: u32,
}

impl Handler {
    /// Whether the handler has used up its match cap.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.max_matches, Some(max) if self.total_matches >= max)
    }

    /// Check the definition before it is registered.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("handler id cannot be empty".to_string());
        }
        self.response
            .validate()
            .map_err(|e| format!("handler {}: {}", self.id, e))
    }
}

/// Which requests a handler accepts. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, alias = "url", skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<UrlPattern>,
}

/// The canned response of a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    #[serde(default, alias = "delay", skip_serializing_if = "Option::is_none")]
    pub delay_millis: Option<u64>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseSpec {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: None,
            delay_millis: None,
        }
    }
}

impl ResponseSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.status < 100 || self.status > 599 {
            return Err(format!("invalid status code: {}", self.status));
        }
        Ok(())
    }

    /// How long to hold the response back.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis.unwrap_or(0))
    }
}

/// A simulated request as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    pub protocol: String,
    pub method: String,
    /// URL as received, including the app prefix and query
    pub full_url: String,
    /// URL below the app's test prefix, including query
    pub relative_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    pub fn new(protocol: &str, method: &str, relative_url: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            method: method.to_string(),
            full_url: relative_url.to_string(),
            relative_url: relative_url.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_full_url(mut self, full_url: impl Into<String>) -> Self {
        self.full_url = full_url.into();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<serde_json::Value>) -> Self {
        self.body = body;
        self
    }

    /// Relative path without the query string; `/` when empty.
    pub fn path(&self) -> &str {
        let path = self
            .relative_url
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&self.relative_url);
        if path.is_empty() {
            "/"
        } else {
            path
        }
    }
}

/// Audit record of one simulated exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub date: DateTime<Utc>,
    pub request: RequestDescriptor,
    #[serde(rename = "handler")]
    pub handler_id: String,
    pub response: ResponseSpec,
}

impl LogEntry {
    pub fn new(request: RequestDescriptor, handler: &Handler) -> Self {
        Self {
            date: Utc::now(),
            request,
            handler_id: handler.id.clone(),
            response: handler.response.clone(),
        }
    }
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
