//! # Request Metadata
//!
//! Ephemeral context describing *why* a request was issued (a user gesture,
//! a keyboard shortcut, an automatic retry...). Observability only; the store
//! never branches on it.
//!
//! Metadata is staged with [`Store::meta`](crate::core::store::Store::meta),
//! moved into exactly one request, and taken out by the handler with
//! [`RequestContext::take_meta`](crate::core::feature::RequestContext::take_meta).

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestMeta {
    /// Who issued the request (e.g. "user", "keyboard", "remote").
    pub source: String,
    pub reason: Option<String>,
    /// Epoch milliseconds at staging time.
    pub timestamp: i64,
    /// Free-form extra data, usually the originating event.
    pub context: Option<serde_json::Value>,
}

impl RequestMeta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: None,
            timestamp: Utc::now().timestamp_millis(),
            context: None,
        }
    }

    /// Builds metadata from a UI event name, keeping the name as the reason.
    pub fn from_event(event_type: &str) -> Self {
        Self {
            source: "event".to_string(),
            reason: Some(event_type.to_string()),
            timestamp: Utc::now().timestamp_millis(),
            context: Some(serde_json::json!({ "type": event_type })),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}
