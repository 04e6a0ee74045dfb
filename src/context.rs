//! Per-session metadata stamped onto appended events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventMetadata;

/// Cross-cutting metadata carried by an [`EventSession`](crate::EventSession).
///
/// Keeps audit and correlation data out of the event payloads. Every event
/// appended through the session receives a copy in
/// [`Event::metadata`](crate::Event::metadata).
///
/// # Examples
///
/// ```
/// use eventfold_projections::SessionContext;
/// use serde_json::json;
///
/// let ctx = SessionContext::default()
///     .with_user("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_header("source", json!("api"));
///
/// assert_eq!(ctx.user.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(ctx.headers["source"], json!("api"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    /// Identity of whoever issued the writes (e.g. a user ID).
    pub user: Option<String>,
    /// Correlation ID for tracing a request across streams.
    pub correlation_id: Option<String>,
    /// ID of the message that caused these writes.
    pub causation_id: Option<String>,
    /// Free-form headers.
    pub headers: BTreeMap<String, Value>,
}

impl SessionContext {
    /// Set the user identity.
    ///
    /// # Arguments
    ///
    /// * `user` - Any value convertible to `String` identifying who issued
    ///   the writes (e.g. a user ID or service name).
    ///
    /// # Returns
    ///
    /// The updated `SessionContext` with the user set.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the correlation ID.
    ///
    /// # Returns
    ///
    /// The updated `SessionContext` with the correlation ID set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    ///
    /// # Returns
    ///
    /// The updated `SessionContext` with the causation ID set.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Add or replace one header.
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Metadata to attach to each appended event.
    pub(crate) fn event_metadata(&self) -> EventMetadata {
        EventMetadata {
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            user: self.user.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = SessionContext::default();
        assert_eq!(ctx.user, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.causation_id, None);
        assert!(ctx.headers.is_empty());
    }

    #[test]
    fn builder_accepts_owned_strings() {
        let ctx = SessionContext::default()
            .with_user(String::from("svc-payments"))
            .with_causation_id(String::from("cmd-7"));
        assert_eq!(ctx.user.as_deref(), Some("svc-payments"));
        assert_eq!(ctx.causation_id.as_deref(), Some("cmd-7"));
    }

    #[test]
    fn later_header_replaces_earlier() {
        let ctx = SessionContext::default()
            .with_header("source", json!("api"))
            .with_header("source", json!("batch"));
        assert_eq!(ctx.headers.len(), 1);
        assert_eq!(ctx.headers["source"], json!("batch"));
    }

    #[test]
    fn event_metadata_copies_every_field() {
        let ctx = SessionContext::default()
            .with_user("admin")
            .with_correlation_id("req-1")
            .with_causation_id("cmd-1")
            .with_header("ip", json!("10.0.0.1"));

        let meta = ctx.event_metadata();
        assert_eq!(meta.user.as_deref(), Some("admin"));
        assert_eq!(meta.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(meta.causation_id.as_deref(), Some("cmd-1"));
        assert_eq!(meta.headers["ip"], json!("10.0.0.1"));
    }

    #[test]
    fn context_deserializes_with_missing_headers() {
        let ctx: SessionContext =
            serde_json::from_value(json!({"user": "u-1"})).expect("partial context");
        assert_eq!(ctx.user.as_deref(), Some("u-1"));
        assert!(ctx.headers.is_empty());
    }
}
