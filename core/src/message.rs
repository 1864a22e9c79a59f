//! The universal bus envelope
//!
//! Every value that moves through the bus is a [`Message`]: a dotted topic,
//! a JSON payload, and a handful of optional envelope fields. The bus fills
//! in `id` and `ts` at publish time when the caller leaves them out.
//!
//! # Headers
//!
//! Headers are lazily allocated - `None` until the first insert, which keeps
//! the common headerless envelope at a fixed size. A few header keys carry
//! conventions the routing engine understands:
//!
//! - `source` - the publishing client, stamped by client-scoped publishes
//! - `tags` - comma-separated tag list, tested by `tags_any`/`tags_all`
//! - `type` - optional type override written by FORWARD actions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header map storage - lazy allocation, `None` when empty
pub type Headers = Option<Box<HashMap<String, String>>>;

fn headers_ref(h: &Headers) -> &HashMap<String, String> {
    static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
    h.as_ref()
        .map(|b| b.as_ref())
        .unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
}

/// The message envelope
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use vayla_core::Message;
///
/// let msg = Message::new("user.login", json!({"id": 1}))
///     .with_header("source", "auth-service");
/// assert_eq!(msg.topic, "user.login");
/// assert!(!msg.retain);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Dotted topic, `[A-Za-z0-9_.]+`
    pub topic: String,

    /// Arbitrary JSON payload
    #[serde(default)]
    pub data: serde_json::Value,

    /// Unique identifier - assigned by the bus at publish time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Milliseconds since epoch - assigned by the bus when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// Keep as the topic's retained value, replayed to late subscribers
    #[serde(default)]
    pub retain: bool,

    /// Reply topic for request/reply exchanges
    #[serde(default, rename = "replyTo", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Correlates a reply with its originating request
    #[serde(default, rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Headers - lazily allocated, `None` when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Headers,
}

impl Message {
    /// Create a new message with no id/ts (the bus assigns them on publish)
    pub fn new(topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            id: None,
            ts: None,
            retain: false,
            reply_to: None,
            correlation_id: None,
            headers: None,
        }
    }

    /// Mark the message as retained
    pub fn with_retain(mut self) -> Self {
        self.retain = true;
        self
    }

    /// Add a header
    ///
    /// # Example
    /// ```
    /// use serde_json::json;
    /// use vayla_core::Message;
    ///
    /// let msg = Message::new("order.shipped", json!({}))
    ///     .with_header("tags", "billing,critical")
    ///     .with_header("source", "shop");
    /// assert_eq!(msg.header("source"), Some("shop"));
    /// ```
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(|| Box::new(HashMap::new()))
            .insert(key.into(), value.into());
        self
    }

    /// Set the request/reply envelope fields
    pub fn with_reply(
        mut self,
        reply_to: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        self.reply_to = Some(reply_to.into());
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Get headers reference (returns empty map if None)
    #[inline]
    pub fn headers(&self) -> &HashMap<String, String> {
        headers_ref(&self.headers)
    }

    /// Get mutable headers, allocating if needed
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        self.headers.get_or_insert_with(|| Box::new(HashMap::new()))
    }

    /// Get a single header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers().get(key).map(String::as_str)
    }

    /// The publishing client, when stamped (`source` header)
    pub fn source(&self) -> Option<&str> {
        self.header("source")
    }

    /// Tags from the comma-separated `tags` header
    pub fn tags(&self) -> Vec<&str> {
        self.header("tags")
            .map(|t| {
                t.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialized size of the whole envelope in bytes
    ///
    /// Used by the bus for the total-size limit. Unserializable values do
    /// not occur (`Message` is plain data), but the fallback is `usize::MAX`
    /// so a serialization failure can never bypass the limit.
    pub fn envelope_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    /// Serialized size of `data` alone in bytes
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.data)
            .map(|v| v.len())
            .unwrap_or(usize::MAX)
    }
}
