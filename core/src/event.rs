//! Behavioral events and their wire format.
//!
//! An [`Event`] is what a client application reports ("user `u1` viewed a
//! page"). It is built from an [`EventInput`] at publish time, stamped with the
//! producer clock, serialized to JSON and appended to the partitioned log. The
//! consuming side decodes the same bytes back with [`Event::decode`].
//!
//! # Routing
//!
//! Every [`EventType`] has its own topic (`events_<type>`), and the message key
//! is the `user_id`. Same key means same partition, so all events for one user
//! within a topic keep their publication order.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "event": "page_view",
//!   "user_id": "u1",
//!   "session_id": "s-42",
//!   "props": { "path": "/pricing" },
//!   "ip_address": "10.0.0.7",
//!   "user_agent": "Mozilla/5.0",
//!   "timestamp": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! `props`, `session_id`, `ip_address` and `user_agent` may be absent or `null`.
//!
//! # Example
//!
//! ```
//! use beacon_core::event::{EventInput, EventType, Properties, PropertyLimits};
//! use chrono::Utc;
//!
//! let input = EventInput::new(EventType::PageView, "u1")
//!     .with_properties(Properties::new().with("path", "/pricing"));
//! input.validate(&PropertyLimits::default()).unwrap();
//!
//! let event = input.into_event(Utc::now());
//! assert_eq!(event.topic(), "events_page_view");
//! assert_eq!(event.key(), b"u1");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix shared by every event topic.
pub const TOPIC_PREFIX: &str = "events_";

/// Reasons an event is rejected before it reaches the log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The event type is not part of the known enumeration.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The user identifier is empty or whitespace.
    #[error("user_id must not be empty")]
    EmptyUserId,

    /// The properties map nests deeper than allowed.
    #[error("Properties nested {depth} levels deep, limit is {limit}")]
    PropertiesTooDeep {
        /// Measured nesting depth
        depth: usize,
        /// Configured limit
        limit: usize,
    },

    /// The properties map serializes to more bytes than allowed.
    #[error("Properties serialize to {size} bytes, limit is {limit}")]
    PropertiesTooLarge {
        /// Serialized size in bytes
        size: usize,
        /// Configured limit
        limit: usize,
    },
}

/// Reasons a log message cannot be turned back into an [`Event`].
///
/// Every variant marks the message as poison: it will never decode no matter
/// how often it is redelivered.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The message carried no value.
    #[error("Message has no payload")]
    MissingPayload,

    /// The value is not a well-formed event document.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The document parsed but violates an event invariant.
    #[error("Invalid event: {0}")]
    Invalid(#[from] ValidationError),
}

/// The closed set of behavioral event categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A page or screen was viewed
    PageView,
    /// A user account was created
    Signup,
    /// A user logged in
    Login,
    /// A purchase completed
    Purchase,
    /// A UI element was clicked
    Click,
    /// Anything else the client wants to track
    Generic,
}

impl EventType {
    /// Every known event type, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::PageView,
        Self::Signup,
        Self::Login,
        Self::Purchase,
        Self::Click,
        Self::Generic,
    ];

    /// Stable wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::Signup => "signup",
            Self::Login => "login",
            Self::Purchase => "purchase",
            Self::Click => "click",
            Self::Generic => "generic",
        }
    }

    /// Topic that carries events of this type.
    #[must_use]
    pub fn topic(self) -> String {
        format!("{TOPIC_PREFIX}{}", self.as_str())
    }

    /// Reverse of [`EventType::topic`].
    #[must_use]
    pub fn from_topic(topic: &str) -> Option<Self> {
        topic
            .strip_prefix(TOPIC_PREFIX)
            .and_then(|name| name.parse().ok())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every topic a worker consumes, one per [`EventType`].
#[must_use]
pub fn all_topics() -> Vec<String> {
    EventType::ALL.into_iter().map(EventType::topic).collect()
}

/// Size and depth bounds for [`Properties`].
///
/// Properties are schemaless; these bounds are the only check applied to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyLimits {
    /// Maximum container nesting, counting the top-level map as 1
    pub max_depth: usize,
    /// Maximum serialized JSON size in bytes
    pub max_bytes: usize,
}

impl Default for PropertyLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_bytes: 64 * 1024,
        }
    }
}

/// Open string-keyed map of scalar or nested values attached to an event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(Map<String, Value>);

impl Properties {
    /// Empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a single property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Number of top-level keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying JSON map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Container nesting depth; the top-level map counts as 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.0.values().map(value_depth).max().unwrap_or(0)
    }

    /// Check the depth and size bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::PropertiesTooDeep`] or
    /// [`ValidationError::PropertiesTooLarge`] when a bound is exceeded.
    pub fn validate(&self, limits: &PropertyLimits) -> Result<(), ValidationError> {
        let depth = self.depth();
        if depth > limits.max_depth {
            return Err(ValidationError::PropertiesTooDeep {
                depth,
                limit: limits.max_depth,
            });
        }

        let size = serde_json::to_vec(&self.0).map_or(usize::MAX, |bytes| bytes.len());
        if size > limits.max_bytes {
            return Err(ValidationError::PropertiesTooLarge {
                size,
                limit: limits.max_bytes,
            });
        }

        Ok(())
    }
}

impl From<Map<String, Value>> for Properties {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Network and client metadata captured by the request handler. Advisory only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Caller address as seen by the request handler
    pub ip_address: Option<String>,
    /// Caller `User-Agent` header
    pub user_agent: Option<String>,
}

/// A validated request to record an event, before it has a timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct EventInput {
    /// Event category
    pub event_type: EventType,
    /// User the event belongs to; becomes the message key
    pub user_id: String,
    /// Optional session correlation id
    pub session_id: Option<String>,
    /// Schemaless event properties
    pub properties: Properties,
    /// Client metadata
    pub origin: Origin,
}

impl EventInput {
    /// Start an input with no session, properties or origin.
    #[must_use]
    pub fn new(event_type: EventType, user_id: impl Into<String>) -> Self {
        Self {
            event_type,
            user_id: user_id.into(),
            session_id: None,
            properties: Properties::new(),
            origin: Origin::default(),
        }
    }

    /// Attach a session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach properties.
    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Attach origin metadata.
    #[must_use]
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Check the pre-publish invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyUserId`] for a blank user id, or a
    /// property bound violation.
    pub fn validate(&self, limits: &PropertyLimits) -> Result<(), ValidationError> {
        if self.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyUserId);
        }
        self.properties.validate(limits)
    }

    /// Stamp the input with the producer clock.
    #[must_use]
    pub fn into_event(self, occurred_at: DateTime<Utc>) -> Event {
        Event {
            event_type: self.event_type,
            user_id: self.user_id,
            session_id: self.session_id,
            properties: self.properties,
            occurred_at,
            origin: self.origin,
        }
    }
}

/// An immutable behavioral event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    event_type: EventType,
    user_id: String,
    session_id: Option<String>,
    properties: Properties,
    occurred_at: DateTime<Utc>,
    origin: Origin,
}

impl Event {
    /// Event category.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Owning user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Session correlation id, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Event properties.
    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Producer-clock timestamp set at publish time.
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Client metadata.
    #[must_use]
    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Topic this event is routed to.
    #[must_use]
    pub fn topic(&self) -> String {
        self.event_type.topic()
    }

    /// Message key: the user id as UTF-8 bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.user_id.as_bytes()
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireEvent::from(self))
    }

    /// Parse and re-validate a message value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the bytes are not a valid event document.
    pub fn decode(bytes: &[u8], limits: &PropertyLimits) -> Result<Self, DecodeError> {
        let wire: WireEvent =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let event_type: EventType = wire.event.parse()?;
        let input = EventInput {
            event_type,
            user_id: wire.user_id,
            session_id: wire.session_id,
            properties: wire.props.unwrap_or_default(),
            origin: Origin {
                ip_address: wire.ip_address,
                user_agent: wire.user_agent,
            },
        };
        input.validate(limits)?;

        Ok(input.into_event(wire.timestamp))
    }
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    event: String,
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default)]
    props: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        Self {
            event: event.event_type.as_str().to_string(),
            user_id: event.user_id.clone(),
            session_id: event.session_id.clone(),
            props: Some(event.properties.clone()),
            ip_address: event.origin.ip_address.clone(),
            user_agent: event.origin.user_agent.clone(),
            timestamp: event.occurred_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_are_derived_from_event_type() {
        assert_eq!(EventType::PageView.topic(), "events_page_view");
        assert_eq!(EventType::Purchase.topic(), "events_purchase");
        assert_eq!(EventType::from_topic("events_click"), Some(EventType::Click));
        assert_eq!(EventType::from_topic("orders"), None);
        assert_eq!(all_topics().len(), EventType::ALL.len());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "logout".parse::<EventType>().unwrap_err();
        assert_eq!(err, ValidationError::UnknownEventType("logout".to_string()));
    }

    #[test]
    fn blank_user_id_is_rejected() {
        let input = EventInput::new(EventType::Login, "  ");
        assert_eq!(
            input.validate(&PropertyLimits::default()),
            Err(ValidationError::EmptyUserId)
        );
    }

    #[test]
    fn property_depth_is_bounded() {
        let props = Properties::new().with("a", json!({"b": {"c": [1, 2]}}));
        assert_eq!(props.depth(), 4);

        let limits = PropertyLimits {
            max_depth: 3,
            ..PropertyLimits::default()
        };
        assert!(matches!(
            props.validate(&limits),
            Err(ValidationError::PropertiesTooDeep { depth: 4, limit: 3 })
        ));
        assert!(props.validate(&PropertyLimits::default()).is_ok());
    }

    #[test]
    fn property_size_is_bounded() {
        let props = Properties::new().with("blob", "x".repeat(200));
        let limits = PropertyLimits {
            max_bytes: 100,
            ..PropertyLimits::default()
        };
        assert!(matches!(
            props.validate(&limits),
            Err(ValidationError::PropertiesTooLarge { limit: 100, .. })
        ));
    }

    #[test]
    fn decodes_producer_payload() {
        let payload = json!({
            "event": "purchase",
            "user_id": "u1",
            "session_id": "s1",
            "props": {"amount": 42, "items": ["a", "b"]},
            "ip_address": "10.0.0.1",
            "user_agent": "curl/8",
            "timestamp": "2025-01-01T00:00:00.000Z"
        });
        let bytes = serde_json::to_vec(&payload).unwrap();

        let event = Event::decode(&bytes, &PropertyLimits::default()).unwrap();
        assert_eq!(event.event_type(), EventType::Purchase);
        assert_eq!(event.user_id(), "u1");
        assert_eq!(event.session_id(), Some("s1"));
        assert_eq!(event.properties().get("amount"), Some(&json!(42)));
        assert_eq!(event.origin().user_agent.as_deref(), Some("curl/8"));
    }

    #[test]
    fn missing_or_null_props_decode_to_empty() {
        let bytes = br#"{"event":"login","user_id":"u2","props":null,"timestamp":"2025-01-01T00:00:00Z"}"#;
        let event = Event::decode(bytes, &PropertyLimits::default()).unwrap();
        assert!(event.properties().is_empty());

        let bytes = br#"{"event":"login","user_id":"u2","timestamp":"2025-01-01T00:00:00Z"}"#;
        let event = Event::decode(bytes, &PropertyLimits::default()).unwrap();
        assert!(event.session_id().is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Event::decode(b"not json", &PropertyLimits::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn unknown_type_on_the_wire_is_invalid() {
        let bytes = br#"{"event":"logout","user_id":"u2","timestamp":"2025-01-01T00:00:00Z"}"#;
        let err = Event::decode(bytes, &PropertyLimits::default()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Invalid(ValidationError::UnknownEventType(_))
        ));
    }

    #[test]
    fn encoded_event_decodes_to_itself() {
        let event = EventInput::new(EventType::Click, "u3")
            .with_session("s9")
            .with_properties(Properties::new().with("button", "buy"))
            .with_origin(Origin {
                ip_address: Some("127.0.0.1".to_string()),
                user_agent: None,
            })
            .into_event(Utc::now());

        let bytes = event.encode().unwrap();
        let decoded = Event::decode(&bytes, &PropertyLimits::default()).unwrap();
        assert_eq!(decoded, event);
    }
}
