//! Message containers exchanged with the broker.
//!
//! [`Envelope`] is the header + body unit as the broker stores it.
//! [`BrokeredMessage`] wraps an envelope with the metadata the broker attaches
//! when a message is peeked or received (sequence number, label, enqueue time
//! and so on).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message container moved around by the broker.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic: the broker moves
/// [`RawEnvelope`]s (string headers + opaque bytes), while callers may build
/// envelopes out of whatever header/payload types are convenient and convert
/// them at the edge.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use requeue::{Envelope, Headers};
///
/// let mut headers = Headers::new();
/// headers.insert("rbs2-msg-id".to_owned(), "m-1".to_owned());
///
/// let envelope = Envelope {
///     headers: headers.clone(),
///     message: b"hello".to_vec(),
/// };
///
/// // or, equivalently
/// let same: Envelope<_, _> = (headers, b"hello".to_vec()).into();
/// assert_eq!(envelope, same);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// String header map used by decoded messages and raw envelopes.
pub type Headers = BTreeMap<String, String>;

/// Header + body unit as stored by the broker, prior to any decoding.
pub type RawEnvelope = Envelope<Headers, Vec<u8>>;

/// A broker property value.
///
/// Brokers allow typed application properties; only string values take part in
/// application-level decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Boolean(value)
    }
}

/// Typed broker properties as they travel on the wire.
pub type BrokerHeaders = BTreeMap<String, HeaderValue>;

/// Lifecycle state of a message inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MessageState {
    #[default]
    Active,
    Scheduled,
    Deferred,
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageState::Active => write!(f, "Active"),
            MessageState::Scheduled => write!(f, "Scheduled"),
            MessageState::Deferred => write!(f, "Deferred"),
        }
    }
}

impl std::str::FromStr for MessageState {
    type Err = UnknownMessageState;

    /// Case-insensitive parse of a state name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(MessageState::Active),
            "scheduled" => Ok(MessageState::Scheduled),
            "deferred" => Ok(MessageState::Deferred),
            _ => Err(UnknownMessageState(s.to_owned())),
        }
    }
}

/// Returned when parsing a [`MessageState`] from an unknown name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageState(pub String);

impl std::fmt::Display for UnknownMessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown message state: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageState {}

/// Body of a brokered message.
///
/// Some brokers hand out message bodies as streams that can fail to be read
/// independently of the batch they arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Bytes(Vec<u8>),
    Unreadable(String),
}

impl From<Vec<u8>> for MessageBody {
    fn from(value: Vec<u8>) -> Self {
        MessageBody::Bytes(value)
    }
}

/// A message as handed out by the broker on peek or receive.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokeredMessage {
    /// Broker-assigned message id. Not necessarily the application identity.
    pub broker_message_id: String,
    /// Position of the message in the broker log. Strictly increasing in
    /// enqueue order, starting at 1.
    pub sequence_number: i64,
    pub label: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub state: MessageState,
    pub headers: BrokerHeaders,
    pub body: MessageBody,
}

impl BrokeredMessage {
    /// String-valued headers only.
    pub fn string_headers(&self) -> Headers {
        self.headers
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
            .collect()
    }

    /// String header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    /// Rebuild the envelope this message was enqueued with.
    ///
    /// Typed properties are preserved as-is. Returns `None` when the body
    /// cannot be read.
    pub fn to_envelope(&self) -> Option<Envelope<BrokerHeaders, Vec<u8>>> {
        match &self.body {
            MessageBody::Bytes(bytes) => Some(Envelope {
                headers: self.headers.clone(),
                message: bytes.clone(),
            }),
            MessageBody::Unreadable(_) => None,
        }
    }
}

impl From<RawEnvelope> for Envelope<BrokerHeaders, Vec<u8>> {
    fn from(value: RawEnvelope) -> Self {
        Envelope {
            headers: value
                .headers
                .into_iter()
                .map(|(k, v)| (k, HeaderValue::String(v)))
                .collect(),
            message: value.message,
        }
    }
}
