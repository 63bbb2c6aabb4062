use chrono::{FixedOffset, Offset, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Offset used for envelope timestamps when none is configured.
pub const DEFAULT_OFFSET: &str = "+07:00";

/// Timestamp layout shared by commands and replies, e.g.
/// `2024-05-01T10:00:00.000+07:00`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Parses a `+HH:MM` / `-HH:MM` / `Z` offset string.
///
/// # Examples
///
/// ```
/// use market_bus_core::envelope::parse_offset;
///
/// assert_eq!(parse_offset("+07:00").unwrap().local_minus_utc(), 7 * 3600);
/// assert_eq!(parse_offset("-03:30").unwrap().local_minus_utc(), -(3 * 3600 + 1800));
/// assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
/// assert!(parse_offset("07:00").is_none());
/// ```
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// The deployment's default offset (UTC+7).
pub fn default_offset() -> FixedOffset {
    FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix())
}

/// Renders the current time in `offset` using the envelope timestamp layout.
pub fn timestamp_now(offset: FixedOffset) -> String {
    Utc::now()
        .with_timezone(&offset)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

/// Wire-level wrapper carried by every command and reply.
///
/// The correlation key is *not* part of the envelope: it rides on the
/// transport-level message key so the dispatch loop can route a reply
/// without parsing its body.
///
/// Replies produced by the worker may omit `eventId` and `timestamp`; both
/// deserialize to empty strings in that case.
///
/// # Examples
///
/// ```
/// use market_bus_core::Envelope;
/// use serde_json::json;
///
/// let env = Envelope::new("market-rest", "/stock/create", json!({"stockId": "ACB"}));
/// assert_eq!(env.uri(), "/stock/create");
/// assert!(!env.event_id().is_empty());
/// assert!(env.timestamp().ends_with("+07:00"));
///
/// let bytes = env.to_bytes().unwrap();
/// let text = String::from_utf8(bytes).unwrap();
/// assert!(text.contains("\"sourceId\":\"market-rest\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T = serde_json::Value> {
    source_id: String,
    #[serde(default)]
    event_id: String,
    uri: String,
    #[serde(default)]
    timestamp: String,
    payload: T,
}

impl<T> Envelope<T> {
    /// Creates an envelope with a generated `eventId` and a timestamp in the
    /// default offset.
    pub fn new(source_id: impl Into<String>, uri: impl Into<String>, payload: T) -> Self {
        Self::builder(source_id, uri, payload).build()
    }

    pub fn builder(
        source_id: impl Into<String>,
        uri: impl Into<String>,
        payload: T,
    ) -> EnvelopeBuilder<T> {
        EnvelopeBuilder {
            source_id: source_id.into(),
            uri: uri.into(),
            payload,
            event_id: None,
            timestamp: None,
            offset: default_offset(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// JSON encoding used on the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Envelope<serde_json::Value> {
    /// Re-types an untyped envelope's payload.
    pub fn decode_payload<R: DeserializeOwned>(self) -> serde_json::Result<Envelope<R>> {
        let payload = serde_json::from_value(self.payload)?;
        Ok(Envelope {
            source_id: self.source_id,
            event_id: self.event_id,
            uri: self.uri,
            timestamp: self.timestamp,
            payload,
        })
    }
}

/// Builder for [`Envelope`]; fields left unset are filled in by [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder<T> {
    source_id: String,
    uri: String,
    payload: T,
    event_id: Option<String>,
    timestamp: Option<String>,
    offset: FixedOffset,
}

impl<T> EnvelopeBuilder<T> {
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Uses `timestamp` verbatim instead of stamping the current time.
    pub fn timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Offset used when the timestamp is stamped at build time.
    pub fn offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn build(self) -> Envelope<T> {
        Envelope {
            source_id: self.source_id,
            event_id: self
                .event_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            uri: self.uri,
            timestamp: self
                .timestamp
                .unwrap_or_else(|| timestamp_now(self.offset)),
            payload: self.payload,
        }
    }
}
