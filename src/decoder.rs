//! Decoding of brokered messages into logical records.
//!
//! [`EnvelopeDecoder::decode`] turns exactly one [`BrokeredMessage`] into
//! exactly one [`DecodedMessage`]. It never fails: when a body cannot be
//! decrypted, decompressed or read as UTF-8, the result is a diagnostic record
//! that keeps the raw bytes visible to whoever inspects the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    BrokeredMessage, Headers,
    codec::{CodecChain, CodecError, EncryptionKey},
    envelope::MessageBody,
    headers,
};

/// Whether a message body decoded cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStatus {
    Ok,
    Error,
}

/// A decoded, read-only view of a queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    id: String,
    body: String,
    headers: Headers,
    status: DecodeStatus,
    sequence_number: i64,
}

impl DecodedMessage {
    /// Application identity, or `Error (<broker id>)` for diagnostic records.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Decoded text, or the JSON [`DiagnosticBody`] when decoding failed.
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn status(&self) -> DecodeStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == DecodeStatus::Ok
    }

    /// Broker sequence number the message was peeked at.
    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }
}

/// Body of a diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticBody {
    #[serde(rename = "$type")]
    pub label: Option<String>,
    #[serde(rename = "MessageText")]
    pub message_text: String,
    /// Space separated upper-case hex of the raw body.
    #[serde(rename = "MessageTextBytesAsString")]
    pub message_bytes: String,
}

/// Why a body could not be decoded.
#[derive(Debug)]
enum DecodeFailure {
    MissingIdentity,
    Unreadable(String),
    Codec(CodecError),
    Utf8(std::string::FromUtf8Error),
}

impl DecodeFailure {
    fn stage(&self) -> &'static str {
        match self {
            DecodeFailure::MissingIdentity => "identity",
            DecodeFailure::Unreadable(_) => "body",
            DecodeFailure::Codec(err) => err.stage(),
            DecodeFailure::Utf8(_) => "utf8",
        }
    }

    fn details(&self) -> String {
        let message = match self {
            DecodeFailure::MissingIdentity => {
                format!("missing {} header", headers::MESSAGE_ID)
            }
            DecodeFailure::Unreadable(reason) => format!("body could not be read: {reason}"),
            DecodeFailure::Codec(err) => err.kind().to_string(),
            DecodeFailure::Utf8(err) => err.to_string(),
        };
        serde_json::json!({ "stage": self.stage(), "message": message }).to_string()
    }
}

/// Turns brokered messages into [`DecodedMessage`]s.
///
/// By default the decoder uses [`CodecChain::standard`] without a key, so
/// compressed bodies decode but encrypted ones produce diagnostic records.
#[derive(Debug)]
pub struct EnvelopeDecoder {
    chain: CodecChain,
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new(CodecChain::standard(None))
    }
}

impl EnvelopeDecoder {
    pub fn new(chain: CodecChain) -> Self {
        Self { chain }
    }

    /// Standard chain able to decrypt with the given key.
    pub fn with_key(key: EncryptionKey) -> Self {
        Self::new(CodecChain::standard(Some(key)))
    }

    pub fn chain(&self) -> &CodecChain {
        &self.chain
    }

    /// Decode one message. Never fails.
    pub fn decode(&self, message: &BrokeredMessage) -> DecodedMessage {
        let headers = message.string_headers();

        match self.try_decode(message, &headers) {
            Ok((id, body)) => DecodedMessage {
                id,
                body,
                headers,
                status: DecodeStatus::Ok,
                sequence_number: message.sequence_number,
            },
            Err(failure) => {
                tracing::warn!(
                    broker_message_id = %message.broker_message_id,
                    sequence_number = message.sequence_number,
                    stage = failure.stage(),
                    "Message could not be decoded"
                );
                diagnostic(message, headers, failure)
            }
        }
    }

    fn try_decode(
        &self,
        message: &BrokeredMessage,
        headers: &Headers,
    ) -> Result<(String, String), DecodeFailure> {
        let id = headers
            .get(headers::MESSAGE_ID)
            .cloned()
            .ok_or(DecodeFailure::MissingIdentity)?;

        let raw = match &message.body {
            MessageBody::Bytes(bytes) => bytes.clone(),
            MessageBody::Unreadable(reason) => {
                return Err(DecodeFailure::Unreadable(reason.clone()));
            }
        };

        let bytes = self
            .chain
            .decode(raw, headers)
            .map_err(DecodeFailure::Codec)?;
        let body = String::from_utf8(bytes).map_err(DecodeFailure::Utf8)?;

        Ok((id, body))
    }
}

fn diagnostic(
    message: &BrokeredMessage,
    mut headers: Headers,
    failure: DecodeFailure,
) -> DecodedMessage {
    let raw: &[u8] = match &message.body {
        MessageBody::Bytes(bytes) => bytes,
        MessageBody::Unreadable(_) => &[],
    };

    let body = DiagnosticBody {
        label: message.label.clone(),
        message_text: String::from_utf8_lossy(raw).into_owned(),
        message_bytes: hex_dump(raw),
    };

    insert_either(
        &mut headers,
        headers::SENT_TIME,
        headers::ENQUEUED_TIME_UTC,
        sent_time(&message.enqueued_at),
    );
    headers
        .entry(headers::LABEL.to_owned())
        .or_insert_with(|| message.label.clone().unwrap_or_default());
    insert_either(
        &mut headers,
        headers::ERROR_DETAILS,
        headers::EXCEPTION,
        failure.details(),
    );

    DecodedMessage {
        id: format!("Error ({})", message.broker_message_id),
        body: serde_json::to_string(&body).unwrap_or_default(),
        headers,
        status: DecodeStatus::Error,
        sequence_number: message.sequence_number,
    }
}

/// Insert under `primary`, or `fallback` when `primary` is taken. Existing
/// values are never overwritten.
/// UTC timestamp with seven fractional digits (100 ns ticks), `Z` suffixed.
fn sent_time(at: &DateTime<Utc>) -> String {
    let ticks = (at.timestamp_subsec_nanos() / 100).min(9_999_999);
    format!("{}.{ticks:07}Z", at.format("%Y-%m-%dT%H:%M:%S"))
}

fn insert_either(headers: &mut Headers, primary: &str, fallback: &str, value: String) {
    let name = if headers.contains_key(primary) {
        fallback
    } else {
        primary
    };
    headers.entry(name.to_owned()).or_insert(value);
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BrokerHeaders, MessageState};
    use chrono::{TimeZone, Utc};

    const KEY: &str = "jmbZNVBcpD6gPOv4xs1vbDn0KWOFtLw8LNh0JReQmts=";

    fn brokered(headers: Headers, body: Vec<u8>) -> BrokeredMessage {
        BrokeredMessage {
            broker_message_id: "broker-7".into(),
            sequence_number: 7,
            label: Some("SimpleMessage".into()),
            enqueued_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            state: MessageState::Active,
            headers: headers.into_iter().map(|(k, v)| (k, v.into())).collect(),
            body: MessageBody::Bytes(body),
        }
    }

    fn with_id(id: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.into(), id.into());
        headers
    }

    #[test]
    fn plain_body_decodes_as_text() {
        let decoded = EnvelopeDecoder::default()
            .decode(&brokered(with_id("m-1"), "hei på deg".as_bytes().to_vec()));

        assert!(decoded.is_ok());
        assert_eq!(decoded.id(), "m-1");
        assert_eq!(decoded.body(), "hei på deg");
        assert_eq!(decoded.sequence_number(), 7);
        assert_eq!(decoded.header(headers::MESSAGE_ID), Some("m-1"));
    }

    #[test]
    fn encrypted_and_compressed_body_round_trips() {
        let key = EncryptionKey::from_base64(KEY).unwrap();
        let chain = CodecChain::standard(Some(key.clone()));
        let mut headers = with_id("m-2");
        let text = "#1 The body med æ og ø og å";
        let stored = chain.encode(text.as_bytes().to_vec(), &mut headers).unwrap();

        let decoded = EnvelopeDecoder::with_key(key).decode(&brokered(headers, stored));

        assert!(decoded.is_ok());
        assert_eq!(decoded.body().as_bytes(), text.as_bytes());
    }

    #[test]
    fn encrypted_body_without_key_becomes_diagnostic() {
        let chain = CodecChain::standard(Some(EncryptionKey::from_base64(KEY).unwrap()));
        let mut headers = with_id("m-3");
        let stored = chain.encode(b"secret".to_vec(), &mut headers).unwrap();

        let decoded = EnvelopeDecoder::default().decode(&brokered(headers, stored.clone()));

        assert_eq!(decoded.status(), DecodeStatus::Error);
        assert_eq!(decoded.id(), "Error (broker-7)");

        let body: DiagnosticBody = serde_json::from_str(decoded.body()).unwrap();
        assert_eq!(body.label.as_deref(), Some("SimpleMessage"));
        assert_eq!(body.message_bytes.split(' ').count(), stored.len());

        assert_eq!(decoded.header(headers::LABEL), Some("SimpleMessage"));
        assert_eq!(
            decoded.header(headers::SENT_TIME),
            Some("2024-03-01T12:00:00.0000000Z")
        );
        let details: serde_json::Value =
            serde_json::from_str(decoded.header(headers::ERROR_DETAILS).unwrap()).unwrap();
        assert_eq!(details["stage"], "encryption");
    }

    #[test]
    fn invalid_utf8_becomes_diagnostic_with_hex_dump() {
        let decoded =
            EnvelopeDecoder::default().decode(&brokered(with_id("m-4"), vec![0xff, 0x00, 0x41]));

        assert_eq!(decoded.status(), DecodeStatus::Error);
        let body: DiagnosticBody = serde_json::from_str(decoded.body()).unwrap();
        assert_eq!(body.message_bytes, "FF 00 41");
        assert!(body.message_text.ends_with('A'));
    }

    #[test]
    fn missing_identity_becomes_diagnostic() {
        let decoded = EnvelopeDecoder::default().decode(&brokered(Headers::new(), b"{}".to_vec()));
        assert_eq!(decoded.id(), "Error (broker-7)");
        let details = decoded.header(headers::ERROR_DETAILS).unwrap();
        assert!(details.contains("identity"));
    }

    #[test]
    fn diagnostic_headers_do_not_clobber_existing_values() {
        let mut headers = with_id("m-5");
        headers.insert(headers::SENT_TIME.into(), "sender-time".into());
        headers.insert(headers::ERROR_DETAILS.into(), "earlier failure".into());
        headers.insert(headers::LABEL.into(), "from sender".into());
        headers.insert(headers::CONTENT_ENCODING.into(), "gzip".into());

        let decoded = EnvelopeDecoder::default().decode(&brokered(headers, b"not gzip".to_vec()));

        assert_eq!(decoded.header(headers::SENT_TIME), Some("sender-time"));
        assert_eq!(
            decoded.header(headers::ENQUEUED_TIME_UTC),
            Some("2024-03-01T12:00:00.0000000Z")
        );
        assert_eq!(decoded.header(headers::ERROR_DETAILS), Some("earlier failure"));
        assert!(decoded.header(headers::EXCEPTION).unwrap().contains("gzip"));
        assert_eq!(decoded.header(headers::LABEL), Some("from sender"));
    }

    #[test]
    fn sent_time_keeps_tick_precision() {
        let at = Utc.timestamp_opt(1_709_294_400, 123_456_789).unwrap();

        assert_eq!(sent_time(&at), "2024-03-01T12:00:00.1234567Z");
        assert_eq!(
            sent_time(&Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            "2024-03-01T12:00:00.0000000Z"
        );
    }

    #[test]
    fn only_string_headers_are_kept() {
        let mut message = brokered(with_id("m-6"), b"x".to_vec());
        let mut typed = BrokerHeaders::new();
        typed.insert("retries".into(), 3i64.into());
        message.headers.extend(typed);

        let decoded = EnvelopeDecoder::default().decode(&message);
        assert!(decoded.header("retries").is_none());
        assert_eq!(decoded.headers().len(), 1);
    }
}
