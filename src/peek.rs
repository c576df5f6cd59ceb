//! Non-destructive inspection of queue contents.
//!
//! [`Peeker`] enumerates a queue through [`PeekMessages`] and decodes every
//! message with an [`EnvelopeDecoder`]. It never takes a lock on the messages
//! it returns, so it can run next to a relocation run on the same queue.
//!
//! Two modes are offered:
//!
//! - [`Peeker::peek`]: up to `count` messages from the head of the queue
//! - [`Peeker::peek_paged`]: resumable pages driven by a sequence-number
//!   cursor; following the returned cursors visits every message exactly once

use serde::Serialize;
use tracing_error::SpanTrace;

use crate::{
    BrokeredMessage, DecodedMessage,
    decoder::EnvelopeDecoder,
    envelope::{MessageBody, MessageState},
    transport::{BrokerOperation, PeekMessages, QueueStats, TransportError},
};

/// One page of peeked messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeekPage {
    pub messages: Vec<DecodedMessage>,
    /// Sequence number of the last message seen. Pass it back to
    /// [`Peeker::peek_paged`] to continue after this page.
    pub next_sequence_number: i64,
}

/// Peek service over a queue client.
pub struct Peeker<P> {
    queue: P,
    decoder: EnvelopeDecoder,
    state: Option<MessageState>,
    batch_size: usize,
}

impl<P> Peeker<P> {
    /// Create a peeker with the default decoder and a batch size of 100.
    pub fn new(queue: P) -> Self {
        Self {
            queue,
            decoder: EnvelopeDecoder::default(),
            state: None,
            batch_size: 100,
        }
    }

    /// Use a custom decoder (e.g. one holding the encryption key).
    pub fn with_decoder(mut self, decoder: EnvelopeDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Only return messages in `state`.
    ///
    /// Filtered messages still advance the paging cursor.
    pub fn with_state(mut self, state: MessageState) -> Self {
        self.state = Some(state);
        self
    }

    /// Maximum number of messages requested from the broker per call.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn queue(&self) -> &P {
        &self.queue
    }

    /// Decode a peeked message, or skip it.
    fn admit(&self, message: &BrokeredMessage) -> Option<DecodedMessage> {
        if self.state.is_some_and(|state| state != message.state) {
            return None;
        }
        if let MessageBody::Unreadable(reason) = &message.body {
            tracing::warn!(
                broker_message_id = %message.broker_message_id,
                sequence_number = message.sequence_number,
                %reason,
                "Skipping message with unreadable body"
            );
            return None;
        }
        Some(self.decoder.decode(message))
    }
}

impl<P> Peeker<P>
where
    P: PeekMessages + Sync,
    P::Error: Into<tower::BoxError>,
{
    /// Peek up to `count` messages from the head of the queue.
    ///
    /// Messages that fail to decode are returned as diagnostic records;
    /// messages whose body cannot be read are skipped.
    #[tracing::instrument(skip(self), fields(state = ?self.state))]
    pub async fn peek(&self, count: usize) -> Result<Vec<DecodedMessage>, PeekError> {
        let mut messages = Vec::new();
        let mut next_from = None;

        while messages.len() < count {
            let wanted = (count - messages.len()).min(self.batch_size);
            let batch = match next_from {
                None => self.queue.peek_batch(wanted).await,
                Some(from) => self.queue.peek_batch_from(from, wanted).await,
            }
            .map_err(PeekError::broker)?;

            let Some(last) = batch.last() else {
                break;
            };
            next_from = Some(last.sequence_number.saturating_add(1));

            messages.extend(batch.iter().filter_map(|m| self.admit(m)));
        }

        tracing::debug!(peeked = messages.len(), "Peek completed");
        Ok(messages)
    }

    /// Peek one page of at most `page_size` messages following `cursor`.
    ///
    /// Start with a cursor of 0. The returned page carries the cursor for the
    /// next call; it is unchanged when no message was seen.
    #[tracing::instrument(skip(self), fields(state = ?self.state))]
    pub async fn peek_paged(&self, page_size: usize, cursor: i64) -> Result<PeekPage, PeekError> {
        let mut messages = Vec::new();
        let mut cursor = cursor;

        while messages.len() < page_size {
            let wanted = (page_size - messages.len()).min(self.batch_size);
            let batch = self
                .queue
                .peek_batch_from(cursor.saturating_add(1), wanted)
                .await
                .map_err(PeekError::broker)?;

            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.sequence_number;

            messages.extend(batch.iter().filter_map(|m| self.admit(m)));
        }

        tracing::debug!(
            peeked = messages.len(),
            next_sequence_number = cursor,
            "Page peeked"
        );
        Ok(PeekPage {
            messages,
            next_sequence_number: cursor,
        })
    }
}

impl<P> Peeker<P>
where
    P: PeekMessages + QueueStats + Sync,
    <P as PeekMessages>::Error: Into<tower::BoxError>,
    <P as QueueStats>::Error: Into<tower::BoxError>,
{
    /// Peek as many messages as the broker reports for the configured state
    /// (active plus scheduled when no state is set).
    #[tracing::instrument(skip(self))]
    pub async fn peek_all(&self) -> Result<Vec<DecodedMessage>, PeekError> {
        let count = self
            .queue
            .message_count(self.state)
            .await
            .map_err(|e| PeekError::new(TransportError::new(BrokerOperation::Stats, e)))?;

        self.peek(usize::try_from(count).unwrap_or(usize::MAX)).await
    }
}

/// Error returned by peek operations.
#[derive(Debug)]
pub struct PeekError {
    context: SpanTrace,
    source: TransportError,
}

impl PeekError {
    fn new(source: TransportError) -> Self {
        Self {
            context: SpanTrace::capture(),
            source,
        }
    }

    fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportError::new(BrokerOperation::Peek, err))
    }

    /// The failed broker call.
    pub fn transport(&self) -> &TransportError {
        &self.source
    }
}

impl std::fmt::Display for PeekError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Peek failed: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PeekError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{
        Envelope, Headers,
        codec::{CodecChain, EncryptionKey},
        decoder::DecodeStatus,
        headers,
        transport::{InMemoryBroker, InMemoryQueue},
    };

    const KEY: &str = "jmbZNVBcpD6gPOv4xs1vbDn0KWOFtLw8LNh0JReQmts=";

    fn envelope(id: &str, body: &str) -> Envelope<Headers, Vec<u8>> {
        let mut headers = Headers::new();
        headers.insert(headers::MESSAGE_ID.into(), id.into());
        Envelope {
            headers,
            message: body.as_bytes().to_vec(),
        }
    }

    fn broker_with(n: usize) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        for i in 1..=n {
            broker.enqueue("src", envelope(&format!("m-{i}"), &format!("body {i}")));
        }
        broker
    }

    fn ids(messages: &[DecodedMessage]) -> Vec<String> {
        messages.iter().map(|m| m.id().to_owned()).collect()
    }

    #[tokio::test]
    async fn peek_is_idempotent_and_non_destructive() {
        let broker = broker_with(3);
        let peeker = Peeker::new(broker.queue("src"));

        let first = peeker.peek(10).await.unwrap();
        let second = peeker.peek(10).await.unwrap();

        assert_eq!(ids(&first), vec!["m-1", "m-2", "m-3"]);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(broker.depth("src"), 3);
    }

    #[tokio::test]
    async fn peek_stops_at_count() {
        let peeker = Peeker::new(broker_with(5).queue("src")).with_batch_size(2);

        let messages = peeker.peek(3).await.unwrap();
        assert_eq!(ids(&messages), vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn peek_across_small_batches_has_no_duplicates() {
        let peeker = Peeker::new(broker_with(7).queue("src")).with_batch_size(3);

        let messages = peeker.peek(100).await.unwrap();
        let unique: HashSet<_> = ids(&messages).into_iter().collect();
        assert_eq!(messages.len(), 7);
        assert_eq!(unique.len(), 7);
    }

    #[tokio::test]
    async fn empty_queue_yields_nothing() {
        let broker = InMemoryBroker::new();
        broker.create_queue("src");
        let peeker = Peeker::new(broker.queue("src"));

        assert!(peeker.peek(10).await.unwrap().is_empty());

        let page = peeker.peek_paged(10, 0).await.unwrap();
        assert!(page.messages.is_empty());
        assert_eq!(page.next_sequence_number, 0);
    }

    #[tokio::test]
    async fn missing_queue_is_a_broker_error() {
        let peeker = Peeker::new(InMemoryBroker::new().queue("nope"));
        let err = peeker.peek(1).await.unwrap_err();
        assert_eq!(err.transport().operation(), BrokerOperation::Peek);
    }

    async fn collect_pages(peeker: &Peeker<InMemoryQueue>, page_size: usize) -> Vec<String> {
        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let page = peeker.peek_paged(page_size, cursor).await.unwrap();
            if page.messages.is_empty() {
                assert_eq!(page.next_sequence_number, cursor);
                break;
            }
            assert!(page.messages.len() <= page_size);
            seen.extend(ids(&page.messages));
            cursor = page.next_sequence_number;
        }
        seen
    }

    #[tokio::test]
    async fn pages_cover_the_queue_exactly_once_for_any_page_size() {
        let broker = broker_with(7);
        let expected: Vec<String> = (1..=7).map(|i| format!("m-{i}")).collect();

        for page_size in 1..=9 {
            for batch_size in [1, 2, 100] {
                let peeker = Peeker::new(broker.queue("src")).with_batch_size(batch_size);
                assert_eq!(
                    collect_pages(&peeker, page_size).await,
                    expected,
                    "page size {page_size}, batch size {batch_size}"
                );
            }
        }
    }

    #[tokio::test]
    async fn zero_page_size_returns_cursor_unchanged() {
        let peeker = Peeker::new(broker_with(2).queue("src"));
        let page = peeker.peek_paged(0, 1).await.unwrap();
        assert!(page.messages.is_empty());
        assert_eq!(page.next_sequence_number, 1);
    }

    #[tokio::test]
    async fn undecodable_messages_stay_in_the_result() {
        let broker = broker_with(1);
        let mut bad = envelope("m-bad", "");
        bad.message = vec![0xc3, 0x28];
        broker.enqueue("src", bad);
        broker.enqueue("src", envelope("m-3", "body 3"));

        let messages = Peeker::new(broker.queue("src")).peek(10).await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].status(), DecodeStatus::Error);
        assert_eq!(messages[1].id(), "Error (2)");
        assert_eq!(messages[2].id(), "m-3");
    }

    #[tokio::test]
    async fn unreadable_bodies_are_skipped_but_advance_the_cursor() {
        let broker = broker_with(1);
        broker.enqueue_with("src", envelope("m-2", "lost"), |m| {
            m.body = MessageBody::Unreadable("stream reset".into());
        });
        broker.enqueue("src", envelope("m-3", "body 3"));
        let peeker = Peeker::new(broker.queue("src"));

        assert_eq!(ids(&peeker.peek(10).await.unwrap()), vec!["m-1", "m-3"]);

        let page = peeker.peek_paged(1, 1).await.unwrap();
        assert_eq!(ids(&page.messages), vec!["m-3"]);
        assert_eq!(page.next_sequence_number, 3);
    }

    #[tokio::test]
    async fn state_filter_applies_to_both_modes() {
        let broker = broker_with(2);
        broker.enqueue_with("src", envelope("m-s", "later"), |m| {
            m.state = MessageState::Scheduled;
        });
        broker.enqueue("src", envelope("m-4", "body 4"));

        let scheduled = Peeker::new(broker.queue("src")).with_state(MessageState::Scheduled);
        assert_eq!(ids(&scheduled.peek(10).await.unwrap()), vec!["m-s"]);

        let active = Peeker::new(broker.queue("src")).with_state(MessageState::Active);
        let page = active.peek_paged(3, 0).await.unwrap();
        assert_eq!(ids(&page.messages), vec!["m-1", "m-2", "m-4"]);
        assert_eq!(page.next_sequence_number, 4);
    }

    #[tokio::test]
    async fn peek_all_uses_the_reported_depth() {
        let broker = broker_with(4);
        broker.enqueue_with("src", envelope("m-d", "deferred"), |m| {
            m.state = MessageState::Deferred;
        });

        let all = Peeker::new(broker.queue("src")).peek_all().await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn encrypted_compressed_message_decodes_to_original_text() {
        let key = EncryptionKey::from_base64(KEY).unwrap();
        let text = "#1 The body med æ og ø og å";
        let mut raw = envelope("m-secret", "");
        raw.message = CodecChain::standard(Some(key.clone()))
            .encode(text.as_bytes().to_vec(), &mut raw.headers)
            .unwrap();

        let broker = InMemoryBroker::new();
        broker.enqueue("src", raw);

        let peeker =
            Peeker::new(broker.queue("src")).with_decoder(EnvelopeDecoder::with_key(key));
        let messages = peeker.peek(1).await.unwrap();

        assert!(messages[0].is_ok());
        assert_eq!(messages[0].body().as_bytes(), text.as_bytes());
    }
}
