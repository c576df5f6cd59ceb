//! Caller-facing entry point tying peek and relocation to one queue.

use tokio_util::sync::CancellationToken;

use crate::{
    DecodedMessage,
    decoder::EnvelopeDecoder,
    envelope::MessageState,
    instructions::RelocationInstruction,
    peek::{PeekError, PeekPage, Peeker},
    relocator::{RelocationConfig, RelocationError, RelocationReport, Relocator},
    transport::{PeekMessages, ProvisionQueues, QueueStats, ReceiveMessages, SendMessages},
};

/// Inspect a queue and relocate selected messages out of it.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use requeue::{InMemoryBroker, QueueTriage, RelocationInstruction, Headers, Envelope};
///
/// let broker = InMemoryBroker::new();
/// let mut headers = Headers::new();
/// headers.insert("rbs2-msg-id".into(), "order-1".into());
/// broker.enqueue("error", Envelope { headers, message: b"{}".to_vec() });
///
/// let triage = QueueTriage::new(broker.queue("error"));
/// let peeked = triage.peek(10).await?;
/// assert_eq!(peeked[0].id(), "order-1");
///
/// let report = triage
///     .relocate([RelocationInstruction::move_to("order-1", "orders")], None)
///     .await?;
/// assert_eq!(report.relocated(), 1);
/// assert_eq!(broker.depth("orders"), 1);
/// # Ok(())
/// # }
/// ```
pub struct QueueTriage<Q> {
    peeker: Peeker<Q>,
    config: RelocationConfig,
    cancel: CancellationToken,
}

impl<Q: Clone> QueueTriage<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            peeker: Peeker::new(queue),
            config: RelocationConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: EnvelopeDecoder) -> Self {
        self.peeker = self.peeker.with_decoder(decoder);
        self
    }

    /// Only peek messages in `state`. State names parse case-insensitively
    /// with [`str::parse`].
    pub fn with_state(mut self, state: MessageState) -> Self {
        self.peeker = self.peeker.with_state(state);
        self
    }

    /// Base settings for relocation runs. The default queue passed to
    /// [`QueueTriage::relocate`] overrides the configured one.
    pub fn with_relocation_config(mut self, config: RelocationConfig) -> Self {
        self.config = config;
        self
    }

    /// Token stopping any relocation run started by this triage.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn queue(&self) -> &Q {
        self.peeker.queue()
    }
}

impl<Q> QueueTriage<Q>
where
    Q: PeekMessages + Clone + Sync,
    Q::Error: Into<tower::BoxError>,
{
    /// Decode up to `count` messages from the head of the queue.
    pub async fn peek(&self, count: usize) -> Result<Vec<DecodedMessage>, PeekError> {
        self.peeker.peek(count).await
    }

    /// Decode one page after `cursor`. Pass `0` for the first page and the
    /// returned cursor for the following ones.
    pub async fn peek_paged(&self, page_size: usize, cursor: i64) -> Result<PeekPage, PeekError> {
        self.peeker.peek_paged(page_size, cursor).await
    }
}

impl<Q> QueueTriage<Q>
where
    Q: PeekMessages + QueueStats + Clone + Sync,
    <Q as PeekMessages>::Error: Into<tower::BoxError>,
    <Q as QueueStats>::Error: Into<tower::BoxError>,
{
    /// Decode every message currently on the queue.
    pub async fn peek_all(&self) -> Result<Vec<DecodedMessage>, PeekError> {
        self.peeker.peek_all().await
    }
}

impl<Q> QueueTriage<Q>
where
    Q: SendMessages + ProvisionQueues + Clone,
    <Q as ReceiveMessages>::Error: Into<tower::BoxError>,
    <Q as ProvisionQueues>::Error: Into<tower::BoxError>,
{
    /// Relocate messages according to `instructions`, sending unmatched
    /// ones to `default_queue`.
    #[tracing::instrument(skip_all, fields(default_queue))]
    pub async fn relocate(
        &self,
        instructions: impl IntoIterator<Item = RelocationInstruction>,
        default_queue: Option<&str>,
    ) -> Result<RelocationReport, RelocationError> {
        let mut config = self.config.clone();
        if let Some(queue) = default_queue {
            tracing::Span::current().record("default_queue", queue);
            config.default_queue = Some(queue.to_owned());
        }

        Relocator::new(self.queue().clone(), config)
            .run(instructions, self.cancel.clone())
            .await
    }
}
