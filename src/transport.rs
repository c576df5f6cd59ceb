//! Broker capability abstractions.
//!
//! The peek service and the relocator never talk to a concrete broker. They
//! are written against a small set of capability traits, each one covering a
//! single broker concern:
//!
//! - [`PeekMessages`]: non-destructive, resumable enumeration of a queue
//! - [`ReceiveMessages`]: destructive receive under a transaction
//! - [`SendMessages`]: transactional send to any queue
//! - [`ProvisionQueues`]: on-demand queue creation
//! - [`QueueStats`]: queue depth
//!
//! [`InMemoryBroker`] implements all of them and doubles as the test broker.
//!
//! ## Transactions
//!
//! A transaction starts with [`ReceiveMessages::begin`], collects the received
//! message and any sends, and becomes durable on [`ReceiveMessages::commit`].
//! Dropping a transaction without committing it aborts it: the received
//! message becomes visible again on its queue and pending sends are
//! discarded.

pub mod inmemory;

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::{
    Envelope,
    envelope::{BrokerHeaders, BrokeredMessage, MessageState},
};

pub use inmemory::{InMemoryBroker, InMemoryBrokerError, InMemoryQueue, InMemoryTransaction};

/// Envelope as moved between queues, typed broker properties included.
pub type BrokerEnvelope = Envelope<BrokerHeaders, Vec<u8>>;

/// Non-destructive queue enumeration.
///
/// Peeking never takes a lock on the returned messages.
#[async_trait::async_trait]
pub trait PeekMessages {
    /// Backend-specific error type.
    type Error;

    /// Peek up to `max_count` messages from the head of the queue.
    async fn peek_batch(&self, max_count: usize) -> Result<Vec<BrokeredMessage>, Self::Error>;

    /// Peek up to `max_count` messages whose sequence number is greater than
    /// or equal to `from_sequence`, in sequence order.
    async fn peek_batch_from(
        &self,
        from_sequence: i64,
        max_count: usize,
    ) -> Result<Vec<BrokeredMessage>, Self::Error>;
}

/// Destructive receive under a transaction.
#[async_trait::async_trait]
pub trait ReceiveMessages: Send + Sync {
    /// Backend-specific error type.
    type Error;
    /// Transaction handle. Dropping it uncommitted aborts it.
    type Transaction: Send;

    /// Start a new transaction.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Receive and lock the next available message, waiting at most
    /// `timeout`. `None` means the queue has nothing to hand out.
    async fn receive(
        &self,
        tx: &mut Self::Transaction,
        timeout: Duration,
    ) -> Result<Option<BrokeredMessage>, Self::Error>;

    /// Make the receive and every send of the transaction durable together.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    /// Abort the transaction explicitly.
    async fn abort(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        drop(tx);
        Ok(())
    }
}

/// Transactional send.
#[async_trait::async_trait]
pub trait SendMessages: ReceiveMessages {
    /// Enlist a send of `envelope` to `queue` in `tx`.
    async fn send(
        &self,
        queue: &str,
        envelope: BrokerEnvelope,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error>;
}

/// On-demand queue creation.
#[async_trait::async_trait]
pub trait ProvisionQueues {
    /// Backend-specific error type.
    type Error;

    /// Create `queue` unless it already exists.
    async fn create_queue_if_missing(&self, queue: &str) -> Result<(), Self::Error>;
}

/// Queue depth reporting.
#[async_trait::async_trait]
pub trait QueueStats {
    /// Backend-specific error type.
    type Error;

    /// Number of messages in `state`, or active plus scheduled when `None`.
    async fn message_count(&self, state: Option<MessageState>) -> Result<u64, Self::Error>;
}

/// Broker operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOperation {
    Peek,
    Begin,
    Receive,
    Send,
    Commit,
    Abort,
    Provision,
    Stats,
}

impl std::fmt::Display for BrokerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BrokerOperation::Peek => "peek",
            BrokerOperation::Begin => "begin",
            BrokerOperation::Receive => "receive",
            BrokerOperation::Send => "send",
            BrokerOperation::Commit => "commit",
            BrokerOperation::Abort => "abort",
            BrokerOperation::Provision => "provision",
            BrokerOperation::Stats => "stats",
        };
        f.write_str(name)
    }
}

/// Error returned by broker operations.
///
/// Each error captures:
/// - The broker operation that failed
/// - The underlying backend error
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    operation: BrokerOperation,
    source: tower::BoxError,
}

impl TransportError {
    /// Wrap a backend error raised by `operation`.
    pub fn new(operation: BrokerOperation, err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            operation,
            source: err.into(),
        }
    }

    pub fn operation(&self) -> BrokerOperation {
        self.operation
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Broker {} error: {}", self.operation, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
