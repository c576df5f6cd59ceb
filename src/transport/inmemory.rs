use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    envelope::{BrokeredMessage, MessageBody, MessageState},
    transport::{
        BrokerEnvelope, PeekMessages, ProvisionQueues, QueueStats, ReceiveMessages, SendMessages,
    },
};

/// In-memory broker for testing or local pipelines.
///
/// Stores every queue in a shared map and hands out [`InMemoryQueue`] clients
/// bound to a single queue, the way broker SDKs hand out queue clients. It is
/// useful for:
/// - Unit and integration testing
/// - Simulating relocation runs without a real broker
/// - Debugging triage decisions
///
/// Sequence numbers are assigned from a single counter across all queues and
/// start at 1. Receiving ignores the timeout: an empty queue yields `None`
/// immediately.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    // std mutex: transactions roll back from `Drop`, where awaiting is not
    // possible, and the lock is never held across an await point.
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, BTreeMap<i64, Stored>>,
    next_sequence: i64,
    provision_calls: usize,
    rejected_destinations: HashSet<String>,
}

struct Stored {
    message: BrokeredMessage,
    locked: bool,
}

impl State {
    fn next_sequence(&mut self) -> i64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn append(&mut self, queue: &str, envelope: BrokerEnvelope) -> i64 {
        let sequence_number = self.next_sequence();
        let message = BrokeredMessage {
            broker_message_id: sequence_number.to_string(),
            sequence_number,
            label: None,
            enqueued_at: Utc::now(),
            state: MessageState::Active,
            headers: envelope.headers,
            body: MessageBody::Bytes(envelope.message),
        };
        self.queues.entry(queue.to_owned()).or_default().insert(
            sequence_number,
            Stored {
                message,
                locked: false,
            },
        );
        sequence_number
    }

    fn unlock(&mut self, queue: &str, sequence_number: i64) {
        if let Some(stored) = self
            .queues
            .get_mut(queue)
            .and_then(|q| q.get_mut(&sequence_number))
        {
            stored.locked = false;
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client bound to `queue`. The queue does not need to exist yet.
    pub fn queue(&self, queue: impl Into<String>) -> InMemoryQueue {
        InMemoryQueue {
            broker: self.clone(),
            name: queue.into(),
        }
    }

    /// Create `queue` if it does not exist.
    pub fn create_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_owned()).or_default();
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Enqueue an active message, creating the queue if needed.
    ///
    /// Returns the assigned sequence number.
    pub fn enqueue(&self, queue: &str, envelope: impl Into<BrokerEnvelope>) -> i64 {
        self.lock().append(queue, envelope.into())
    }

    /// Enqueue a message and adjust its broker metadata (label, state, body,
    /// broker id) before it becomes visible. The sequence number is always
    /// assigned by the broker.
    pub fn enqueue_with(
        &self,
        queue: &str,
        envelope: impl Into<BrokerEnvelope>,
        adjust: impl FnOnce(&mut BrokeredMessage),
    ) -> i64 {
        let mut state = self.lock();
        let sequence_number = state.append(queue, envelope.into());
        if let Some(stored) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.get_mut(&sequence_number))
        {
            adjust(&mut stored.message);
            stored.message.sequence_number = sequence_number;
        }
        sequence_number
    }

    /// Snapshot of every message in `queue`, locked ones included, in
    /// sequence order.
    pub fn messages(&self, queue: &str) -> Vec<BrokeredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.values().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages in `queue`, locked ones included.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, BTreeMap::len)
    }

    /// Total number of messages across all queues.
    pub fn total_depth(&self) -> usize {
        self.lock().queues.values().map(BTreeMap::len).sum()
    }

    /// How many times queue provisioning was requested.
    pub fn provision_calls(&self) -> usize {
        self.lock().provision_calls
    }

    /// Make every send to `queue` fail, simulating a broker-side rejection.
    pub fn reject_sends_to(&self, queue: &str) {
        self.lock().rejected_destinations.insert(queue.to_owned());
    }
}

/// Client bound to one queue of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryQueue {
    broker: InMemoryBroker,
    name: String,
}

impl InMemoryQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

/// Transaction of an [`InMemoryQueue`].
///
/// Rolls back on drop unless committed.
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    received: Vec<(String, i64)>,
    outgoing: Vec<(String, BrokerEnvelope)>,
    completed: bool,
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.completed || self.received.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (queue, sequence_number) in &self.received {
            state.unlock(queue, *sequence_number);
        }
        tracing::debug!(
            received = self.received.len(),
            discarded_sends = self.outgoing.len(),
            "In-memory transaction rolled back"
        );
    }
}

#[async_trait]
impl PeekMessages for InMemoryQueue {
    type Error = InMemoryBrokerError;

    async fn peek_batch(&self, max_count: usize) -> Result<Vec<BrokeredMessage>, Self::Error> {
        self.peek_batch_from(0, max_count).await
    }

    async fn peek_batch_from(
        &self,
        from_sequence: i64,
        max_count: usize,
    ) -> Result<Vec<BrokeredMessage>, Self::Error> {
        let state = self.broker.lock();
        let queue = state
            .queues
            .get(&self.name)
            .ok_or_else(|| InMemoryBrokerError::queue_not_found(&self.name))?;

        Ok(queue
            .range(from_sequence..)
            .take(max_count)
            .map(|(_, s)| s.message.clone())
            .collect())
    }
}

#[async_trait]
impl ReceiveMessages for InMemoryQueue {
    type Error = InMemoryBrokerError;
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.broker.state),
            received: Vec::new(),
            outgoing: Vec::new(),
            completed: false,
        })
    }

    async fn receive(
        &self,
        tx: &mut Self::Transaction,
        _timeout: Duration,
    ) -> Result<Option<BrokeredMessage>, Self::Error> {
        let mut state = self.broker.lock();
        let queue = state
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| InMemoryBrokerError::queue_not_found(&self.name))?;

        let next = queue
            .values_mut()
            .find(|s| !s.locked && s.message.state == MessageState::Active);

        Ok(next.map(|stored| {
            stored.locked = true;
            tx.received
                .push((self.name.clone(), stored.message.sequence_number));
            stored.message.clone()
        }))
    }

    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        let mut state = self.broker.lock();

        for (queue, _) in &tx.outgoing {
            if !state.queues.contains_key(queue) {
                return Err(InMemoryBrokerError::queue_not_found(queue));
            }
        }

        for (queue, sequence_number) in tx.received.drain(..) {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.remove(&sequence_number);
            }
        }
        for (queue, envelope) in tx.outgoing.drain(..) {
            state.append(&queue, envelope);
        }
        tx.completed = true;

        tracing::debug!("In-memory transaction committed");
        Ok(())
    }
}

#[async_trait]
impl SendMessages for InMemoryQueue {
    async fn send(
        &self,
        queue: &str,
        envelope: BrokerEnvelope,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        let state = self.broker.lock();
        if state.rejected_destinations.contains(queue) {
            return Err(InMemoryBrokerError::rejected(queue));
        }
        if !state.queues.contains_key(queue) {
            return Err(InMemoryBrokerError::queue_not_found(queue));
        }
        tx.outgoing.push((queue.to_owned(), envelope));
        Ok(())
    }
}

#[async_trait]
impl ProvisionQueues for InMemoryQueue {
    type Error = InMemoryBrokerError;

    async fn create_queue_if_missing(&self, queue: &str) -> Result<(), Self::Error> {
        let mut state = self.broker.lock();
        state.provision_calls += 1;
        state.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }
}

#[async_trait]
impl QueueStats for InMemoryQueue {
    type Error = InMemoryBrokerError;

    async fn message_count(&self, state: Option<MessageState>) -> Result<u64, Self::Error> {
        let broker = self.broker.lock();
        let queue = broker
            .queues
            .get(&self.name)
            .ok_or_else(|| InMemoryBrokerError::queue_not_found(&self.name))?;

        let count = queue
            .values()
            .filter(|s| match state {
                Some(state) => s.message.state == state,
                None => matches!(
                    s.message.state,
                    MessageState::Active | MessageState::Scheduled
                ),
            })
            .count();
        Ok(count as u64)
    }
}

/// Error type for [`InMemoryBroker`] operations.
#[derive(Debug)]
pub struct InMemoryBrokerError {
    kind: InMemoryBrokerErrorKind,
}

impl InMemoryBrokerError {
    fn queue_not_found(queue: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::QueueNotFound(queue.to_owned()),
        }
    }

    fn rejected(queue: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::Rejected(queue.to_owned()),
        }
    }
}

impl std::fmt::Display for InMemoryBrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryBrokerErrorKind::QueueNotFound(queue) => {
                write!(f, "Queue {queue} not found in in-memory broker")
            }
            InMemoryBrokerErrorKind::Rejected(queue) => {
                write!(f, "Send to queue {queue} rejected by in-memory broker")
            }
        }
    }
}

impl std::error::Error for InMemoryBrokerError {}

#[derive(Debug)]
enum InMemoryBrokerErrorKind {
    QueueNotFound(String),
    Rejected(String),
}
