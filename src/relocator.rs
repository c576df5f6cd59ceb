//! Transactional triage loop.
//!
//! The [`Relocator`] drains a source queue one message at a time. Every
//! iteration is one broker transaction:
//!
//! - Receive and lock the next message
//! - Resolve it against the [`InstructionTable`]
//! - Forward it (creating the destination on first use), or drop it
//! - Commit, making the receive and the send durable together
//!
//! When a message cannot be resolved the transaction is aborted, leaving the
//! message on the source queue, and the run halts with a [`RelocationError`].
//! Iterations committed before the failure stay committed.
//!
//! The loop runs until:
//! - The source queue yields no message
//! - Every instruction was consumed (in [`Termination::InstructionsConsumed`]
//!   mode)
//! - The iteration cap or the deadline is reached
//! - A [`CancellationToken`] is triggered

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    BrokeredMessage, headers,
    instructions::{
        InstructionTable, RelocationInstruction, RelocationOutcome, Resolution, ResolutionFailure,
    },
    transport::{
        BrokerOperation, ProvisionQueues, ReceiveMessages, SendMessages, TransportError,
    },
};

/// When a relocation run stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Drain the whole queue, sending every unmatched message to the default
    /// queue.
    #[default]
    DrainQueue,
    /// Stop as soon as every instruction was consumed. Unmatched messages
    /// received before that point go to the default queue.
    InstructionsConsumed,
}

/// Relocation run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Destination for messages without an instruction.
    pub default_queue: Option<String>,
    pub termination: Termination,
    /// How long a single receive may wait for a message.
    pub receive_timeout: Duration,
    /// Maximum number of messages received in one run.
    pub max_iterations: Option<usize>,
    /// Wall-clock budget for one run.
    pub deadline: Option<Duration>,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            default_queue: None,
            termination: Termination::default(),
            receive_timeout: Duration::from_secs(5),
            max_iterations: None,
            deadline: None,
        }
    }
}

impl RelocationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    QueueEmpty,
    InstructionsConsumed,
    IterationCap,
    DeadlineElapsed,
    Cancelled,
    /// The run halted with an error.
    Failed,
}

/// Tally of a relocation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelocationReport {
    pub forwarded: usize,
    pub deleted: usize,
    pub returned_to_source: usize,
    pub forwarded_to_default: usize,
    /// Instructions that never matched a received message.
    pub unconsumed_instructions: Vec<String>,
    /// Instruction matched by the message in flight when the run stopped.
    ///
    /// The instruction is spent but its message is still on the source
    /// queue: the run failed, was cancelled or ran out of time before the
    /// transaction committed. Include it again to retry that message.
    pub uncommitted_instruction: Option<String>,
    pub stop_reason: StopReason,
}

impl RelocationReport {
    /// Number of messages removed from the source queue.
    pub fn relocated(&self) -> usize {
        self.forwarded + self.deleted + self.returned_to_source + self.forwarded_to_default
    }
}

/// Committed outcomes counted while a run is going.
#[derive(Default)]
struct Tally {
    forwarded: usize,
    deleted: usize,
    returned_to_source: usize,
    forwarded_to_default: usize,
}

impl Tally {
    fn record(&mut self, outcome: RelocationOutcome) {
        match outcome {
            RelocationOutcome::ForwardedToDestination => self.forwarded += 1,
            RelocationOutcome::Deleted => self.deleted += 1,
            RelocationOutcome::ReturnedToSource => self.returned_to_source += 1,
            RelocationOutcome::ForwardedToDefault => self.forwarded_to_default += 1,
        }
    }

    fn into_report(
        self,
        stop_reason: StopReason,
        table: &InstructionTable,
        in_flight: Option<String>,
    ) -> RelocationReport {
        RelocationReport {
            forwarded: self.forwarded,
            deleted: self.deleted,
            returned_to_source: self.returned_to_source,
            forwarded_to_default: self.forwarded_to_default,
            unconsumed_instructions: table.remaining(),
            uncommitted_instruction: in_flight,
            stop_reason,
        }
    }
}

/// Result of a single committed iteration.
enum Step {
    QueueEmpty,
    Relocated {
        message: BrokeredMessage,
        outcome: RelocationOutcome,
        destination: Option<String>,
    },
}

/// Relocation loop over a source queue client.
///
/// Generic parameters:
/// - `B`: broker client bound to the source queue
/// - `HK`: hook implementation for lifecycle events
///
/// Runs against the same queue must be serialized by the caller; peeking
/// concurrently is fine.
pub struct Relocator<B, HK = DefaultRelocatorHook> {
    broker: B,
    config: RelocationConfig,
    hook: HK,
}

impl<B> Relocator<B, DefaultRelocatorHook> {
    /// Create a new relocator with the default hook implementation.
    pub fn new(broker: B, config: RelocationConfig) -> Self {
        Self {
            broker,
            config,
            hook: DefaultRelocatorHook,
        }
    }
}

impl<B, HK> Relocator<B, HK> {
    /// Replace the hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: RelocatorHook>(self, hook: HK2) -> Relocator<B, HK2> {
        Relocator {
            broker: self.broker,
            config: self.config,
            hook,
        }
    }

    pub fn config(&self) -> &RelocationConfig {
        &self.config
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }
}

impl<B, HK> Relocator<B, HK>
where
    B: SendMessages + ProvisionQueues,
    <B as ReceiveMessages>::Error: Into<tower::BoxError>,
    <B as ProvisionQueues>::Error: Into<tower::BoxError>,
    HK: RelocatorHook,
{
    /// Run the relocation loop with `instructions`.
    ///
    /// Returns the report of a run that stopped cleanly. On error the
    /// message that triggered it is left on the source queue and the error
    /// carries the report of what was committed before.
    ///
    /// Cancelling `cancel` aborts the in-flight transaction, if any, and ends
    /// the run with [`StopReason::Cancelled`].
    #[tracing::instrument(
        skip_all,
        fields(
            default_queue = ?self.config.default_queue,
            termination = ?self.config.termination,
        )
    )]
    pub async fn run(
        &self,
        instructions: impl IntoIterator<Item = RelocationInstruction>,
        cancel: CancellationToken,
    ) -> Result<RelocationReport, RelocationError> {
        let mut table: InstructionTable = instructions.into_iter().collect();
        let mut created_queues = HashSet::new();
        let mut tally = Tally::default();
        let mut in_flight = None;
        let mut iterations = 0usize;
        let deadline = self
            .config
            .deadline
            .map(|budget| tokio::time::Instant::now() + budget);

        self.hook.on_startup(table.len());

        let stop_reason = loop {
            if self.config.termination == Termination::InstructionsConsumed && table.is_empty() {
                break StopReason::InstructionsConsumed;
            }
            if self.config.max_iterations.is_some_and(|max| iterations >= max) {
                break StopReason::IterationCap;
            }
            if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
                break StopReason::DeadlineElapsed;
            }

            let deadline_elapsed = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let step = self.step(&mut table, &mut created_queues, &mut in_flight);

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = deadline_elapsed => break StopReason::DeadlineElapsed,
                step = step => step,
            };

            match step {
                Ok(Step::QueueEmpty) => break StopReason::QueueEmpty,
                Ok(Step::Relocated {
                    message,
                    outcome,
                    destination,
                }) => {
                    iterations += 1;
                    tally.record(outcome);
                    self.hook
                        .on_message_relocated(&message, outcome, destination.as_deref());
                }
                Err(kind) => {
                    let report = tally.into_report(StopReason::Failed, &table, in_flight);
                    let err = RelocationError::new(kind, report);
                    self.hook.on_run_failed(&err);
                    return Err(err);
                }
            }
        };

        let report = tally.into_report(stop_reason, &table, in_flight);
        self.hook.on_stop(&report);
        Ok(report)
    }

    /// One transaction: receive, resolve, forward or drop, commit.
    ///
    /// Returning early, or being dropped, drops the transaction, which aborts
    /// it. `in_flight` holds the matched instruction until the commit lands.
    async fn step(
        &self,
        table: &mut InstructionTable,
        created_queues: &mut HashSet<String>,
        in_flight: &mut Option<String>,
    ) -> Result<Step, RelocationErrorKind> {
        let mut tx = self
            .broker
            .begin()
            .await
            .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Begin, e))?;

        let Some(message) = self
            .broker
            .receive(&mut tx, self.config.receive_timeout)
            .await
            .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Receive, e))?
        else {
            return Ok(Step::QueueEmpty);
        };
        self.hook.on_message_received(&message);

        *in_flight = message
            .header(headers::MESSAGE_ID)
            .filter(|id| table.contains(id))
            .map(str::to_owned);

        let (outcome, destination) =
            match table.resolve(&message, self.config.default_queue.as_deref()) {
                Resolution::Fail(failure) => {
                    self.broker
                        .abort(tx)
                        .await
                        .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Abort, e))?;
                    return Err(RelocationErrorKind::Unresolved(failure));
                }
                Resolution::Delete => (RelocationOutcome::Deleted, None),
                Resolution::Forward { queue, outcome } => {
                    self.forward(&message, &queue, &mut tx, created_queues)
                        .await?;
                    (outcome, Some(queue))
                }
            };

        self.broker
            .commit(tx)
            .await
            .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Commit, e))?;
        *in_flight = None;

        Ok(Step::Relocated {
            message,
            outcome,
            destination,
        })
    }

    async fn forward(
        &self,
        message: &BrokeredMessage,
        queue: &str,
        tx: &mut B::Transaction,
        created_queues: &mut HashSet<String>,
    ) -> Result<(), RelocationErrorKind> {
        if !created_queues.contains(queue) {
            self.broker
                .create_queue_if_missing(queue)
                .await
                .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Provision, e))?;
            created_queues.insert(queue.to_owned());
        }

        let envelope =
            message
                .to_envelope()
                .ok_or_else(|| RelocationErrorKind::UnreadableBody {
                    broker_message_id: message.broker_message_id.clone(),
                })?;

        self.broker
            .send(queue, envelope, tx)
            .await
            .map_err(|e| RelocationErrorKind::broker(BrokerOperation::Send, e))
    }
}

/// Error returned when a relocation run halts.
#[derive(Debug)]
pub struct RelocationError {
    context: SpanTrace,
    kind: RelocationErrorKind,
    report: RelocationReport,
}

/// Classification of relocation errors.
#[derive(Debug)]
pub enum RelocationErrorKind {
    /// A received message could not be resolved.
    Unresolved(ResolutionFailure),
    /// A message had to be forwarded but its body could not be read.
    UnreadableBody { broker_message_id: String },
    /// A broker call failed.
    Transport(TransportError),
}

impl RelocationErrorKind {
    fn broker(operation: BrokerOperation, err: impl Into<tower::BoxError>) -> Self {
        RelocationErrorKind::Transport(TransportError::new(operation, err))
    }
}

impl RelocationError {
    fn new(kind: RelocationErrorKind, report: RelocationReport) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            report,
        }
    }

    pub fn kind(&self) -> &RelocationErrorKind {
        &self.kind
    }

    /// What the run committed before it halted.
    pub fn report(&self) -> &RelocationReport {
        &self.report
    }
}

impl std::fmt::Display for RelocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelocationErrorKind::Unresolved(failure) => writeln!(f, "Relocation halted: {failure}"),
            RelocationErrorKind::UnreadableBody { broker_message_id } => writeln!(
                f,
                "Relocation halted: body of message {broker_message_id} cannot be read"
            ),
            RelocationErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelocationErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Hook trait for observing relocation lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait RelocatorHook: Send + Sync {
    fn on_startup(&self, instructions: usize);
    fn on_message_received(&self, message: &BrokeredMessage);
    fn on_message_relocated(
        &self,
        message: &BrokeredMessage,
        outcome: RelocationOutcome,
        destination: Option<&str>,
    );
    fn on_run_failed(&self, error: &RelocationError);
    fn on_stop(&self, report: &RelocationReport);
}

/// Default relocator hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRelocatorHook;

impl RelocatorHook for DefaultRelocatorHook {
    fn on_startup(&self, instructions: usize) {
        tracing::info!(instructions, "Relocation run starting");
    }

    fn on_message_received(&self, message: &BrokeredMessage) {
        tracing::debug!(
            sequence_number = message.sequence_number,
            "Message received"
        );
    }

    fn on_message_relocated(
        &self,
        message: &BrokeredMessage,
        outcome: RelocationOutcome,
        destination: Option<&str>,
    ) {
        tracing::info!(
            sequence_number = message.sequence_number,
            %outcome,
            destination,
            "Message relocated"
        );
    }

    fn on_run_failed(&self, error: &RelocationError) {
        tracing::error!(?error, relocated = error.report().relocated(), "Relocation run halted");
    }

    fn on_stop(&self, report: &RelocationReport) {
        tracing::info!(
            relocated = report.relocated(),
            stop_reason = ?report.stop_reason,
            "Relocation run finished"
        );
    }
}
