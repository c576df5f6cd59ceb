//! Caller-supplied routing instructions and their resolution.
//!
//! After inspecting peeked messages the caller describes the fate of some of
//! them with [`RelocationInstruction`]s. The relocator loads them into an
//! [`InstructionTable`] and resolves every received message against it. An
//! instruction is consumed the first time it matches, so it is applied at
//! most once per run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{BrokeredMessage, headers};

/// Desired fate of one identified message.
///
/// When several actions are set, the destination queue wins over delete,
/// and delete wins over return-to-source. An empty destination string counts
/// as no destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationInstruction {
    pub message_id: String,
    #[serde(default)]
    pub destination_queue: Option<String>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub return_to_source: bool,
}

impl RelocationInstruction {
    /// Move the message to `queue`.
    pub fn move_to(message_id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            destination_queue: Some(queue.into()),
            delete: false,
            return_to_source: false,
        }
    }

    /// Remove the message from the source queue.
    pub fn delete(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            destination_queue: None,
            delete: true,
            return_to_source: false,
        }
    }

    /// Send the message back to the queue it was originally sent from.
    pub fn return_to_source(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            destination_queue: None,
            delete: false,
            return_to_source: true,
        }
    }

    fn destination(&self) -> Option<&str> {
        self.destination_queue.as_deref().filter(|q| !q.is_empty())
    }
}

/// Terminal outcome of a relocated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelocationOutcome {
    ForwardedToDestination,
    Deleted,
    ReturnedToSource,
    ForwardedToDefault,
}

impl std::fmt::Display for RelocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RelocationOutcome::ForwardedToDestination => "forwarded to destination",
            RelocationOutcome::Deleted => "deleted",
            RelocationOutcome::ReturnedToSource => "returned to source",
            RelocationOutcome::ForwardedToDefault => "forwarded to default",
        };
        f.write_str(name)
    }
}

/// Why a message cannot be relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// Return-to-source was requested but the message has no origin header.
    MissingSourceQueue { message_id: String },
    /// No instruction matched and no default queue is configured.
    NoDefaultQueue { message_id: Option<String> },
}

impl std::fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionFailure::MissingSourceQueue { message_id } => write!(
                f,
                "cannot return message {message_id} to its source queue: {} header is missing",
                headers::SOURCE_QUEUE
            ),
            ResolutionFailure::NoDefaultQueue { message_id } => write!(
                f,
                "no instruction for message {} and no default queue configured",
                message_id.as_deref().unwrap_or("<without id>")
            ),
        }
    }
}

/// What to do with a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Send the message to `queue` and complete the receive.
    Forward {
        queue: String,
        outcome: RelocationOutcome,
    },
    /// Complete the receive without sending anything.
    Delete,
    /// Leave the message on the source queue and halt.
    Fail(ResolutionFailure),
}

impl Resolution {
    pub fn outcome(&self) -> Option<RelocationOutcome> {
        match self {
            Resolution::Forward { outcome, .. } => Some(*outcome),
            Resolution::Delete => Some(RelocationOutcome::Deleted),
            Resolution::Fail(_) => None,
        }
    }
}

/// Identity-keyed, consumable set of instructions.
#[derive(Debug, Clone, Default)]
pub struct InstructionTable {
    entries: HashMap<String, RelocationInstruction>,
}

impl FromIterator<RelocationInstruction> for InstructionTable {
    /// Build a table; the first instruction for an identity wins.
    fn from_iter<T: IntoIterator<Item = RelocationInstruction>>(iter: T) -> Self {
        let mut entries = HashMap::new();
        for instruction in iter {
            if entries.contains_key(&instruction.message_id) {
                tracing::warn!(
                    message_id = %instruction.message_id,
                    "Ignoring duplicate instruction"
                );
                continue;
            }
            entries.insert(instruction.message_id.clone(), instruction);
        }
        Self { entries }
    }
}

impl InstructionTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    /// Remove and return the instruction for `message_id`.
    pub fn take(&mut self, message_id: &str) -> Option<RelocationInstruction> {
        self.entries.remove(message_id)
    }

    /// Identities of instructions not consumed yet.
    pub fn remaining(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Decide the fate of `message`, consuming its instruction if any.
    ///
    /// Precedence: explicit destination, delete, return-to-source, default
    /// queue, failure. An instruction that requests nothing falls through to
    /// the default queue.
    pub fn resolve(&mut self, message: &BrokeredMessage, default_queue: Option<&str>) -> Resolution {
        let message_id = message.header(headers::MESSAGE_ID);

        if let Some(instruction) = message_id.and_then(|id| self.take(id)) {
            if let Some(queue) = instruction.destination() {
                return Resolution::Forward {
                    queue: queue.to_owned(),
                    outcome: RelocationOutcome::ForwardedToDestination,
                };
            }
            if instruction.delete {
                return Resolution::Delete;
            }
            if instruction.return_to_source {
                return match message.header(headers::SOURCE_QUEUE) {
                    Some(queue) if !queue.is_empty() => Resolution::Forward {
                        queue: queue.to_owned(),
                        outcome: RelocationOutcome::ReturnedToSource,
                    },
                    _ => Resolution::Fail(ResolutionFailure::MissingSourceQueue {
                        message_id: instruction.message_id,
                    }),
                };
            }
        }

        match default_queue.filter(|q| !q.is_empty()) {
            Some(queue) => Resolution::Forward {
                queue: queue.to_owned(),
                outcome: RelocationOutcome::ForwardedToDefault,
            },
            None => Resolution::Fail(ResolutionFailure::NoDefaultQueue {
                message_id: message_id.map(str::to_owned),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BrokerHeaders, MessageBody, MessageState};
    use chrono::Utc;

    fn message(id: &str, source_queue: Option<&str>) -> BrokeredMessage {
        let mut headers = BrokerHeaders::new();
        headers.insert(headers::MESSAGE_ID.into(), id.into());
        if let Some(queue) = source_queue {
            headers.insert(headers::SOURCE_QUEUE.into(), queue.into());
        }
        BrokeredMessage {
            broker_message_id: "1".into(),
            sequence_number: 1,
            label: None,
            enqueued_at: Utc::now(),
            state: MessageState::Active,
            headers,
            body: MessageBody::Bytes(Vec::new()),
        }
    }

    fn forward(queue: &str, outcome: RelocationOutcome) -> Resolution {
        Resolution::Forward {
            queue: queue.into(),
            outcome,
        }
    }

    #[test]
    fn destination_wins_over_every_other_flag() {
        let mut table: InstructionTable = [RelocationInstruction {
            message_id: "m".into(),
            destination_queue: Some("qx".into()),
            delete: true,
            return_to_source: true,
        }]
        .into_iter()
        .collect();

        assert_eq!(
            table.resolve(&message("m", Some("origin")), Some("default")),
            forward("qx", RelocationOutcome::ForwardedToDestination)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn delete_wins_over_return_to_source() {
        let mut instruction = RelocationInstruction::delete("m");
        instruction.return_to_source = true;
        instruction.destination_queue = Some(String::new());
        let mut table: InstructionTable = [instruction].into_iter().collect();

        assert_eq!(
            table.resolve(&message("m", Some("origin")), None),
            Resolution::Delete
        );
    }

    #[test]
    fn return_to_source_uses_origin_header() {
        let mut table: InstructionTable = [RelocationInstruction::return_to_source("m")]
            .into_iter()
            .collect();

        assert_eq!(
            table.resolve(&message("m", Some("origin")), Some("default")),
            forward("origin", RelocationOutcome::ReturnedToSource)
        );
    }

    #[test]
    fn return_to_source_without_header_fails_and_consumes_instruction() {
        let mut table: InstructionTable = [RelocationInstruction::return_to_source("m")]
            .into_iter()
            .collect();

        let resolution = table.resolve(&message("m", None), Some("default"));

        assert_eq!(
            resolution,
            Resolution::Fail(ResolutionFailure::MissingSourceQueue {
                message_id: "m".into()
            })
        );
        assert!(resolution.outcome().is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn unmatched_message_goes_to_default_or_fails() {
        let mut table = InstructionTable::default();

        assert_eq!(
            table.resolve(&message("m", None), Some("default")),
            forward("default", RelocationOutcome::ForwardedToDefault)
        );
        assert_eq!(
            table.resolve(&message("m", None), Some("")),
            Resolution::Fail(ResolutionFailure::NoDefaultQueue {
                message_id: Some("m".into())
            })
        );
    }

    #[test]
    fn instruction_is_applied_only_once() {
        let mut table: InstructionTable = [RelocationInstruction::move_to("m", "qx")]
            .into_iter()
            .collect();

        assert_eq!(
            table.resolve(&message("m", None), Some("default")).outcome(),
            Some(RelocationOutcome::ForwardedToDestination)
        );
        assert_eq!(
            table.resolve(&message("m", None), Some("default")).outcome(),
            Some(RelocationOutcome::ForwardedToDefault)
        );
    }

    #[test]
    fn first_instruction_for_an_identity_wins() {
        let table: InstructionTable = [
            RelocationInstruction::move_to("m", "first"),
            RelocationInstruction::move_to("m", "second"),
        ]
        .into_iter()
        .collect();

        assert_eq!(table.len(), 1);
        let mut table = table;
        assert_eq!(
            table.take("m").and_then(|i| i.destination_queue),
            Some("first".into())
        );
    }

    #[test]
    fn empty_instruction_falls_through_to_default() {
        let mut table: InstructionTable = [RelocationInstruction {
            message_id: "m".into(),
            destination_queue: None,
            delete: false,
            return_to_source: false,
        }]
        .into_iter()
        .collect();

        assert_eq!(
            table.resolve(&message("m", None), Some("default")),
            forward("default", RelocationOutcome::ForwardedToDefault)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn instructions_deserialize_with_defaults() {
        let instructions: Vec<RelocationInstruction> = serde_json::from_str(
            r#"[{"message_id": "a", "destination_queue": "qx"}, {"message_id": "b", "delete": true}]"#,
        )
        .unwrap();

        assert_eq!(instructions[0], RelocationInstruction::move_to("a", "qx"));
        assert_eq!(instructions[1], RelocationInstruction::delete("b"));
    }
}
