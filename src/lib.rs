#![doc = include_str!("../README.md")]

pub mod codec;
pub mod decoder;
pub mod envelope;
pub mod headers;
pub mod instructions;
pub mod peek;
pub mod relocator;
pub mod transport;
mod triage;

#[doc(inline)]
pub use envelope::{BrokeredMessage, Envelope, Headers, MessageState, RawEnvelope};

#[doc(inline)]
pub use decoder::{DecodeStatus, DecodedMessage, EnvelopeDecoder};

#[doc(inline)]
pub use codec::{CodecChain, CodecError, EncryptionKey};

#[doc(inline)]
pub use instructions::{RelocationInstruction, RelocationOutcome};

#[doc(inline)]
pub use peek::{PeekError, PeekPage, Peeker};

#[doc(inline)]
pub use relocator::{
    DefaultRelocatorHook, RelocationConfig, RelocationError, RelocationErrorKind,
    RelocationReport, Relocator, RelocatorHook, StopReason, Termination,
};

#[doc(inline)]
pub use transport::{InMemoryBroker, TransportError};

#[doc(inline)]
pub use triage::QueueTriage;
