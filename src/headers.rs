//! Header names shared with the sending bus.
//!
//! These are part of the wire contract: messages produced by Rebus-compatible
//! senders carry them, and relocated messages keep them untouched.

/// Application-level message identity.
pub const MESSAGE_ID: &str = "rbs2-msg-id";

/// Content encoding of the body. `gzip` triggers decompression.
pub const CONTENT_ENCODING: &str = "rbs2-content-encoding";

/// Base64 initialization vector. Its presence triggers decryption.
pub const ENCRYPTION_IV: &str = "rbs2-encrypt-iv";

/// Queue the message was originally sent from.
pub const SOURCE_QUEUE: &str = "rbs2-source-queue";

/// Time the message was sent.
pub const SENT_TIME: &str = "rbs2-senttime";

/// Error details attached by the bus (or by the decoder on failure).
pub const ERROR_DETAILS: &str = "rbs2-error-details";

/// Fallback for [`SENT_TIME`] when the sender already set it.
pub const ENQUEUED_TIME_UTC: &str = "EnqueuedTimeUtc";

/// Broker label of the message.
pub const LABEL: &str = "Label";

/// Fallback for [`ERROR_DETAILS`] when the sender already set it.
pub const EXCEPTION: &str = "Exception";

/// Value of [`CONTENT_ENCODING`] for gzip bodies.
pub const GZIP: &str = "gzip";
