//! Header-driven content codecs.
//!
//! A message body may have gone through a number of transformations on the
//! sending side (compression, then encryption). Each transformation is a
//! [`ContentCodec`] stage; a [`CodecChain`] applies the stages that the
//! message headers ask for, in order, when decoding, and in reverse order when
//! encoding.
//!
//! ## Stages
//!
//! - [`EncryptionCodec`]: AES-CBC, triggered by the IV header
//! - [`GzipCodec`]: gzip, triggered by `content-encoding: gzip`
//!
//! New content encodings are added by implementing [`ContentCodec`] and
//! pushing the stage onto a chain; nothing else needs to change.

pub mod encryption;
pub mod gzip;

use tracing_error::SpanTrace;

use crate::Headers;

pub use encryption::{EncryptionCodec, EncryptionKey};
pub use gzip::GzipCodec;

/// A single, optional body transformation selected by message headers.
pub trait ContentCodec: Send + Sync {
    /// Short name used in logs and error details.
    fn name(&self) -> &'static str;

    /// Whether the headers say this stage was applied to the body.
    fn applies(&self, headers: &Headers) -> bool;

    /// Undo the transformation.
    fn decode(&self, body: Vec<u8>, headers: &Headers) -> Result<Vec<u8>, CodecError>;

    /// Apply the transformation and stamp the headers that announce it.
    fn encode(&self, body: Vec<u8>, headers: &mut Headers) -> Result<Vec<u8>, CodecError>;
}

/// Ordered set of codec stages.
///
/// Stages are listed in decode order: the first stage is the outermost layer
/// of the body as stored on the broker.
#[derive(Default)]
pub struct CodecChain {
    stages: Vec<Box<dyn ContentCodec>>,
}

impl CodecChain {
    /// Create an empty chain. Bodies pass through untouched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decryption followed by decompression, the layout used by Rebus senders.
    pub fn standard(key: Option<EncryptionKey>) -> Self {
        Self::new()
            .with_stage(EncryptionCodec::new(key))
            .with_stage(GzipCodec)
    }

    /// Append a stage. It runs after all previously added stages on decode.
    pub fn with_stage(mut self, stage: impl ContentCodec + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Names of the configured stages, in decode order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Decode a body by applying every stage whose header is present.
    pub fn decode(&self, mut body: Vec<u8>, headers: &Headers) -> Result<Vec<u8>, CodecError> {
        for stage in &self.stages {
            if stage.applies(headers) {
                tracing::trace!(stage = stage.name(), "Decoding body");
                body = stage.decode(body, headers)?;
            }
        }
        Ok(body)
    }

    /// Encode a body with every stage, innermost first, stamping headers.
    pub fn encode(&self, mut body: Vec<u8>, headers: &mut Headers) -> Result<Vec<u8>, CodecError> {
        for stage in self.stages.iter().rev() {
            body = stage.encode(body, headers)?;
        }
        Ok(body)
    }
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Error raised by a codec stage.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    stage: &'static str,
    kind: CodecErrorKind,
}

/// Codec error kinds.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// The body is encrypted but no key was configured.
    MissingKey,
    /// The key or IV could not be parsed or has the wrong length.
    InvalidKeyMaterial(String),
    /// Decryption or padding removal failed.
    Decrypt,
    /// The compressed stream is corrupt.
    Io(std::io::Error),
}

impl CodecError {
    pub(crate) fn new(stage: &'static str, kind: CodecErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            stage,
            kind,
        }
    }

    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecErrorKind::MissingKey => write!(f, "body is encrypted but no key is configured"),
            CodecErrorKind::InvalidKeyMaterial(msg) => write!(f, "invalid key material: {msg}"),
            CodecErrorKind::Decrypt => write!(f, "decryption failed"),
            CodecErrorKind::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Codec error in {} stage: {}", self.stage, self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}
