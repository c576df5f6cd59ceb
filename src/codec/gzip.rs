use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::{
    Headers,
    codec::{CodecError, CodecErrorKind, ContentCodec},
    headers,
};

const STAGE: &str = "gzip";

/// Gzip stage, triggered by `content-encoding: gzip`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

impl ContentCodec for GzipCodec {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn applies(&self, headers: &Headers) -> bool {
        headers
            .get(headers::CONTENT_ENCODING)
            .is_some_and(|v| v == headers::GZIP)
    }

    fn decode(&self, body: Vec<u8>, _headers: &Headers) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(body.len() * 2);
        GzDecoder::new(body.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| CodecError::new(STAGE, CodecErrorKind::Io(e)))?;
        Ok(out)
    }

    fn encode(&self, body: Vec<u8>, headers: &mut Headers) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| CodecError::new(STAGE, CodecErrorKind::Io(e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| CodecError::new(STAGE, CodecErrorKind::Io(e)))?;

        headers.insert(headers::CONTENT_ENCODING.to_owned(), headers::GZIP.to_owned());
        Ok(compressed)
    }
}
