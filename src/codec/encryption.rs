use base64::{Engine as _, engine::general_purpose::STANDARD};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;

use crate::{
    Headers,
    codec::{CodecError, CodecErrorKind, ContentCodec},
    headers,
};

const STAGE: &str = "encryption";
const IV_LEN: usize = 16;

/// Symmetric AES key (128, 192 or 256 bits).
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, CodecError> {
        let bytes = bytes.into();
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(bytes)),
            len => Err(CodecError::new(
                STAGE,
                CodecErrorKind::InvalidKeyMaterial(format!(
                    "key must be 16, 24 or 32 bytes, got {len}"
                )),
            )),
        }
    }

    /// Create a key from its base64 representation, as bus configurations
    /// usually carry it.
    pub fn from_base64(encoded: &str) -> Result<Self, CodecError> {
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            CodecError::new(STAGE, CodecErrorKind::InvalidKeyMaterial(e.to_string()))
        })?;
        Self::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey({} bits)", self.0.len() * 8)
    }
}

/// AES-CBC stage with PKCS7 padding.
///
/// The per-message IV travels base64-encoded in the
/// [`ENCRYPTION_IV`](crate::headers::ENCRYPTION_IV) header. A message carrying
/// the header while no key is configured fails to decode.
#[derive(Debug, Clone, Default)]
pub struct EncryptionCodec {
    key: Option<EncryptionKey>,
}

impl EncryptionCodec {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    fn key(&self) -> Result<&EncryptionKey, CodecError> {
        self.key
            .as_ref()
            .ok_or_else(|| CodecError::new(STAGE, CodecErrorKind::MissingKey))
    }
}

impl ContentCodec for EncryptionCodec {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn applies(&self, headers: &Headers) -> bool {
        headers.contains_key(headers::ENCRYPTION_IV)
    }

    fn decode(&self, body: Vec<u8>, headers: &Headers) -> Result<Vec<u8>, CodecError> {
        let key = self.key()?;
        let iv = headers
            .get(headers::ENCRYPTION_IV)
            .map(|iv| STANDARD.decode(iv.trim()))
            .transpose()
            .map_err(|e| {
                CodecError::new(STAGE, CodecErrorKind::InvalidKeyMaterial(e.to_string()))
            })?
            .unwrap_or_default();

        decrypt(key.as_bytes(), &iv, &body)
    }

    fn encode(&self, body: Vec<u8>, headers: &mut Headers) -> Result<Vec<u8>, CodecError> {
        let key = self.key()?;
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let encrypted = encrypt(key.as_bytes(), &iv, &body)?;
        headers.insert(headers::ENCRYPTION_IV.to_owned(), STANDARD.encode(iv));
        Ok(encrypted)
    }
}

fn invalid_length(_: cbc::cipher::InvalidLength) -> CodecError {
    CodecError::new(
        STAGE,
        CodecErrorKind::InvalidKeyMaterial(format!("IV must be {IV_LEN} bytes")),
    )
}

fn decrypt(key: &[u8], iv: &[u8], body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let plain = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(body),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(body),
        _ => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(body),
    };
    plain.map_err(|_| CodecError::new(STAGE, CodecErrorKind::Decrypt))
}

fn encrypt(key: &[u8], iv: &[u8], body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let encrypted = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(body),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(body),
        _ => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(invalid_length)?
            .encrypt_padded_vec_mut::<Pkcs7>(body),
    };
    Ok(encrypted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "jmbZNVBcpD6gPOv4xs1vbDn0KWOFtLw8LNh0JReQmts=";

    fn encrypted(codec: &EncryptionCodec, plain: &[u8]) -> (Vec<u8>, Headers) {
        let mut headers = Headers::new();
        let body = codec.encode(plain.to_vec(), &mut headers).unwrap();
        (body, headers)
    }

    #[test]
    fn rejects_keys_of_wrong_length() {
        assert!(EncryptionKey::from_bytes(vec![0u8; 15]).is_err());
        assert!(EncryptionKey::from_bytes(vec![0u8; 24]).is_ok());
        assert!(EncryptionKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn decrypts_with_iv_from_header() {
        let codec = EncryptionCodec::new(Some(EncryptionKey::from_base64(KEY).unwrap()));
        let (body, headers) = encrypted(&codec, b"attack at dawn");

        assert!(codec.applies(&headers));
        assert_ne!(body, b"attack at dawn");
        assert_eq!(codec.decode(body, &headers).unwrap(), b"attack at dawn");
    }

    #[test]
    fn supports_aes_128() {
        let codec = EncryptionCodec::new(Some(EncryptionKey::from_bytes([7u8; 16]).unwrap()));
        let (body, headers) = encrypted(&codec, b"short key");
        assert_eq!(codec.decode(body, &headers).unwrap(), b"short key");
    }

    #[test]
    fn wrong_key_fails() {
        let codec = EncryptionCodec::new(Some(EncryptionKey::from_base64(KEY).unwrap()));
        let (body, headers) = encrypted(&codec, b"some secret payload");

        let other = EncryptionCodec::new(Some(EncryptionKey::from_bytes([1u8; 32]).unwrap()));
        // a wrong key almost always breaks the padding; if it does not, the
        // plaintext still differs
        match other.decode(body, &headers) {
            Ok(plain) => assert_ne!(plain, b"some secret payload"),
            Err(err) => assert!(matches!(err.kind(), CodecErrorKind::Decrypt)),
        }
    }

    #[test]
    fn missing_key_fails() {
        let keyed = EncryptionCodec::new(Some(EncryptionKey::from_base64(KEY).unwrap()));
        let (body, headers) = encrypted(&keyed, b"payload");

        let err = EncryptionCodec::new(None)
            .decode(body, &headers)
            .unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::MissingKey));
    }

    #[test]
    fn bad_iv_fails() {
        let codec = EncryptionCodec::new(Some(EncryptionKey::from_base64(KEY).unwrap()));
        let mut headers = Headers::new();
        headers.insert(headers::ENCRYPTION_IV.into(), STANDARD.encode([0u8; 4]));

        let err = codec.decode(vec![0u8; 16], &headers).unwrap_err();
        assert!(matches!(err.kind(), CodecErrorKind::InvalidKeyMaterial(_)));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let key = EncryptionKey::from_base64(KEY).unwrap();
        assert_eq!(format!("{key:?}"), "EncryptionKey(256 bits)");
    }
}
