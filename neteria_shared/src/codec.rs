//! Serialize/deserialize pipeline: JSON, optional deflate+base64
//! compression, optional RSA envelope encryption.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use std::io::Read;
use thiserror::Error;

use crate::crypto::{KeyPair, PublicKeyParams};
use crate::message::Message;

/// A failure at any stage of the decode pipeline. The engine treats every
/// variant identically: drop the datagram, never reply.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("bad compression: {0}")]
    Compression(#[from] std::io::Error),
    #[error("bad ciphertext: {0}")]
    Crypto(String),
}

/// Per-endpoint codec configuration. Both sides must agree out of band on
/// whether compression/encryption are in use -- the wire format itself
/// carries no "this datagram is compressed" flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    pub compression: bool,
    pub encryption: bool,
}

impl Codec {
    pub fn new(compression: bool, encryption: bool) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    /// Encodes a message for the wire. Encryption is only applied when
    /// both `self.encryption` is set *and* `peer_key` is given -- a
    /// caller that does not yet know the peer's key (handshake messages,
    /// or payload messages sent before registration completes) gets a
    /// compressed-but-plaintext envelope instead of an error.
    pub fn encode(&self, msg: &Message, peer_key: Option<&PublicKeyParams>) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(msg)?;

        let payload = if self.compression {
            deflate_base64(&json)?
        } else {
            json
        };

        if self.encryption {
            if let Some(key) = peer_key {
                return encrypt_chunks(&payload, key);
            }
        }
        Ok(payload)
    }

    /// Decodes a datagram. Decryption is attempted only when `our_keypair`
    /// is given -- callers pass `None` for handshake messages or before
    /// the encrypted channel is established.
    pub fn decode(&self, bytes: &[u8], our_keypair: Option<&KeyPair>) -> Result<Message, CodecError> {
        let after_crypto: Vec<u8> = if self.encryption {
            match our_keypair {
                Some(keypair) => decrypt_chunks(bytes, keypair)?,
                None => bytes.to_vec(),
            }
        } else {
            bytes.to_vec()
        };

        let json = if self.compression {
            inflate_base64(&after_crypto)?
        } else {
            after_crypto
        };

        Ok(serde_json::from_slice(&json)?)
    }
}

fn deflate_base64(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(data, Compression::default());
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed)?;
    Ok(STANDARD.encode(compressed).into_bytes())
}

fn inflate_base64(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let raw = STANDARD.decode(data)?;
    let mut decoder = ZlibDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Splits `data` into chunks no larger than the peer key's max chunk size,
/// encrypts each independently, base64-encodes each ciphertext, and
/// JSON-serializes the resulting list of base64 strings.
fn encrypt_chunks(data: &[u8], key: &PublicKeyParams) -> Result<Vec<u8>, CodecError> {
    let max_len = key.max_chunk_len();
    if max_len == 0 {
        return Err(CodecError::Crypto("public key too small to encrypt anything".into()));
    }

    let chunks: Vec<String> = data
        .chunks(max_len)
        .map(|chunk| {
            key.encrypt(chunk)
                .map(|ct| STANDARD.encode(ct))
                .map_err(|e| CodecError::Crypto(e.to_string()))
        })
        .collect::<Result<_, _>>()?;

    Ok(serde_json::to_vec(&chunks)?)
}

fn decrypt_chunks(data: &[u8], keypair: &KeyPair) -> Result<Vec<u8>, CodecError> {
    let chunks: Vec<String> = serde_json::from_slice(data)?;
    let mut out = Vec::new();
    for chunk in chunks {
        let raw = STANDARD.decode(chunk.as_bytes())?;
        let plain = keypair
            .decrypt(&raw)
            .map_err(|e| CodecError::Crypto(e.to_string()))?;
        out.extend_from_slice(&plain);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClientId;

    fn sample_message() -> Message {
        Message::Ohai {
            cuuid: ClientId::new(),
            version: "1.0.2".to_string(),
        }
    }

    #[test]
    fn plain_roundtrip() {
        let codec = Codec::new(false, false);
        let msg = sample_message();
        let bytes = codec.encode(&msg, None).unwrap();
        let back = codec.decode(&bytes, None).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn compressed_roundtrip() {
        let codec = Codec::new(true, false);
        let msg = sample_message();
        let bytes = codec.encode(&msg, None).unwrap();
        let back = codec.decode(&bytes, None).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn encrypted_roundtrip_with_long_payload() {
        let codec = Codec::new(false, true);
        let keypair = KeyPair::generate(512).unwrap();
        let params = keypair.public_params();

        // event_data long enough to force multi-chunk encryption.
        let msg = Message::Event {
            cuuid: ClientId::new(),
            euuid: crate::ids::EventId::new(),
            event_data: serde_json::json!({"payload": "x".repeat(200)}),
            timestamp: "2026-07-28 00:00:00".to_string(),
            priority: crate::message::Priority::Normal,
            retry: 0,
        };

        let bytes = codec.encode(&msg, Some(&params)).unwrap();
        let back = codec.decode(&bytes, Some(&keypair)).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn decode_failure_is_reported_not_panicked() {
        let codec = Codec::new(false, false);
        assert!(codec.decode(b"not json", None).is_err());
    }
}
