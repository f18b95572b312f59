//! RSA envelope encryption facade.
//!
//! A keypair is minted once, its public parameters handed out to peers,
//! and messages are encrypted in fixed-size chunks bounded by the
//! modulus' byte size.

use rand::rngs::OsRng;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::str::FromStr;

use crate::error::{NeteriaError, Result};
use crate::message::EncryptionParams;

/// A generated RSA keypair. Only `public_params()` ever leaves this type;
/// the private key never crosses the engine/codec boundary.
pub struct KeyPair {
    private_key: RsaPrivateKey,
}

impl KeyPair {
    /// Generates a new keypair. The caller's configuration defaults
    /// `key_bits` to 512.
    pub fn generate(key_bits: usize) -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, key_bits)
            .map_err(|e| NeteriaError::Crypto(format!("key generation failed: {e}")))?;
        Ok(Self { private_key })
    }

    pub fn public_params(&self) -> PublicKeyParams {
        let public_key = RsaPublicKey::from(&self.private_key);
        PublicKeyParams {
            n: public_key.n().clone(),
            e: public_key.e().clone(),
        }
    }

    /// Decrypts a single ciphertext chunk with the private key.
    pub fn decrypt(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, chunk)
            .map_err(|e| NeteriaError::Crypto(format!("decrypt failed: {e}")))
    }
}

/// The `(n, e)` pair a peer needs to encrypt messages to us, reconstructed
/// from the wire's `EncryptionParams`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKeyParams {
    pub n: BigUint,
    pub e: BigUint,
}

impl PublicKeyParams {
    /// Maximum plaintext chunk size this key can encrypt in one PKCS#1 v1.5
    /// operation: `byte_size(n) - 11`.
    pub fn max_chunk_len(&self) -> usize {
        self.n.to_bytes_be().len().saturating_sub(11)
    }

    pub fn encrypt(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let public_key = RsaPublicKey::new(self.n.clone(), self.e.clone())
            .map_err(|e| NeteriaError::Crypto(format!("invalid public key: {e}")))?;
        public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| NeteriaError::Crypto(format!("encrypt failed: {e}")))
    }

    pub fn to_wire(&self) -> EncryptionParams {
        EncryptionParams(self.n.to_string(), self.e.to_string())
    }

    pub fn from_wire(params: &EncryptionParams) -> Result<Self> {
        let n = BigUint::from_str(params.n())
            .map_err(|e| NeteriaError::Crypto(format!("bad modulus: {e}")))?;
        let e = BigUint::from_str(params.e())
            .map_err(|e| NeteriaError::Crypto(format!("bad exponent: {e}")))?;
        Ok(Self { n, e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keypair = KeyPair::generate(512).unwrap();
        let params = keypair.public_params();
        let plaintext = b"hello neteria";
        let ciphertext = params.encrypt(plaintext).unwrap();
        let decrypted = keypair.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wire_roundtrip_preserves_params() {
        let keypair = KeyPair::generate(512).unwrap();
        let params = keypair.public_params();
        let wire = params.to_wire();
        let back = PublicKeyParams::from_wire(&wire).unwrap();
        assert_eq!(params, back);
    }

    #[test]
    fn max_chunk_len_accounts_for_pkcs1_padding() {
        let keypair = KeyPair::generate(512).unwrap();
        let params = keypair.public_params();
        // 512-bit key -> 64-byte modulus -> 53-byte max chunk.
        assert_eq!(params.max_chunk_len(), 53);
    }
}
