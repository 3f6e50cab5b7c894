//! Request authentication for client writes
//!
//! Devices sign the compressed body of every write with their P-384 key
//! (ECDSA over SHA-256) and prefix the signature with its length:
//!
//! ```text
//! [u16 BE signature length][signature (DER or raw r||s)][compressed body]
//! ```
//!
//! The broker only needs `ClientKey` to verify. `DeviceKey` is the signing
//! half, for device simulators and tests.

use crate::error::{BrokerError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use p384::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use sha2::{Digest, Sha256};

/// Length of the signature length prefix
const LENGTH_PREFIX: usize = 2;

/// A client's registered verification key
#[derive(Debug, Clone)]
pub struct ClientKey {
    key: VerifyingKey,
}

impl ClientKey {
    /// Parse a PEM-encoded SubjectPublicKeyInfo
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = VerifyingKey::from_public_key_pem(pem.trim())
            .map_err(|e| BrokerError::InvalidData(format!("Invalid P-384 public key: {}", e)))?;
        Ok(Self { key })
    }

    /// Verify `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_der(signature)
            .or_else(|_| Signature::from_slice(signature))
            .map_err(|_| BrokerError::InvalidSignature)?;

        self.key
            .verify_prehash(&Sha256::digest(message), &signature)
            .map_err(|_| BrokerError::InvalidSignature)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| BrokerError::InvalidData(format!("Cannot encode public key: {}", e)))
    }
}

/// Signature and message split out of a signed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub signature: Bytes,
    pub message: Bytes,
}

impl SignedEnvelope {
    /// Split a raw envelope without copying
    pub fn decode(raw: &Bytes) -> Result<Self> {
        if raw.len() < LENGTH_PREFIX {
            return Err(BrokerError::MalformedEnvelope(format!(
                "envelope of {} bytes has no signature length",
                raw.len()
            )));
        }

        let declared = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        let remaining = raw.len() - LENGTH_PREFIX;
        if declared > remaining {
            return Err(BrokerError::MalformedEnvelope(format!(
                "declared signature length {} exceeds {} remaining bytes",
                declared, remaining
            )));
        }

        let split = LENGTH_PREFIX + declared;
        Ok(Self {
            signature: raw.slice(LENGTH_PREFIX..split),
            message: raw.slice(split..),
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let length = u16::try_from(self.signature.len()).map_err(|_| {
            BrokerError::MalformedEnvelope(format!(
                "signature of {} bytes does not fit the length prefix",
                self.signature.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + self.signature.len() + self.message.len());
        buf.put_u16(length);
        buf.put_slice(&self.signature);
        buf.put_slice(&self.message);
        Ok(buf.freeze())
    }
}

/// Check a signed envelope against `key`, returning the still-compressed body
pub fn authenticate(key: &ClientKey, raw: &Bytes) -> Result<Bytes> {
    let envelope = SignedEnvelope::decode(raw)?;
    key.verify(&envelope.message, &envelope.signature)?;
    Ok(envelope.message)
}

/// A device's signing key
pub struct DeviceKey {
    key: SigningKey,
}

impl DeviceKey {
    /// Build from a big-endian secret scalar
    pub fn from_scalar(bytes: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|_| BrokerError::InvalidData("Invalid P-384 secret scalar".into()))?;
        Ok(Self { key })
    }

    /// Parse a PEM-encoded PKCS#8 private key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = SigningKey::from_pkcs8_pem(pem.trim())
            .map_err(|e| BrokerError::InvalidData(format!("Invalid P-384 private key: {}", e)))?;
        Ok(Self { key })
    }

    pub fn client_key(&self) -> ClientKey {
        ClientKey {
            key: self.key.verifying_key().clone(),
        }
    }

    /// PEM SubjectPublicKeyInfo to register with the broker
    pub fn public_pem(&self) -> Result<String> {
        self.client_key().to_pem()
    }

    /// DER signature over `message`
    pub fn sign(&self, message: &[u8]) -> Result<Bytes> {
        let signature: Signature = self
            .key
            .sign_prehash(&Sha256::digest(message))
            .map_err(|_| BrokerError::InvalidSignature)?;
        Ok(Bytes::copy_from_slice(signature.to_der().as_bytes()))
    }

    /// Sign `message` and wrap both into an envelope
    pub fn seal(&self, message: Bytes) -> Result<Bytes> {
        SignedEnvelope {
            signature: self.sign(&message)?,
            message,
        }
        .encode()
    }
}
