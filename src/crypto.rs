//! Node identity: RSA long-term keys and peer-id derivation.
//!
//! A peer-id is the base58 text of the SHA2-256 multihash of the DER-encoded
//! (SubjectPublicKeyInfo) public key. The textual form is what travels in
//! multiaddresses and Kademlia messages, so `PeerId` stores it directly.

use crate::types::multihash;
use crate::wire::KeyEnvelope;
use rand::rngs::OsRng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;

/// RSA modulus size for generated identities.
pub const IDENTITY_KEY_BITS: usize = 2048;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("key encoding: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("public key encoding: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unsupported key type")]
    UnsupportedKeyType,

    #[error("peer id is not valid utf-8")]
    InvalidPeerId,
}

/// Base58 peer identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Derive from a DER-encoded public key.
    pub fn from_public_key_der(der: &[u8]) -> Self {
        Self(bs58::encode(multihash(der)).into_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Rebuild from the raw bytes carried in a wire message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        String::from_utf8(bytes.to_vec())
            .map(Self)
            .map_err(|_| CryptoError::InvalidPeerId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// True if this id was derived from the given public key.
    pub fn matches_public_key(&self, der: &[u8]) -> bool {
        *self == Self::from_public_key_der(der)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local RSA identity: signs secio exchanges and DHT records.
pub struct Identity {
    private: RsaPrivateKey,
    signing: SigningKey<Sha256>,
    public_der: Vec<u8>,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a fresh identity. Key generation is slow; done once at init.
    pub fn generate() -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, IDENTITY_KEY_BITS)?;
        Self::from_private(private)
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from(&private);
        let public_der = public.to_public_key_der()?.as_bytes().to_vec();
        let peer_id = PeerId::from_public_key_der(&public_der);
        let signing = SigningKey::<Sha256>::new(private.clone());
        Ok(Self { private, signing, public_der, peer_id })
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.private.to_pkcs8_der()?.as_bytes().to_vec())
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// The protobuf key envelope sent in the secio Propose.
    pub fn public_envelope(&self) -> KeyEnvelope {
        KeyEnvelope::rsa(self.public_der.clone())
    }

    /// PKCS#1 v1.5 signature over SHA-256 of `msg`.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing.sign(msg).to_vec()
    }
}

/// Verify a PKCS#1 v1.5 / SHA-256 signature against a DER public key.
pub fn verify_signature(public_der: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let key = RsaPublicKey::from_public_key_der(public_der)?;
    let verifying = VerifyingKey::<Sha256>::new(key);
    let sig = Signature::try_from(sig).map_err(|_| CryptoError::InvalidSignature)?;
    verifying
        .verify(msg, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_identity() -> &'static Identity {
        // key generation is slow; one shared key serves every test here
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(|| Identity::generate().unwrap())
    }

    #[test]
    fn sign_and_verify() {
        let id = test_identity();
        let sig = id.sign(b"message");
        assert!(verify_signature(id.public_key_der(), b"message", &sig).is_ok());
        assert!(verify_signature(id.public_key_der(), b"other", &sig).is_err());
    }

    #[test]
    fn peer_id_matches_key() {
        let id = test_identity();
        assert!(id.peer_id().matches_public_key(id.public_key_der()));
        assert!(id.peer_id().as_str().starts_with("Qm"));
    }

    #[test]
    fn pkcs8_round_trip() {
        let id = test_identity();
        let der = id.to_pkcs8_der().unwrap();
        let restored = Identity::from_pkcs8_der(&der).unwrap();
        assert_eq!(restored.peer_id(), id.peer_id());
        assert_eq!(restored.public_key_der(), id.public_key_der());
    }
}
