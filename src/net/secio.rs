//! Secio: an encrypted, authenticated channel negotiated from an RSA identity.
//!
//! Two-phase handshake. Propose exchange: both sides send a nonce, their
//! identity key and ordered algorithm offers; a deterministic hash comparison
//! decides whose preferences win. Key exchange: ephemeral ECDH keys are
//! signed by the long-term identities, the shared secret is stretched into
//! two `{iv, cipher key, mac key}` triples, one per direction. A final
//! encrypted echo of each side's nonce proves both directions work.
//!
//! Framing is a 4-byte big-endian length followed by protobuf before the
//! handshake completes, and `ciphertext || mac(ciphertext)` after.

use super::stream::{ChunkRead, ChunkWrite, FrameReader, Stream};
use super::NetError;
use crate::crypto::{self, CryptoError, Identity, PeerId};
use crate::wire::{Exchange, KeyEnvelope, KeyType, Propose, WireError};
use aes::{Aes128, Aes256};
use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use tracing::debug;

/// Algorithms offered in our Propose, most preferred first.
pub const SUPPORTED_EXCHANGES: &str = "P-256,P-384";
pub const SUPPORTED_CIPHERS: &str = "AES-256,AES-128";
pub const SUPPORTED_HASHES: &str = "SHA256,SHA512";

/// Propose nonce length.
const NONCE_LEN: usize = 16;

/// Handshake frames are small: two protobufs around an RSA key.
const MAX_HANDSHAKE_FRAME: usize = 8 * 1024;

/// Ciphertext frames after the handshake.
const MAX_FRAME: usize = 8 * 1024 * 1024;

/// Mac key length produced by the stretch, independent of the chosen hash.
const MAC_KEY_LEN: usize = 20;

/// Cipher IV length (AES block size).
const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum SecioError {
    #[error("net: {0}")]
    Net(#[from] NetError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("self-dial detected")]
    SelfDial,

    #[error("no common {0}")]
    NoCommonAlgorithm(&'static str),

    #[error("remote selected unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("remote identity key is not rsa")]
    UnsupportedKeyType,

    #[error("invalid ephemeral public key")]
    BadEphemeralKey,

    #[error("bad key material")]
    KeyMaterial,

    #[error("frame mac mismatch")]
    MacMismatch,

    #[error("nonce confirmation mismatch")]
    NonceMismatch,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

// =============================================================================
// ALGORITHM SELECTION
// =============================================================================

/// First entry of the chooser's list that the other side also offers.
fn select_best<'a>(chooser: &'a str, other: &str) -> Option<&'a str> {
    chooser
        .split(',')
        .find(|candidate| other.split(',').any(|o| o == *candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    P256,
    P384,
}

impl ExchangeKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "P-256" => Some(ExchangeKind::P256),
            "P-384" => Some(ExchangeKind::P384),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    Aes256,
    Aes128,
}

impl CipherKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES-256" => Some(CipherKind::Aes256),
            "AES-128" => Some(CipherKind::Aes128),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherKind::Aes256 => 32,
            CipherKind::Aes128 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashKind {
    Sha256,
    Sha512,
}

impl HashKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(HashKind::Sha256),
            "SHA512" => Some(HashKind::Sha512),
            _ => None,
        }
    }
}

// =============================================================================
// EPHEMERAL KEYS
// =============================================================================

enum EphemeralKey {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
}

impl EphemeralKey {
    /// Generate a key pair on the agreed curve; returns the key and the
    /// SEC1 uncompressed public point for the wire.
    fn generate(kind: ExchangeKind) -> (Self, Vec<u8>) {
        match kind {
            ExchangeKind::P256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralKey::P256(secret), public)
            }
            ExchangeKind::P384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EphemeralKey::P384(secret), public)
            }
        }
    }

    /// ECDH against the remote's ephemeral public point.
    fn agree(self, remote: &[u8]) -> Result<Vec<u8>, SecioError> {
        match self {
            EphemeralKey::P256(secret) => {
                let public = p256::PublicKey::from_sec1_bytes(remote)
                    .map_err(|_| SecioError::BadEphemeralKey)?;
                Ok(secret.diffie_hellman(&public).raw_secret_bytes().to_vec())
            }
            EphemeralKey::P384(secret) => {
                let public = p384::PublicKey::from_sec1_bytes(remote)
                    .map_err(|_| SecioError::BadEphemeralKey)?;
                Ok(secret.diffie_hellman(&public).raw_secret_bytes().to_vec())
            }
        }
    }
}

// =============================================================================
// KEY STRETCH
// =============================================================================

/// One direction's key material.
struct KeyTriple {
    iv: Vec<u8>,
    cipher_key: Vec<u8>,
    mac_key: Vec<u8>,
}

/// HMAC-based expansion of the ECDH secret into both directions' triples.
fn stretch_keys(
    hash: HashKind,
    secret: &[u8],
    cipher_key_len: usize,
) -> Result<(KeyTriple, KeyTriple), SecioError> {
    let triple_len = IV_LEN + cipher_key_len + MAC_KEY_LEN;
    let material = match hash {
        HashKind::Sha256 => stretch_sha256(secret, 2 * triple_len)?,
        HashKind::Sha512 => stretch_sha512(secret, 2 * triple_len)?,
    };

    let split = |chunk: &[u8]| KeyTriple {
        iv: chunk[..IV_LEN].to_vec(),
        cipher_key: chunk[IV_LEN..IV_LEN + cipher_key_len].to_vec(),
        mac_key: chunk[IV_LEN + cipher_key_len..].to_vec(),
    };
    Ok((split(&material[..triple_len]), split(&material[triple_len..])))
}

const STRETCH_SEED: &[u8] = b"key expansion";

fn stretch_sha256(secret: &[u8], total: usize) -> Result<Vec<u8>, SecioError> {
    let keyed = || Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SecioError::KeyMaterial);
    let mut a = {
        let mut m = keyed()?;
        m.update(STRETCH_SEED);
        m.finalize().into_bytes().to_vec()
    };
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        let mut m = keyed()?;
        m.update(&a);
        m.update(STRETCH_SEED);
        out.extend_from_slice(&m.finalize().into_bytes());

        let mut next = keyed()?;
        next.update(&a);
        a = next.finalize().into_bytes().to_vec();
    }
    out.truncate(total);
    Ok(out)
}

fn stretch_sha512(secret: &[u8], total: usize) -> Result<Vec<u8>, SecioError> {
    let keyed = || Hmac::<Sha512>::new_from_slice(secret).map_err(|_| SecioError::KeyMaterial);
    let mut a = {
        let mut m = keyed()?;
        m.update(STRETCH_SEED);
        m.finalize().into_bytes().to_vec()
    };
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        let mut m = keyed()?;
        m.update(&a);
        m.update(STRETCH_SEED);
        out.extend_from_slice(&m.finalize().into_bytes());

        let mut next = keyed()?;
        next.update(&a);
        a = next.finalize().into_bytes().to_vec();
    }
    out.truncate(total);
    Ok(out)
}

// =============================================================================
// CIPHER + MAC STATE
// =============================================================================

enum FrameCipher {
    Aes256(Ctr128BE<Aes256>),
    Aes128(Ctr128BE<Aes128>),
}

impl FrameCipher {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Result<Self, SecioError> {
        match kind {
            CipherKind::Aes256 => Ctr128BE::<Aes256>::new_from_slices(key, iv)
                .map(FrameCipher::Aes256)
                .map_err(|_| SecioError::KeyMaterial),
            CipherKind::Aes128 => Ctr128BE::<Aes128>::new_from_slices(key, iv)
                .map(FrameCipher::Aes128)
                .map_err(|_| SecioError::KeyMaterial),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            FrameCipher::Aes256(c) => c.apply_keystream(buf),
            FrameCipher::Aes128(c) => c.apply_keystream(buf),
        }
    }
}

enum FrameMac {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

impl FrameMac {
    fn new(kind: HashKind, key: &[u8]) -> Result<Self, SecioError> {
        match kind {
            HashKind::Sha256 => Hmac::<Sha256>::new_from_slice(key)
                .map(FrameMac::Sha256)
                .map_err(|_| SecioError::KeyMaterial),
            HashKind::Sha512 => Hmac::<Sha512>::new_from_slice(key)
                .map(FrameMac::Sha512)
                .map_err(|_| SecioError::KeyMaterial),
        }
    }

    fn len(&self) -> usize {
        match self {
            FrameMac::Sha256(_) => 32,
            FrameMac::Sha512(_) => 64,
        }
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            FrameMac::Sha256(m) => {
                let mut m = m.clone();
                m.update(data);
                m.finalize().into_bytes().to_vec()
            }
            FrameMac::Sha512(m) => {
                let mut m = m.clone();
                m.update(data);
                m.finalize().into_bytes().to_vec()
            }
        }
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> Result<(), SecioError> {
        let result = match self {
            FrameMac::Sha256(m) => {
                let mut m = m.clone();
                m.update(data);
                m.verify_slice(tag).is_ok()
            }
            FrameMac::Sha512(m) => {
                let mut m = m.clone();
                m.update(data);
                m.verify_slice(tag).is_ok()
            }
        };
        if result {
            Ok(())
        } else {
            Err(SecioError::MacMismatch)
        }
    }
}

// =============================================================================
// ENCRYPTED STREAM HALVES
// =============================================================================

/// Decrypting half: strictly framed reads, partial frames buffered below.
pub struct SecioReader {
    inner: FrameReader,
    cipher: FrameCipher,
    mac: FrameMac,
}

#[async_trait]
impl ChunkRead for SecioReader {
    async fn read_chunk(&mut self) -> Result<Vec<u8>, NetError> {
        let header = self.inner.read_exact(4).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mac_len = self.mac.len();
        if len > MAX_FRAME {
            return Err(NetError::TooLarge(len));
        }
        if len <= mac_len {
            return Err(NetError::Protocol("secio frame shorter than its mac".into()));
        }
        let mut payload = self.inner.read_exact(len).await?;
        let tag = payload.split_off(len - mac_len);
        self.mac
            .verify(&payload, &tag)
            .map_err(|_| NetError::Protocol("secio mac mismatch".into()))?;
        self.cipher.apply(&mut payload);
        Ok(payload)
    }
}

/// Encrypting half.
pub struct SecioWriter {
    inner: Box<dyn ChunkWrite>,
    cipher: FrameCipher,
    mac: FrameMac,
}

#[async_trait]
impl ChunkWrite for SecioWriter {
    async fn write_chunk(&mut self, buf: &[u8]) -> Result<(), NetError> {
        let mut ciphertext = buf.to_vec();
        self.cipher.apply(&mut ciphertext);
        let tag = self.mac.sign(&ciphertext);

        let mut frame = Vec::with_capacity(4 + ciphertext.len() + tag.len());
        frame.extend_from_slice(&((ciphertext.len() + tag.len()) as u32).to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&tag);
        self.inner.write_chunk(&frame).await
    }

    async fn close(&mut self) -> Result<(), NetError> {
        self.inner.close().await
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

/// The result of a completed handshake: the encrypted stream plus the
/// authenticated remote identity.
pub struct SecioSession {
    pub stream: Stream,
    pub remote_public_key: Vec<u8>,
    pub remote_peer: PeerId,
}

async fn write_handshake_frame(stream: &mut Stream, payload: &[u8]) -> Result<(), SecioError> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write(&frame).await?;
    Ok(())
}

async fn read_handshake_frame(stream: &mut Stream) -> Result<Vec<u8>, SecioError> {
    let header = stream.read_exact(4).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len == 0 || len > MAX_HANDSHAKE_FRAME {
        return Err(SecioError::FrameTooLarge(len));
    }
    Ok(stream.read_exact(len).await?)
}

/// Run the secio handshake. The protocol is symmetric: both sides call this
/// after the outer multistream selector has agreed on `/secio/1.0.0`.
pub async fn handshake(mut stream: Stream, identity: &Identity) -> Result<SecioSession, SecioError> {
    // ---- Phase 1: propose exchange ----
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let propose_local = Propose {
        rand: nonce.to_vec(),
        public_key: identity.public_envelope().encode(),
        exchanges: SUPPORTED_EXCHANGES.into(),
        ciphers: SUPPORTED_CIPHERS.into(),
        hashes: SUPPORTED_HASHES.into(),
    };
    let propose_local_bytes = propose_local.encode();
    write_handshake_frame(&mut stream, &propose_local_bytes).await?;

    let propose_remote_bytes = read_handshake_frame(&mut stream).await?;
    let propose_remote = Propose::decode(&propose_remote_bytes)?;

    let remote_envelope = KeyEnvelope::decode(&propose_remote.public_key)?;
    if remote_envelope.key_type != KeyType::Rsa {
        return Err(SecioError::UnsupportedKeyType);
    }
    let remote_public_key = remote_envelope.data;
    let remote_peer = PeerId::from_public_key_der(&remote_public_key);

    // Deterministic preference order: the side whose hash compares greater
    // dictates the algorithm choice. Equal hashes mean we are talking to
    // ourselves.
    let h1: [u8; 32] = Sha256::digest(
        [propose_remote.public_key.as_slice(), propose_local.rand.as_slice()].concat(),
    )
    .into();
    let h2: [u8; 32] = Sha256::digest(
        [propose_local.public_key.as_slice(), propose_remote.rand.as_slice()].concat(),
    )
    .into();
    if h1 == h2 {
        return Err(SecioError::SelfDial);
    }
    let local_is_chooser = h1 > h2;

    let pick = |ours: &str, theirs: &str, what: &'static str| -> Result<String, SecioError> {
        let chosen = if local_is_chooser {
            select_best(ours, theirs)
        } else {
            select_best(theirs, ours)
        };
        chosen
            .map(str::to_string)
            .ok_or(SecioError::NoCommonAlgorithm(what))
    };

    let curve_name = pick(SUPPORTED_EXCHANGES, &propose_remote.exchanges, "exchange")?;
    let cipher_name = pick(SUPPORTED_CIPHERS, &propose_remote.ciphers, "cipher")?;
    let hash_name = pick(SUPPORTED_HASHES, &propose_remote.hashes, "hash")?;

    let curve = ExchangeKind::from_name(&curve_name)
        .ok_or_else(|| SecioError::UnsupportedAlgorithm(curve_name.clone()))?;
    let cipher = CipherKind::from_name(&cipher_name)
        .ok_or_else(|| SecioError::UnsupportedAlgorithm(cipher_name.clone()))?;
    let hash = HashKind::from_name(&hash_name)
        .ok_or_else(|| SecioError::UnsupportedAlgorithm(hash_name.clone()))?;

    debug!(
        "secio negotiated curve={} cipher={} hash={} with {}",
        curve_name, cipher_name, hash_name, remote_peer
    );

    // ---- Phase 2: key exchange ----
    let (ephemeral, ephemeral_public) = EphemeralKey::generate(curve);

    let mut signed = Vec::with_capacity(
        propose_local_bytes.len() + propose_remote_bytes.len() + ephemeral_public.len(),
    );
    signed.extend_from_slice(&propose_local_bytes);
    signed.extend_from_slice(&propose_remote_bytes);
    signed.extend_from_slice(&ephemeral_public);

    let exchange_local = Exchange {
        epubkey: ephemeral_public,
        signature: identity.sign(&signed),
    };
    write_handshake_frame(&mut stream, &exchange_local.encode()).await?;

    let exchange_remote = Exchange::decode(&read_handshake_frame(&mut stream).await?)?;

    let mut remote_signed = Vec::with_capacity(
        propose_remote_bytes.len() + propose_local_bytes.len() + exchange_remote.epubkey.len(),
    );
    remote_signed.extend_from_slice(&propose_remote_bytes);
    remote_signed.extend_from_slice(&propose_local_bytes);
    remote_signed.extend_from_slice(&exchange_remote.epubkey);
    crypto::verify_signature(&remote_public_key, &remote_signed, &exchange_remote.signature)?;

    let shared_secret = ephemeral.agree(&exchange_remote.epubkey)?;
    let (first, second) = stretch_keys(hash, &shared_secret, cipher.key_len())?;
    let (local_keys, remote_keys) = if local_is_chooser {
        (first, second)
    } else {
        (second, first)
    };

    // ---- Re-frame the stream under the new cipher ----
    let (raw_reader, raw_writer) = stream.into_parts();
    let reader = SecioReader {
        inner: raw_reader,
        cipher: FrameCipher::new(cipher, &remote_keys.cipher_key, &remote_keys.iv)?,
        mac: FrameMac::new(hash, &remote_keys.mac_key)?,
    };
    let writer = SecioWriter {
        inner: raw_writer,
        cipher: FrameCipher::new(cipher, &local_keys.cipher_key, &local_keys.iv)?,
        mac: FrameMac::new(hash, &local_keys.mac_key)?,
    };
    let mut secured = Stream::new(Box::new(reader), Box::new(writer));

    // ---- Phase 3: nonce confirmation ----
    secured.write(&propose_remote.rand).await?;
    let echoed = secured.read_exact(NONCE_LEN).await?;
    if echoed != nonce {
        return Err(SecioError::NonceMismatch);
    }

    Ok(SecioSession {
        stream: secured,
        remote_public_key,
        remote_peer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::stream::testing::pair;
    use std::sync::OnceLock;

    fn identity_a() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(|| Identity::generate().unwrap())
    }

    fn identity_b() -> &'static Identity {
        static ID: OnceLock<Identity> = OnceLock::new();
        ID.get_or_init(|| Identity::generate().unwrap())
    }

    #[test]
    fn select_best_prefers_chooser_order() {
        assert_eq!(select_best("AES-256,AES-128", "AES-128,AES-256"), Some("AES-256"));
        assert_eq!(select_best("AES-128,AES-256", "AES-256"), Some("AES-256"));
        assert_eq!(select_best("AES-256", "Blowfish"), None);
    }

    #[test]
    fn stretch_is_deterministic_and_sized() {
        let (a1, a2) = stretch_keys(HashKind::Sha256, b"secret", 32).unwrap();
        let (b1, b2) = stretch_keys(HashKind::Sha256, b"secret", 32).unwrap();
        assert_eq!(a1.iv, b1.iv);
        assert_eq!(a2.mac_key, b2.mac_key);
        assert_eq!(a1.iv.len(), IV_LEN);
        assert_eq!(a1.cipher_key.len(), 32);
        assert_eq!(a1.mac_key.len(), MAC_KEY_LEN);
        // the two directions must not share keys
        assert_ne!(a1.cipher_key, a2.cipher_key);
    }

    #[tokio::test]
    async fn handshake_and_transfer() {
        let (stream_a, stream_b) = pair();

        let side_b = tokio::spawn(async move {
            let mut session = handshake(stream_b, identity_b()).await.unwrap();
            let msg = session.stream.read_any().await.unwrap();
            assert_eq!(msg, b"ping over secio");
            session.stream.write(b"pong over secio").await.unwrap();
            session.remote_peer
        });

        let mut session = handshake(stream_a, identity_a()).await.unwrap();
        assert_eq!(&session.remote_peer, identity_b().peer_id());

        session.stream.write(b"ping over secio").await.unwrap();
        let reply = session.stream.read_any().await.unwrap();
        assert_eq!(reply, b"pong over secio");

        let seen_by_b = side_b.await.unwrap();
        assert_eq!(&seen_by_b, identity_a().peer_id());
    }

    #[test]
    fn mac_rejects_tampering() {
        let mac = FrameMac::new(HashKind::Sha256, b"mac-key").unwrap();
        let tag = mac.sign(b"ciphertext");
        assert!(mac.verify(b"ciphertext", &tag).is_ok());
        assert!(mac.verify(b"Ciphertext", &tag).is_err());

        let mut bad_tag = tag.clone();
        bad_tag[0] ^= 1;
        assert!(mac.verify(b"ciphertext", &bad_tag).is_err());
    }

    #[tokio::test]
    async fn large_payload_survives_framing() {
        let (stream_a, stream_b) = pair();

        let side_b = tokio::spawn(async move {
            let mut session = handshake(stream_b, identity_b()).await.unwrap();
            let mut got = Vec::new();
            while got.len() < 100_000 {
                got.extend(session.stream.read_any().await.unwrap());
            }
            got
        });

        let mut session = handshake(stream_a, identity_a()).await.unwrap();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        session.stream.write(&payload).await.unwrap();

        assert_eq!(side_b.await.unwrap(), payload);
    }
}
