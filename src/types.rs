//! Shared content-addressing types.
//!
//! A multihash is the self-describing digest `<algo><length><digest>`, a CID
//! wraps a multihash with a codec and version, and a Block is a CID plus the
//! bytes that hash to it. Everything here is immutable after construction.

use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Multihash algorithm code for SHA2-256.
pub const MH_SHA2_256: u8 = 0x12;

/// Digest length for SHA2-256.
pub const MH_SHA2_256_LEN: u8 = 32;

#[derive(Error, Debug)]
pub enum CidError {
    #[error("multihash too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported multihash algorithm: 0x{0:02x}")]
    UnsupportedAlgorithm(u8),

    #[error("multihash digest length mismatch: header says {0}, have {1}")]
    LengthMismatch(usize, usize),

    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("digest does not match data")]
    DigestMismatch,
}

/// Hash `data` into a SHA2-256 multihash (`0x12 0x20 <digest>`).
pub fn multihash(data: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(data);
    let mut out = Vec::with_capacity(2 + digest.len());
    out.push(MH_SHA2_256);
    out.push(MH_SHA2_256_LEN);
    out.extend_from_slice(&digest);
    out
}

/// Validate the two-byte multihash header and digest length.
pub fn validate_multihash(bytes: &[u8]) -> Result<(), CidError> {
    if bytes.len() < 2 {
        return Err(CidError::TooShort(bytes.len()));
    }
    if bytes[0] != MH_SHA2_256 {
        return Err(CidError::UnsupportedAlgorithm(bytes[0]));
    }
    let claimed = bytes[1] as usize;
    if bytes.len() - 2 != claimed {
        return Err(CidError::LengthMismatch(claimed, bytes.len() - 2));
    }
    Ok(())
}

/// Content codecs carried in a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Codec {
    Raw = 0x55,
    DagProtobuf = 0x70,
}

/// Content identifier: version + codec + multihash.
///
/// Version 0 is a bare base58 SHA2-256 multihash with an implied dag-pb codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    pub version: u8,
    pub codec: Codec,
    pub hash: Vec<u8>,
}

impl Cid {
    pub fn new(codec: Codec, hash: Vec<u8>) -> Result<Self, CidError> {
        validate_multihash(&hash)?;
        Ok(Self { version: 0, codec, hash })
    }

    /// CID for a payload: hash the bytes, wrap in a multihash.
    pub fn for_data(codec: Codec, data: &[u8]) -> Self {
        Self { version: 0, codec, hash: multihash(data) }
    }

    /// Parse the version-0 text form (base58 multihash).
    pub fn from_str_v0(s: &str) -> Result<Self, CidError> {
        let hash = bs58::decode(s).into_vec()?;
        Self::new(Codec::DagProtobuf, hash)
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.hash).into_string()
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Content-addressed payload.
///
/// Invariant: `cid.hash == multihash(data)`. Construct through `new` so the
/// invariant cannot be violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Vec<u8>,
}

impl Block {
    /// Build a block from raw bytes, deriving the CID.
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        let cid = Cid::for_data(codec, &data);
        Self { cid, data }
    }

    /// Rebuild a block from a claimed CID, rejecting mismatched data.
    pub fn with_cid(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        if cid.hash != multihash(&data) {
            return Err(CidError::DigestMismatch);
        }
        Ok(Self { cid, data })
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multihash_header() {
        let mh = multihash(b"hello");
        assert_eq!(mh[0], MH_SHA2_256);
        assert_eq!(mh[1], MH_SHA2_256_LEN);
        assert_eq!(mh.len(), 34);
        assert!(validate_multihash(&mh).is_ok());
    }

    #[test]
    fn multihash_rejects_truncation() {
        let mut mh = multihash(b"hello");
        mh.pop();
        assert!(validate_multihash(&mh).is_err());
    }

    #[test]
    fn cid_base58_round_trip() {
        let cid = Cid::for_data(Codec::DagProtobuf, b"some data");
        let text = cid.to_base58();
        let parsed = Cid::from_str_v0(&text).unwrap();
        assert_eq!(parsed.hash, cid.hash);
    }

    #[test]
    fn block_verifies_digest() {
        let block = Block::new(Codec::Raw, b"payload".to_vec());
        let cid = block.cid().clone();
        assert!(Block::with_cid(cid.clone(), b"payload".to_vec()).is_ok());
        assert!(matches!(
            Block::with_cid(cid, b"tampered".to_vec()),
            Err(CidError::DigestMismatch)
        ));
    }
}
