//! Secio handshake messages and the protobuf key envelopes.

use super::pb::{Reader, WireError, WireType, Writer};

/// Key algorithm carried in a key envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

impl KeyType {
    fn from_u64(v: u64) -> Result<Self, WireError> {
        match v {
            0 => Ok(KeyType::Rsa),
            1 => Ok(KeyType::Ed25519),
            2 => Ok(KeyType::Secp256k1),
            3 => Ok(KeyType::Ecdsa),
            other => Err(WireError::InvalidEnum(other)),
        }
    }
}

/// Public (or private) key envelope: type tag plus encoded key bytes.
/// For RSA public keys the bytes are SubjectPublicKeyInfo DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEnvelope {
    pub key_type: KeyType,
    pub data: Vec<u8>,
}

impl KeyEnvelope {
    pub fn rsa(data: Vec<u8>) -> Self {
        Self { key_type: KeyType::Rsa, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.uint(1, self.key_type as u64);
        w.bytes(2, &self.data);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut key_type = None;
        let mut data = Vec::new();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::Varint) => key_type = Some(KeyType::from_u64(r.uint()?)?),
                (2, WireType::LengthDelimited) => data = r.bytes()?.to_vec(),
                _ => r.skip(wire)?,
            }
        }
        Ok(Self {
            key_type: key_type.ok_or(WireError::MissingField("key_type"))?,
            data,
        })
    }
}

/// First secio handshake message: nonce, identity key, algorithm offers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Propose {
    pub rand: Vec<u8>,
    pub public_key: Vec<u8>,
    pub exchanges: String,
    pub ciphers: String,
    pub hashes: String,
}

impl Propose {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.rand);
        w.bytes(2, &self.public_key);
        w.string(3, &self.exchanges);
        w.string(4, &self.ciphers);
        w.string(5, &self.hashes);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut p = Propose::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::LengthDelimited) => p.rand = r.bytes()?.to_vec(),
                (2, WireType::LengthDelimited) => p.public_key = r.bytes()?.to_vec(),
                (3, WireType::LengthDelimited) => {
                    p.exchanges = String::from_utf8_lossy(r.bytes()?).into_owned()
                }
                (4, WireType::LengthDelimited) => {
                    p.ciphers = String::from_utf8_lossy(r.bytes()?).into_owned()
                }
                (5, WireType::LengthDelimited) => {
                    p.hashes = String::from_utf8_lossy(r.bytes()?).into_owned()
                }
                _ => r.skip(wire)?,
            }
        }
        Ok(p)
    }
}

/// Second secio handshake message: ephemeral key plus identity signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Exchange {
    pub epubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Exchange {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.epubkey);
        w.bytes(2, &self.signature);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut e = Exchange::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::LengthDelimited) => e.epubkey = r.bytes()?.to_vec(),
                (2, WireType::LengthDelimited) => e.signature = r.bytes()?.to_vec(),
                _ => r.skip(wire)?,
            }
        }
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_round_trip() {
        let p = Propose {
            rand: vec![7; 16],
            public_key: vec![1, 2, 3, 4],
            exchanges: "P-256,P-384".into(),
            ciphers: "AES-256,AES-128".into(),
            hashes: "SHA256,SHA512".into(),
        };
        assert_eq!(Propose::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn exchange_round_trip() {
        let e = Exchange {
            epubkey: vec![4; 65],
            signature: vec![9; 256],
        };
        assert_eq!(Exchange::decode(&e.encode()).unwrap(), e);
    }

    #[test]
    fn key_envelope_round_trip() {
        let k = KeyEnvelope::rsa(vec![0x30, 0x82, 0x01, 0x22]);
        assert_eq!(KeyEnvelope::decode(&k.encode()).unwrap(), k);
    }
}
