//! Kademlia wire messages.
//!
//! Field tags follow the dht wire layout: 1=type, 2=key, 3=record,
//! 4=closer-peers (repeated), 5=provider-peers (repeated), 10=cluster-level.

use super::pb::{Reader, WireError, WireType, Writer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

impl MessageType {
    fn from_u64(v: u64) -> Result<Self, WireError> {
        match v {
            0 => Ok(MessageType::PutValue),
            1 => Ok(MessageType::GetValue),
            2 => Ok(MessageType::AddProvider),
            3 => Ok(MessageType::GetProviders),
            4 => Ok(MessageType::FindNode),
            5 => Ok(MessageType::Ping),
            other => Err(WireError::InvalidEnum(other)),
        }
    }
}

/// Peer connection state as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum WireConnection {
    #[default]
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

impl WireConnection {
    fn from_u64(v: u64) -> Self {
        match v {
            1 => WireConnection::Connected,
            2 => WireConnection::CanConnect,
            3 => WireConnection::CannotConnect,
            _ => WireConnection::NotConnected,
        }
    }
}

/// A peer reference inside a Kademlia message: id bytes plus the binary-free
/// textual multiaddresses we know for it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WirePeer {
    pub id: Vec<u8>,
    pub addrs: Vec<String>,
    pub connection: WireConnection,
}

impl WirePeer {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.id);
        for addr in &self.addrs {
            w.string(2, addr);
        }
        w.uint(3, self.connection as u64);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut peer = WirePeer::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::LengthDelimited) => peer.id = r.bytes()?.to_vec(),
                (2, WireType::LengthDelimited) => {
                    peer.addrs.push(String::from_utf8_lossy(r.bytes()?).into_owned());
                }
                (3, WireType::Varint) => peer.connection = WireConnection::from_u64(r.uint()?),
                _ => r.skip(wire)?,
            }
        }
        Ok(peer)
    }
}

/// A signed (key, value, author) tuple stored in the DHT datastore.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub author: Vec<u8>,
    pub signature: Vec<u8>,
    pub time: u64,
}

impl Record {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(1, &self.key);
        w.bytes(2, &self.value);
        w.bytes(3, &self.author);
        w.bytes(4, &self.signature);
        w.uint(5, self.time);
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut rec = Record::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::LengthDelimited) => rec.key = r.bytes()?.to_vec(),
                (2, WireType::LengthDelimited) => rec.value = r.bytes()?.to_vec(),
                (3, WireType::LengthDelimited) => rec.author = r.bytes()?.to_vec(),
                (4, WireType::LengthDelimited) => rec.signature = r.bytes()?.to_vec(),
                (5, WireType::Varint) => rec.time = r.uint()?,
                _ => r.skip(wire)?,
            }
        }
        Ok(rec)
    }

    /// The bytes the author signs.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.key.len() + self.value.len());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }
}

/// Tagged Kademlia message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KadMessage {
    pub message_type: MessageType,
    pub key: Vec<u8>,
    pub record: Option<Record>,
    pub closer_peers: Vec<WirePeer>,
    pub provider_peers: Vec<WirePeer>,
    pub cluster_level: u32,
}

impl KadMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            key: Vec::new(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
            cluster_level: 0,
        }
    }

    pub fn with_key(message_type: MessageType, key: Vec<u8>) -> Self {
        let mut msg = Self::new(message_type);
        msg.key = key;
        msg
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.uint(1, self.message_type as u64);
        if !self.key.is_empty() {
            w.bytes(2, &self.key);
        }
        if let Some(record) = &self.record {
            w.message(3, &record.encode());
        }
        for peer in &self.closer_peers {
            w.message(4, &peer.encode());
        }
        for peer in &self.provider_peers {
            w.message(5, &peer.encode());
        }
        if self.cluster_level != 0 {
            w.uint(10, u64::from(self.cluster_level));
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut msg = KadMessage::new(MessageType::Ping);
        let mut saw_type = false;
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::Varint) => {
                    msg.message_type = MessageType::from_u64(r.uint()?)?;
                    saw_type = true;
                }
                (2, WireType::LengthDelimited) => msg.key = r.bytes()?.to_vec(),
                (3, WireType::LengthDelimited) => msg.record = Some(Record::decode(r.bytes()?)?),
                (4, WireType::LengthDelimited) => msg.closer_peers.push(WirePeer::decode(r.bytes()?)?),
                (5, WireType::LengthDelimited) => msg.provider_peers.push(WirePeer::decode(r.bytes()?)?),
                (10, WireType::Varint) => msg.cluster_level = r.uint()? as u32,
                _ => r.skip(wire)?,
            }
        }
        if !saw_type {
            return Err(WireError::MissingField("message_type"));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer(id: &[u8]) -> WirePeer {
        WirePeer {
            id: id.to_vec(),
            addrs: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
            connection: WireConnection::Connected,
        }
    }

    #[test]
    fn kad_message_round_trip() {
        let mut msg = KadMessage::with_key(MessageType::GetProviders, b"somekey".to_vec());
        msg.provider_peers.push(sample_peer(b"peer-a"));
        msg.closer_peers.push(sample_peer(b"peer-b"));
        msg.closer_peers.push(sample_peer(b"peer-c"));
        msg.cluster_level = 3;

        let decoded = KadMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn record_round_trip() {
        let mut msg = KadMessage::with_key(MessageType::PutValue, b"k".to_vec());
        msg.record = Some(Record {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            author: b"QmAuthor".to_vec(),
            signature: vec![1, 2, 3],
            time: 1_700_000_000,
        });
        let decoded = KadMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn missing_type_is_rejected() {
        let mut w = Writer::new();
        w.bytes(2, b"key-only");
        assert!(matches!(
            KadMessage::decode(&w.finish()),
            Err(WireError::MissingField(_))
        ));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let mut msg = KadMessage::with_key(MessageType::Ping, b"abc".to_vec());
        let mut encoded = msg.encode();
        // append an unknown length-delimited field 15
        let mut w = Writer::new();
        w.bytes(15, b"future extension");
        encoded.extend_from_slice(&w.finish());

        let decoded = KadMessage::decode(&encoded).unwrap();
        msg.cluster_level = 0;
        assert_eq!(decoded, msg);
    }
}
