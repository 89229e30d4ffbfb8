//! Journal replication messages.
//!
//! Field tags: 1=start-epoch, 2=end-epoch, 3=current-epoch, 4=entry (repeated
//! of {1=timestamp, 2=hash, 3=pin}).

use super::pb::{Reader, WireError, WireType, Writer};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JournalEntry {
    pub timestamp: u64,
    pub hash: Vec<u8>,
    pub pin: bool,
}

impl JournalEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.uint(1, self.timestamp);
        w.bytes(2, &self.hash);
        w.uint(3, u64::from(self.pin));
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut e = JournalEntry::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::Varint) => e.timestamp = r.uint()?,
                (2, WireType::LengthDelimited) => e.hash = r.bytes()?.to_vec(),
                (3, WireType::Varint) => e.pin = r.uint()? != 0,
                _ => r.skip(wire)?,
            }
        }
        Ok(e)
    }
}

/// A digest of recent journal state, exchanged between replication peers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JournalMessage {
    pub start_epoch: u64,
    pub end_epoch: u64,
    pub current_epoch: u64,
    pub entries: Vec<JournalEntry>,
}

impl JournalMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.uint(1, self.start_epoch);
        w.uint(2, self.end_epoch);
        w.uint(3, self.current_epoch);
        for entry in &self.entries {
            w.message(4, &entry.encode());
        }
        w.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut m = JournalMessage::default();
        let mut r = Reader::new(buf);
        while !r.done() {
            let (field, wire) = r.next_field()?;
            match (field, wire) {
                (1, WireType::Varint) => m.start_epoch = r.uint()?,
                (2, WireType::Varint) => m.end_epoch = r.uint()?,
                (3, WireType::Varint) => m.current_epoch = r.uint()?,
                (4, WireType::LengthDelimited) => m.entries.push(JournalEntry::decode(r.bytes()?)?),
                _ => r.skip(wire)?,
            }
        }
        Ok(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_round_trip() {
        let m = JournalMessage {
            start_epoch: 1000,
            end_epoch: 2000,
            current_epoch: 2100,
            entries: vec![
                JournalEntry { timestamp: 1000, hash: vec![0x12, 0x20, 1, 2], pin: true },
                JournalEntry { timestamp: 2000, hash: vec![0x12, 0x20, 3, 4], pin: false },
            ],
        };
        assert_eq!(JournalMessage::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn empty_digest_round_trip() {
        let m = JournalMessage { current_epoch: 5, ..Default::default() };
        assert_eq!(JournalMessage::decode(&m.encode()).unwrap(), m);
    }
}
