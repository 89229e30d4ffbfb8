//! Wire message codecs.
//!
//! Every protocol message the node sends is protobuf on the wire; this module
//! holds the hand-framed codec (`pb`) and the message types built on it.

pub mod journal;
pub mod kad;
pub mod pb;
pub mod secio;

pub use journal::{JournalEntry, JournalMessage};
pub use kad::{KadMessage, MessageType, Record, WireConnection, WirePeer};
pub use pb::{get_uvarint, put_uvarint, WireError};
pub use secio::{Exchange, KeyEnvelope, KeyType, Propose};
