//! Kademlia DHT: message handlers, XOR metric, routing facade.

pub mod distance;
pub mod handler;
pub mod routing;

pub use distance::{closest_peers, distance, key_digest, CLOSER_PEER_COUNT};
pub use handler::DhtHandler;
pub use routing::{OfflineRouting, OnlineRouting, Routing, RoutingError};
