//! XOR distance over SHA-256 digests.
//!
//! Both sides of the comparison are hashed: a peer ranks by
//! `sha256(peer_id) ^ sha256(target)`. Ties break lexicographically on the
//! peer id so orderings are total and stable across nodes.

use crate::crypto::PeerId;
use crate::store::peerstore::Peer;
use sha2::{Digest, Sha256};

/// How many closer peers a reply carries.
pub const CLOSER_PEER_COUNT: usize = 20;

pub fn key_digest(key: &[u8]) -> [u8; 32] {
    Sha256::digest(key).into()
}

pub fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

fn peer_distance(id: &PeerId, target: &[u8; 32]) -> [u8; 32] {
    distance(&key_digest(id.as_bytes()), target)
}

/// Up to `n` peers nearest to `target`, nearest first.
pub fn closest_peers(peers: Vec<Peer>, target: &[u8], n: usize) -> Vec<Peer> {
    let target = key_digest(target);
    let mut ranked: Vec<(([u8; 32], PeerId), Peer)> = peers
        .into_iter()
        .map(|p| ((peer_distance(&p.id, &target), p.id.clone()), p))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked.into_iter().take(n).map(|(_, p)| p).collect()
}

/// Rank a peer list by distance to `target` without truncating.
pub fn rank_by_distance(peers: Vec<Peer>, target: &[u8]) -> Vec<Peer> {
    let len = peers.len();
    closest_peers(peers, target, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> Peer {
        Peer::new(PeerId::from_string(s.to_string()))
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = key_digest(b"a");
        let b = key_digest(b"b");
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert_eq!(distance(&a, &a), [0u8; 32]);
    }

    #[test]
    fn closest_returns_at_most_n_nearest_first() {
        let peers: Vec<Peer> = (0..30).map(|i| peer(&format!("Qm{i:02}"))).collect();
        let nearest = closest_peers(peers.clone(), b"target", 5);
        assert_eq!(nearest.len(), 5);

        // the chosen five must dominate every peer left out
        let target = key_digest(b"target");
        let worst_chosen = peer_distance(&nearest[4].id, &target);
        for p in &peers {
            if nearest.iter().any(|c| c.id == p.id) {
                continue;
            }
            assert!(peer_distance(&p.id, &target) >= worst_chosen);
        }
    }

    #[test]
    fn ordering_is_deterministic() {
        let peers: Vec<Peer> = (0..10).map(|i| peer(&format!("Qm{i}"))).collect();
        let a = closest_peers(peers.clone(), b"k", 10);
        let b = closest_peers(peers, b"k", 10);
        let ids_a: Vec<_> = a.iter().map(|p| p.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }
}
