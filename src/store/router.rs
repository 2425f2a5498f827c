//! Key to shard routing.
//!
//! Keys hash to one of 16384 slots the same way a Redis cluster assigns them
//! (CRC16/XMODEM, honoring `{hash tags}`), and slots are split into contiguous
//! ranges, one per shard. The mapping depends only on the key and the shard
//! count, so every caller sends a key's atomic unit to the same shard.

/// Number of hash slots keys are distributed over.
pub const SLOT_COUNT: u16 = 16384;

/// Compute the hash slot for `key`.
pub fn key_slot(key: &str) -> u16 {
    crc16(hash_tag(key.as_bytes())) % SLOT_COUNT
}

/// The part of the key that is hashed: the contents of the first non-empty
/// `{...}` section, or the whole key.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Maps keys to shard ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: usize,
}

impl ShardRouter {
    /// Create a router over `shard_count` shards (at least one).
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// The shard responsible for `key`.
    pub fn route(&self, key: &str) -> usize {
        key_slot(key) as usize * self.shard_count / SLOT_COUNT as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_known_key_slots() {
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("bar"), 5061);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(key_slot("{user1000}.following"), key_slot("{user1000}.followers"));
        assert_eq!(key_slot("ratelimit:{abc}"), key_slot("abc"));
        // Empty tag hashes the whole key
        assert_eq!(key_slot("foo{}{bar}"), crc16(b"foo{}{bar}") % SLOT_COUNT);
        // Unclosed brace hashes the whole key
        assert_eq!(key_slot("foo{bar"), crc16(b"foo{bar") % SLOT_COUNT);
    }

    #[test]
    fn test_route_is_deterministic_and_in_range() {
        let router = ShardRouter::new(5);
        for i in 0..500 {
            let key = format!("ratelimit:user-{}", i);
            let shard = router.route(&key);
            assert!(shard < 5);
            assert_eq!(shard, router.route(&key));
            assert_eq!(shard, ShardRouter::new(5).route(&key));
        }
    }

    #[test]
    fn test_route_spreads_keys() {
        let router = ShardRouter::new(4);
        let mut seen = [0usize; 4];
        for i in 0..1000 {
            seen[router.route(&format!("ratelimit:user-{}", i))] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0), "distribution: {:?}", seen);
    }

    #[test]
    fn test_single_shard_and_zero_shards() {
        assert_eq!(ShardRouter::new(1).route("anything"), 0);
        let router = ShardRouter::new(0);
        assert_eq!(router.shard_count(), 1);
        assert_eq!(router.route("anything"), 0);
    }
}
