use byteorder::{ByteOrder, LittleEndian};

/// Salt appended to the key for the second hash of the double-hashing
/// scheme. Part of the on-disk format.
const HASH_SALT: &[u8] = b"vektordb.bloom";

/// Bloom filters larger than this are assumed corrupt on deserialize.
const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;

/// Byte-packed Bloom filter with double hashing.
///
/// No false negatives by construction; the false-positive rate is a
/// function of bits per key and hash count (≈1% at 10 bits/key with 3
/// hashes). The k probe indices derive from two FNV-1a hashes — the
/// key, and the key concatenated with a fixed salt — combined as
/// `h1 + i·h2 mod m`. FNV-1a is stable across processes, which the
/// serialized form depends on.
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_keys` at `bits_per_key`, rounded
    /// up to a whole byte.
    pub fn new(expected_keys: usize, bits_per_key: usize, num_hashes: u32) -> Self {
        let num_bits = ((expected_keys.max(1) * bits_per_key.max(1)) as u64).max(8);
        let byte_len = num_bits.div_ceil(8) as usize;
        Self {
            bits: vec![0u8; byte_len],
            num_bits,
            num_hashes: num_hashes.max(1),
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = probe_index(h1, h2, i, self.num_bits);
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    /// `false` means the key is definitely absent; `true` means it may
    /// be present.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = probe_index(h1, h2, i, self.num_bits);
            if self.bits[(idx / 8) as usize] >> (idx % 8) & 1 == 0 {
                return false;
            }
        }
        true
    }

    /// Wire format: `[num_bits: u64 LE][num_hashes: u64 LE][bits]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; 16 + self.bits.len()];
        LittleEndian::write_u64(&mut out[0..8], self.num_bits);
        LittleEndian::write_u64(&mut out[8..16], self.num_hashes as u64);
        out[16..].copy_from_slice(&self.bits);
        out
    }

    /// Parses the wire format, returning `None` when the header fields
    /// fail sanity checks or the bit array length does not match.
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < 16 {
            return None;
        }
        let num_bits = LittleEndian::read_u64(&buf[0..8]);
        let num_hashes = LittleEndian::read_u64(&buf[8..16]);
        if num_bits == 0 || num_bits > (MAX_BLOOM_BYTES as u64) * 8 {
            return None;
        }
        if num_hashes == 0 || num_hashes > 64 {
            return None;
        }
        let byte_len = num_bits.div_ceil(8) as usize;
        if buf.len() - 16 != byte_len {
            return None;
        }
        Some(Self {
            bits: buf[16..].to_vec(),
            num_bits,
            num_hashes: num_hashes as u32,
        })
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn probe_index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = fnv1a_64(&[key]);
    let h2 = fnv1a_64(&[key, HASH_SALT]);
    (h1, h2)
}

/// FNV-1a over the concatenation of the given parts.
fn fnv1a_64(parts: &[&[u8]]) -> u64 {
    const FNV_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = FNV_BASIS;
    for part in parts {
        for &byte in *part {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = BloomFilter::new(1000, 10, 3);
        for i in 0..1000 {
            bloom.add(format!("key-{}", i).as_bytes());
        }
        for i in 0..1000 {
            assert!(bloom.may_contain(format!("key-{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate_within_slack() {
        let mut bloom = BloomFilter::new(1000, 10, 3);
        for i in 0..1000 {
            bloom.add(format!("present-{}", i).as_bytes());
        }

        let mut rng = rand::rng();
        let mut false_positives = 0;
        for _ in 0..1000 {
            let key: Vec<u8> = (0..16).map(|_| rng.random::<u8>()).collect();
            if bloom.may_contain(&key) {
                false_positives += 1;
            }
        }
        // ~1% expected at these parameters; 5% leaves slack.
        assert!(false_positives <= 50, "fp rate too high: {}", false_positives);
    }

    #[test]
    fn test_serialize_roundtrip_preserves_membership() {
        let mut bloom = BloomFilter::new(100, 10, 3);
        for i in 0..100 {
            bloom.add(format!("k{}", i).as_bytes());
        }

        let bytes = bloom.serialize();
        let restored = BloomFilter::deserialize(&bytes).unwrap();
        assert_eq!(restored.num_bits(), bloom.num_bits());
        assert_eq!(restored.num_hashes(), bloom.num_hashes());
        for i in 0..100 {
            assert!(restored.may_contain(format!("k{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_deserialize_rejects_bad_headers() {
        assert!(BloomFilter::deserialize(&[]).is_none());
        assert!(BloomFilter::deserialize(&[0u8; 15]).is_none());

        let mut zero_bits = vec![0u8; 17];
        zero_bits[8] = 3; // num_hashes = 3, num_bits = 0
        assert!(BloomFilter::deserialize(&zero_bits).is_none());

        // Truncated bit array.
        let bloom = BloomFilter::new(100, 10, 3);
        let mut bytes = bloom.serialize();
        bytes.pop();
        assert!(BloomFilter::deserialize(&bytes).is_none());
    }
}
