//! Fixed-size Bloom filter used to fingerprint leaf tuples.
//!
//! The bitset is always a power of two bits, sized for roughly two bytes per
//! expected element with a 1 MiB floor. The k bit positions come from two
//! independent base hashes combined by enhanced double hashing, which gives
//! pseudo k-wise independence without computing k real hashes.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use xxhash_rust::xxh64::xxh64;

const MAX_HASH_FUNCS: usize = 10;
const MIN_BITSET_BYTES: u64 = 1024 * 1024;
const MAX_BITSET_POWER: u32 = 32;

/// Set-membership filter with no false negatives.
#[derive(Clone)]
pub struct BloomFilter {
    k_hash_funcs: usize,
    seed: u64,
    bitset_bits: u64,
    bitset: Vec<u8>,
}

impl BloomFilter {
    /// Sizes a filter for `total_elems` elements within `work_mem_kb` of memory.
    ///
    /// The memory budget is only an upper bound: the filter never drops below
    /// 1 MiB, and it is rounded down to a power of two bits.
    pub fn new(total_elems: u64, work_mem_kb: u64, seed: u64) -> Self {
        let budget = work_mem_kb
            .saturating_mul(1024)
            .min(total_elems.saturating_mul(2))
            .max(MIN_BITSET_BYTES);
        let power = bloom_power(budget.saturating_mul(8));
        let bitset_bits = 1u64 << power;
        Self {
            k_hash_funcs: optimal_k(bitset_bits, total_elems),
            seed,
            bitset_bits,
            bitset: vec![0u8; (bitset_bits / 8) as usize],
        }
    }

    /// Records `elem`.
    pub fn add(&mut self, elem: &[u8]) {
        let mut hashes = [0u64; MAX_HASH_FUNCS];
        self.k_hashes(&mut hashes, elem);
        for &bit in &hashes[..self.k_hash_funcs] {
            self.bitset[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
    }

    /// True when `elem` was certainly never added.
    pub fn lacks(&self, elem: &[u8]) -> bool {
        let mut hashes = [0u64; MAX_HASH_FUNCS];
        self.k_hashes(&mut hashes, elem);
        hashes[..self.k_hash_funcs]
            .iter()
            .any(|&bit| self.bitset[(bit >> 3) as usize] & (1 << (bit & 7)) == 0)
    }

    /// Fraction of bits set. Values well above 0.5 mean the set was underestimated.
    pub fn proportion_bits_set(&self) -> f64 {
        let set: u64 = self.bitset.iter().map(|b| u64::from(b.count_ones())).sum();
        set as f64 / self.bitset_bits as f64
    }

    pub fn bit_count(&self) -> u64 {
        self.bitset_bits
    }

    pub fn hash_funcs(&self) -> usize {
        self.k_hash_funcs
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn k_hashes(&self, hashes: &mut [u64; MAX_HASH_FUNCS], elem: &[u8]) {
        let m = self.bitset_bits;
        let mut x = xxh64(elem, self.seed) % m;
        let mut y = if self.k_hash_funcs > 1 {
            let mut sip = SipHasher13::new_with_keys(0, 0);
            sip.write(elem);
            sip.finish() % m
        } else {
            0
        };
        hashes[0] = x;
        for (i, slot) in hashes
            .iter_mut()
            .enumerate()
            .take(self.k_hash_funcs)
            .skip(1)
        {
            x = (x + y) % m;
            y = (y + i as u64) % m;
            *slot = x;
        }
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("k_hash_funcs", &self.k_hash_funcs)
            .field("seed", &self.seed)
            .field("bitset_bits", &self.bitset_bits)
            .finish()
    }
}

/// Largest power of two not above `target_bits`, capped at 2^32.
fn bloom_power(target_bits: u64) -> u32 {
    let power = 63 - target_bits.max(1).leading_zeros();
    power.min(MAX_BITSET_POWER)
}

fn optimal_k(bitset_bits: u64, total_elems: u64) -> usize {
    let k = (std::f64::consts::LN_2 * bitset_bits as f64 / total_elems.max(1) as f64).round();
    (k as usize).clamp(1, MAX_HASH_FUNCS)
}
