use std::hash::{BuildHasher, Hasher};
use std::io::{Error, ErrorKind, Result};

use foldhash::fast::FixedState;
use serde::{Deserialize, Serialize};

/// Configuration for the hash function used in a chdmap.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChdMapHashConfig {
    /// Name of hash function used.
    pub name: String,
    /// Parameters for the hash function.
    pub parameters: serde_json::Value,
}

impl Default for ChdMapHashConfig {
    fn default() -> Self {
        ChdMapHashConfig {
            name: ChdMapDefaultHashLoader::NAME.to_string(),
            parameters: serde_json::json!({ "seed": 0 }),
        }
    }
}

impl ChdMapHashConfig {
    /// Seed parameter, used by the builder to derive per-chunk seeds.
    pub fn seed(&self) -> u64 {
        self.parameters
            .get("seed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

/// Turns a stored [`ChdMapHashConfig`] back into a hasher factory.
///
/// Builders and maps are generic over the loader so files written with a
/// custom hash function can only be opened by a map that knows how to rebuild
/// it.
pub trait ChdMapHashLoader {
    type BuildHasher: BuildHasher + Send + Sync;

    fn load(config: &ChdMapHashConfig) -> Result<Self::BuildHasher>;
}

#[derive(Debug, Default)]
pub struct ChdMapDefaultHashLoader;

impl ChdMapDefaultHashLoader {
    pub const NAME: &'static str = "foldhash";
}

impl ChdMapHashLoader for ChdMapDefaultHashLoader {
    type BuildHasher = FixedState;

    fn load(config: &ChdMapHashConfig) -> Result<Self::BuildHasher> {
        if config.name != Self::NAME {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Unsupported hash type: {}", config.name),
            ));
        }
        if let Some(seed) = config.parameters.get("seed").and_then(|v| v.as_u64()) {
            Ok(FixedState::with_seed(seed))
        } else {
            Err(Error::new(
                ErrorKind::InvalidData,
                "Missing or invalid 'seed' parameter for foldhash hash",
            ))
        }
    }
}

const SECOND_STREAM: u64 = 0x243f_6a88_85a3_08d3;
const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// 128-bit digest of a key; everything after the initial hash works on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Fingerprint {
    pub hi: u64,
    pub lo: u64,
}

impl Fingerprint {
    #[inline]
    pub(crate) fn of<S: BuildHasher>(state: &S, key: &[u8]) -> Self {
        let hi = state.hash_one(key);
        let mut hasher = state.build_hasher();
        hasher.write_u64(SECOND_STREAM);
        hasher.write(key);
        Fingerprint {
            hi,
            lo: hasher.finish(),
        }
    }

    /// Chunk selected by the top bits of the fingerprint.
    #[inline]
    pub(crate) fn chunk(&self, chunk_shift: u32) -> usize {
        self.hi.checked_shr(chunk_shift).unwrap_or(0) as usize
    }

    /// Derives the (bucket, position, step) triple for a chunk seed.
    #[inline]
    pub(crate) fn spread(&self, seed: u64) -> [u64; 3] {
        let s = mix(seed);
        let h0 = mix(self.hi ^ s);
        let h1 = mix(self.lo ^ s.rotate_left(21));
        let h2 = mix(h0 ^ h1 ^ GOLDEN_GAMMA);
        [h0, h1, h2]
    }
}

/// splitmix64 finalizer.
#[inline]
pub(crate) fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
