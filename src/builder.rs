use std::borrow::Borrow;
use std::io::{BufWriter, Error, ErrorKind, Result, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::bits::{CompactArray, RankBitVector, bit_width, write_words};
use crate::chdmap::{displace, probe, signature};
use crate::hasher::{Fingerprint, mix};
use crate::meta::FORMAT_VERSION;
use crate::{
    ChdMapChunk, ChdMapDefaultHashLoader, ChdMapHashConfig, ChdMapHashLoader, ChdMapHeader,
    ChdMapInfo, ChdMapMeta, ChdMapSection, ChdMapWriter,
};

/// Attempts per chunk before giving up on finding displacements.
const MAX_CHUNK_ATTEMPTS: u32 = 256;

/// Builder type for emitting chdmap files from key-value iterators.
///
/// The builder owns configuration such as the hash seed, bucket sizing, load
/// factor, signature width and IO buffering. Use [`build`](Self::build) to
/// compute a minimal perfect hash over the keys and stream the packed tables
/// to a [`ChdMapWriter`] sink (typically a file implementing `FileExt`).
///
/// Construction follows the "hash, displace and compress" scheme: keys are
/// split into chunks of roughly `2^log2_chunk_size`, each chunk hashes its
/// keys into buckets of average size `lambda`, and buckets are placed from
/// the largest down by searching for a displacement that sends all of their
/// keys to free slots.
///
/// The loader type parameter `H` allows swapping in custom
/// [`ChdMapHashLoader`] implementations.
#[derive(Debug)]
pub struct ChdMapBuilder<H: ChdMapHashLoader = ChdMapDefaultHashLoader> {
    hash_config: ChdMapHashConfig,
    lambda: u32,
    load_factor: f64,
    signature_width: u32,
    log2_chunk_size: u32,
    writer_buffer_size: usize,
    phantom: std::marker::PhantomData<H>,
}

impl<H: ChdMapHashLoader> Default for ChdMapBuilder<H> {
    fn default() -> Self {
        Self {
            hash_config: ChdMapHashConfig::default(),
            lambda: 5,
            load_factor: 1.0,
            signature_width: 0,
            log2_chunk_size: 16,
            writer_buffer_size: 16 << 20, // 16 MiB
            phantom: std::marker::PhantomData,
        }
    }
}

impl ChdMapBuilder {
    /// Creates a new default chdmap builder with default hash loader.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        <Self as Default>::default()
    }
}

impl<H: ChdMapHashLoader> ChdMapBuilder<H> {
    /// Replaces the entire hash configuration used to fingerprint keys.
    ///
    /// For most use cases, [`with_hash_seed`](Self::with_hash_seed) is
    /// sufficient to override just the seed parameter.
    pub fn with_hash_config(mut self, config: ChdMapHashConfig) -> Self {
        self.hash_config = config;
        self
    }

    /// Overrides the hash seed used to fingerprint keys.
    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_config.parameters["seed"] = serde_json::json!(seed);
        self
    }

    /// Sets the average number of keys per bucket.
    ///
    /// Larger buckets mean fewer coefficients (smaller files) but a slower
    /// displacement search.
    pub fn with_lambda(mut self, lambda: u32) -> Self {
        self.lambda = lambda;
        self
    }

    /// Sets the ratio between keys and slots in each chunk, in `(0, 1]`.
    pub fn with_load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Stores a `width`-bit signature per key so that
    /// [`ChdMap::get`](crate::ChdMap::get) can reject absent keys.
    pub fn with_signature_width(mut self, width: u32) -> Self {
        self.signature_width = width;
        self
    }

    /// Sets the logarithm of the target number of keys per chunk.
    pub fn with_log2_chunk_size(mut self, log2: u32) -> Self {
        self.log2_chunk_size = log2;
        self
    }

    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::new(ErrorKind::InvalidInput, message));
        if self.lambda == 0 {
            return invalid("lambda must be at least 1".to_string());
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return invalid(format!("load factor {} not in (0, 1]", self.load_factor));
        }
        if self.signature_width > u64::BITS {
            return invalid(format!("signature width {} exceeds 64", self.signature_width));
        }
        if self.log2_chunk_size > 32 {
            return invalid(format!("log2 chunk size {} exceeds 32", self.log2_chunk_size));
        }
        Ok(())
    }

    /// Consumes the builder and writes a chdmap to `writer` from `entries`.
    ///
    /// Input ordering does not matter. A [`ChdMapInfo`] summary is returned
    /// on success.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidInput` for invalid parameters,
    /// `ErrorKind::InvalidData` when the input contains a duplicate key or the
    /// hash configuration cannot be loaded, and any IO failure reported by the
    /// underlying writer.
    ///
    /// # Examples
    ///
    /// ```
    /// use chdmap::ChdMapBuilder;
    ///
    /// # fn main() -> std::io::Result<()> {
    /// let dir = tempfile::tempdir()?;
    /// let data = [("it", 1u64), ("works", 2u64)];
    /// let file = std::fs::File::create(dir.path().join("example.chdmap"))?;
    /// let info = ChdMapBuilder::default().build(&file, data.iter())?;
    /// assert_eq!(info.meta.entry_count, 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn build<W, K>(
        self,
        writer: &W,
        entries: impl Iterator<Item = impl Borrow<(K, u64)>>,
    ) -> Result<ChdMapInfo>
    where
        W: ChdMapWriter + ?Sized,
        K: AsRef<[u8]>,
    {
        self.validate()?;
        let build_hasher = H::load(&self.hash_config)?;

        let mut entries: Vec<(Fingerprint, u64)> = entries
            .map(|entry| {
                let (key, value) = entry.borrow();
                (Fingerprint::of(&build_hasher, key.as_ref()), *value)
            })
            .collect();
        entries.sort_unstable_by_key(|(fingerprint, _)| *fingerprint);
        if entries.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Duplicate key in input",
            ));
        }
        let entry_count = entries.len() as u64;

        let log2_chunks = match entry_count >> self.log2_chunk_size {
            0 => 0,
            n => n.ilog2(),
        };
        let chunk_shift = u64::BITS - log2_chunks;
        let chunk_count = 1usize << log2_chunks;
        if entry_count > 0 {
            info!(
                keys = entry_count,
                chunks = chunk_count,
                "average chunk size {:.1}",
                entry_count as f64 / chunk_count as f64
            );
        }

        // Entries are sorted by fingerprint, so chunks are contiguous runs.
        let mut chunk_starts = Vec::with_capacity(chunk_count + 1);
        let mut cursor = 0;
        for chunk in 0..chunk_count {
            chunk_starts.push(cursor);
            while cursor < entries.len() && entries[cursor].0.chunk(chunk_shift) == chunk {
                cursor += 1;
            }
        }
        chunk_starts.push(entries.len());

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut coefficients = Vec::new();
        let mut holes = Vec::new();
        let mut slots = vec![0u64; entries.len()];
        let mut slot_offset = 0u64;
        let mut rng = SplitMix64::new(self.hash_config.seed());

        if entry_count > 0 {
            for chunk in 0..chunk_count {
                let range = chunk_starts[chunk]..chunk_starts[chunk + 1];
                let layout = self.displace_chunk(chunk, &entries[range.clone()], &mut rng)?;

                chunks.push(ChdMapChunk {
                    seed: layout.seed,
                    slot_offset,
                    bucket_offset: coefficients.len() as u64,
                });
                coefficients.extend_from_slice(&layout.coefficients);
                for (slot, used) in layout.used.iter().enumerate() {
                    if !*used {
                        holes.push(slot_offset + slot as u64);
                    }
                }
                for (index, slot) in range.zip(layout.slots) {
                    slots[index] = slot_offset + slot;
                }
                slot_offset += layout.size;
            }
        }

        let slot_count = slot_offset;
        let holes = RankBitVector::from_ones(slot_count, holes);
        let coefficients = CompactArray::from_values(&coefficients);

        let max_value = entries.iter().map(|(_, v)| *v).max().unwrap_or(0);
        let mut values = CompactArray::new(bit_width(max_value), entry_count);
        let mut signatures = CompactArray::new(self.signature_width, entry_count);
        for ((fingerprint, value), slot) in entries.iter().zip(&slots) {
            let rank = slot - holes.rank(*slot);
            values.set(rank, *value);
            signatures.set(rank, signature(fingerprint, self.signature_width));
        }

        let offset = AtomicU64::new(ChdMapHeader::SIZE as u64);
        let mut buf_writer = BufWriter::with_capacity(
            self.writer_buffer_size,
            ChdMapWriterWrapper {
                inner: writer,
                offset: &offset,
            },
        );
        let mut sections = [ChdMapSection::default(); 4];
        let payload = [
            coefficients.words(),
            holes.words(),
            values.words(),
            signatures.words(),
        ];
        for (section, words) in sections.iter_mut().zip(payload) {
            let begin_offset = offset.load(Ordering::Relaxed) + buf_writer.buffer().len() as u64;
            write_words(&mut buf_writer, words)?;
            let end_offset = offset.load(Ordering::Relaxed) + buf_writer.buffer().len() as u64;
            *section = ChdMapSection {
                offset: begin_offset,
                length: end_offset - begin_offset,
            };
        }
        let [
            coefficients_section,
            holes_section,
            values_section,
            signatures_section,
        ] = sections;

        let meta = ChdMapMeta {
            version: FORMAT_VERSION,
            hash_config: self.hash_config,
            entry_count,
            chunk_shift,
            lambda: self.lambda,
            load_factor: self.load_factor,
            slot_count,
            bucket_count: coefficients.len(),
            chunks,
            coefficient_width: coefficients.width(),
            value_width: values.width(),
            signature_width: self.signature_width,
            coefficients: coefficients_section,
            holes: holes_section,
            values: values_section,
            signatures: signatures_section,
        };

        let meta_offset = offset.load(Ordering::Relaxed) + buf_writer.buffer().len() as u64;
        rmp_serde::encode::write(&mut buf_writer, &meta)
            .map_err(|e| Error::other(format!("Fail to serialize meta: {}", e)))?;
        let finished_offset = offset.load(Ordering::Relaxed) + buf_writer.buffer().len() as u64;
        buf_writer.flush()?;

        let header = ChdMapHeader {
            meta_offset,
            meta_length: finished_offset - meta_offset,
        };
        writer.write_at(&header.serialize(), 0)?;

        let num_bits = coefficients.num_bits()
            + holes.num_bits()
            + values.num_bits()
            + signatures.num_bits()
            + (3 * meta.chunks.len() as u64 + 2) * u64::BITS as u64;
        let bits_per_key = if entry_count == 0 {
            0.0
        } else {
            num_bits as f64 / entry_count as f64
        };
        if entry_count > 0 {
            info!(bits_per_key, "Completed chdmap with {} keys", entry_count);
        }

        Ok(ChdMapInfo {
            header,
            meta,
            file_length: finished_offset,
            bits_per_key,
        })
    }

    /// Finds a seed and per-bucket coefficients placing every key of a chunk
    /// in a distinct slot.
    fn displace_chunk(
        &self,
        chunk: usize,
        entries: &[(Fingerprint, u64)],
        rng: &mut SplitMix64,
    ) -> Result<ChunkLayout> {
        let wanted = (entries.len() as f64 / self.load_factor).ceil() as u64 + 1;
        let size = next_prime(wanted);
        if size > u32::MAX as u64 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("chunk {} needs {} slots, lower the chunk size", chunk, size),
            ));
        }
        let bucket_count = (entries.len() as u64)
            .div_ceil(self.lambda as u64)
            .max(1);

        // Each bucket holds (position, step, entry index) per key.
        let mut buckets: Vec<Vec<(u64, u64, usize)>> = vec![Vec::new(); bucket_count as usize];
        let mut used = vec![false; size as usize];
        let mut coefficients = vec![0u64; bucket_count as usize];

        'attempt: for attempt in 0..MAX_CHUNK_ATTEMPTS {
            let seed = rng.next_u64();
            buckets.iter_mut().for_each(Vec::clear);
            used.fill(false);

            for (index, (fingerprint, _)) in entries.iter().enumerate() {
                let [h0, h1, h2] = fingerprint.spread(seed);
                let (position, step) = probe(h1, h2, size);
                let bucket = &mut buckets[((h0 >> 1) % bucket_count) as usize];
                // Keys sharing a bucket, a position and a step can never be separated.
                if bucket.iter().any(|&(p, s, _)| p == position && s == step) {
                    debug!(chunk, attempt, "colliding probe sequence, reseeding");
                    continue 'attempt;
                }
                bucket.push((position, step, index));
            }

            let mut order: Vec<usize> = (0..buckets.len()).collect();
            order.sort_by_key(|&b| std::cmp::Reverse(buckets[b].len()));

            let mut start = 0;
            while start < order.len() {
                let len = buckets[order[start]].len();
                let end = start + order[start..].partition_point(|&b| buckets[b].len() == len);
                let mut todo: Vec<usize> = order[start..end].to_vec();

                // Coefficients are tried in increasing order so most stay small.
                'search: for high in 0..size {
                    for low in 0..size {
                        let coefficient = low + high * size;
                        todo.retain(|&b| {
                            if try_place(&buckets[b], coefficient, size, &mut used) {
                                coefficients[b] = coefficient;
                                false
                            } else {
                                true
                            }
                        });
                        if todo.is_empty() {
                            break 'search;
                        }
                    }
                }
                if !todo.is_empty() {
                    debug!(chunk, attempt, "no displacement for buckets of size {}", len);
                    continue 'attempt;
                }
                start = end;
            }

            let mut slots = vec![0u64; entries.len()];
            for (bucket, &coefficient) in buckets.iter().zip(&coefficients) {
                for &(position, step, index) in bucket {
                    slots[index] = displace(position, step, coefficient, size);
                }
            }
            if attempt > 0 {
                debug!(chunk, attempts = attempt + 1, "chunk placed");
            }
            return Ok(ChunkLayout {
                seed,
                size,
                coefficients,
                used,
                slots,
            });
        }

        warn!(chunk, "giving up after {} attempts", MAX_CHUNK_ATTEMPTS);
        Err(Error::other(format!(
            "Could not find a displacement for chunk {} after {} attempts",
            chunk, MAX_CHUNK_ATTEMPTS
        )))
    }
}

/// Marks the slots of `bucket` under `coefficient` as used if all are free.
fn try_place(bucket: &[(u64, u64, usize)], coefficient: u64, size: u64, used: &mut [bool]) -> bool {
    for (placed, &(position, step, _)) in bucket.iter().enumerate() {
        let slot = displace(position, step, coefficient, size) as usize;
        if used[slot] {
            for &(position, step, _) in &bucket[..placed] {
                used[displace(position, step, coefficient, size) as usize] = false;
            }
            return false;
        }
        used[slot] = true;
    }
    true
}

struct ChunkLayout {
    seed: u64,
    size: u64,
    coefficients: Vec<u64>,
    used: Vec<bool>,
    /// Slot of each entry relative to the chunk start, in entry order.
    slots: Vec<u64>,
}

/// Deterministic seed stream, so equal inputs give byte-identical files.
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        mix(self.state)
    }
}

fn is_prime(n: u64) -> bool {
    if n < 4 {
        return n >= 2;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Smallest prime `>= n`.
fn next_prime(n: u64) -> u64 {
    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Thin wrapper implementing [`std::io::Write`] in terms of [`ChdMapWriter`].
///
/// This adapter streams each write into the underlying writer at consecutive
/// offsets tracked by an atomic counter. It is primarily used internally by the
/// builder.
struct ChdMapWriterWrapper<'a, W: ChdMapWriter + ?Sized> {
    inner: &'a W,
    offset: &'a AtomicU64,
}

impl<'a, W: ChdMapWriter + ?Sized> std::io::Write for ChdMapWriterWrapper<'a, W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let offset = self.offset.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.inner.write_at(buf, offset)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::hash::Hasher;

    use super::{is_prime, next_prime};
    use crate::testing::MemoryFile;
    use crate::*;

    #[test]
    fn test_shorter_write() {
        const N: u64 = 1000;
        let keys: Vec<String> = (0..N).map(|i| format!("{i:04}")).collect();
        let entries = || keys.iter().map(|k| (k.as_str(), 7u64));

        let writer = MemoryFile::new(1 << 20);
        let info = ChdMapBuilder::default()
            .with_hash_seed(42)
            .with_writer_buffer_size(64)
            .build(&writer, entries())
            .unwrap();
        let map = ChdMap::open(&writer).unwrap();
        for key in &keys {
            assert_eq!(map.query(key.as_bytes()), 7);
        }

        // Too small to hold the payload: the writer error surfaces.
        let writer = MemoryFile::new(info.file_length / 2);
        ChdMapBuilder::default()
            .with_hash_seed(42)
            .build(&writer, entries())
            .unwrap_err();
    }

    #[test]
    fn test_deterministic_output() {
        let entries: Vec<(String, u64)> = (0..3000).map(|i| (format!("w{i}"), i)).collect();
        let a = MemoryFile::new(1 << 20);
        let b = MemoryFile::new(1 << 20);
        let info_a = ChdMapBuilder::default().build(&a, entries.iter()).unwrap();
        let info_b = ChdMapBuilder::default().build(&b, entries.iter().rev()).unwrap();
        assert_eq!(info_a.header, info_b.header);
        assert_eq!(info_a.meta, info_b.meta);
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_duplicate_keys() {
        let writer = MemoryFile::new(1 << 20);
        let err = ChdMapBuilder::default()
            .build(&writer, [("a", 1u64), ("b", 2), ("a", 3)].iter())
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_invalid_parameters() {
        let entries = [("a", 1u64)];
        let writer = MemoryFile::new(1 << 20);
        for builder in [
            ChdMapBuilder::default().with_lambda(0),
            ChdMapBuilder::default().with_load_factor(0.0),
            ChdMapBuilder::default().with_load_factor(1.5),
            ChdMapBuilder::default().with_signature_width(65),
            ChdMapBuilder::default().with_log2_chunk_size(40),
        ] {
            let err = builder.build(&writer, entries.iter()).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        }

        let hash_config = ChdMapHashConfig {
            name: "unknown".to_string(),
            parameters: serde_json::json!({}),
        };
        ChdMapBuilder::default()
            .with_hash_config(hash_config)
            .build(&writer, entries.iter())
            .unwrap_err();
    }

    #[test]
    fn test_parameters_affect_layout() {
        let entries: Vec<(String, u64)> = (0..4000).map(|i| (format!("p{i}"), i)).collect();

        let writer = MemoryFile::new(1 << 20);
        let info = ChdMapBuilder::default()
            .with_lambda(3)
            .with_load_factor(0.8)
            .with_log2_chunk_size(10)
            .build(&writer, entries.iter())
            .unwrap();
        assert_eq!(info.meta.chunks.len(), 2);
        assert_eq!(info.meta.chunk_shift, 63);
        assert!(info.meta.slot_count >= 5000);
        assert!(info.meta.bucket_count >= 1334);

        let map = ChdMap::open(&writer).unwrap();
        for (key, value) in &entries {
            assert_eq!(map.get(key.as_bytes()), Some(*value));
        }
    }

    #[test]
    fn test_primes() {
        let primes: Vec<u64> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(14), 17);
        assert_eq!(next_prime(65537), 65537);
    }

    pub struct SimpleHasher {
        state: u64,
    }

    impl Hasher for SimpleHasher {
        fn finish(&self) -> u64 {
            self.state
        }

        fn write(&mut self, bytes: &[u8]) {
            for &byte in bytes {
                self.state = self.state.wrapping_mul(31).wrapping_add(byte as u64);
            }
        }
    }

    struct SimpleBuildHasher {
        init: u64,
    }

    impl std::hash::BuildHasher for SimpleBuildHasher {
        type Hasher = SimpleHasher;

        fn build_hasher(&self) -> Self::Hasher {
            SimpleHasher { state: self.init }
        }
    }

    struct SimpleHashLoader;

    impl ChdMapHashLoader for SimpleHashLoader {
        type BuildHasher = SimpleBuildHasher;

        fn load(config: &ChdMapHashConfig) -> std::io::Result<Self::BuildHasher> {
            if config.name != "simplehash" {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "expected simplehash",
                ));
            }
            let init = config
                .parameters
                .get("init")
                .and_then(|v| v.as_u64())
                .unwrap_or(17);
            Ok(SimpleBuildHasher { init })
        }
    }

    #[test]
    fn test_custom_hash_loader() {
        let writer = MemoryFile::new(1 << 20);
        let hash_config = ChdMapHashConfig {
            name: "simplehash".to_string(),
            parameters: serde_json::json!({ "init": 5 }),
        };
        let entries: Vec<(String, u64)> = (0..500).map(|i| (format!("s{i}"), i)).collect();
        ChdMapBuilder::<SimpleHashLoader>::default()
            .with_hash_config(hash_config)
            .build(&writer, entries.iter())
            .unwrap();

        let map = ChdMap::<SimpleHashLoader>::load(&writer).unwrap();
        assert_eq!(map.meta.hash_config.name, "simplehash");
        for (key, value) in &entries {
            assert_eq!(map.query(key.as_bytes()), *value);
        }

        // The default loader does not know this hash function.
        ChdMap::open(&writer).unwrap_err();
    }
}
