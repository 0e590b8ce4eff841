use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;

use tracing::debug;

use super::bits::{CompactArray, RankBitVector, words_from_bytes};
use super::hasher::Fingerprint;
use super::meta::FORMAT_VERSION;
use super::{
    ChdMapDefaultHashLoader, ChdMapHashLoader, ChdMapHeader, ChdMapInfo, ChdMapMeta,
    ChdMapReader, ChdMapSection,
};

/// Upper bound on the serialized metadata; it only holds per-chunk records.
const MAX_META_LENGTH: u64 = 64 << 20;

/// Immutable minimal-perfect-hash map from byte strings to integers.
///
/// A `ChdMap` is decoded once from a [`ChdMapReader`] (typically a file) and
/// kept entirely in memory. Lookups hash the key, read one displacement
/// coefficient, one rank directory entry and one packed value; they never
/// allocate, lock or touch the source again, so a map can be shared freely
/// between threads.
///
/// Keys outside the original key set still map to *some* value. Use
/// [`get`](Self::get) on a map built with a signature width to detect them
/// with high probability.
///
/// # Type Parameters
/// - `H`: loader able to rebuild the hash function named in the file.
#[derive(Debug)]
pub struct ChdMap<H: ChdMapHashLoader = ChdMapDefaultHashLoader> {
    /// Header read from the start of the backing file.
    pub header: ChdMapHeader,
    /// Metadata describing the layout and hashing strategy of the backing file.
    pub meta: ChdMapMeta,
    hash_state: H::BuildHasher,
    chunk_seeds: Vec<u64>,
    slot_offsets: Vec<u64>,
    bucket_offsets: Vec<u64>,
    coefficients: CompactArray,
    holes: RankBitVector,
    values: CompactArray,
    signatures: CompactArray,
    phantom_data: PhantomData<H>,
}

impl ChdMap {
    /// Loads a map hashed with the default foldhash loader.
    pub fn open<R: ChdMapReader + ?Sized>(reader: &R) -> Result<Self> {
        Self::load(reader)
    }
}

impl<H: ChdMapHashLoader> ChdMap<H> {
    /// Constructs a map from a [`ChdMapReader`] implementation.
    ///
    /// The method validates the header, deserializes [`ChdMapMeta`], checks
    /// that the chunk layout is consistent, and reads every payload section in
    /// full. The reader is not retained.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::UnexpectedEof` when the source is truncated and
    /// `ErrorKind::InvalidData` when the magic number, the format version, the
    /// hash configuration or any section is invalid. No partially loaded map
    /// is ever returned.
    pub fn load<R: ChdMapReader + ?Sized>(reader: &R) -> Result<Self> {
        let header =
            reader.read_exact_at(0, ChdMapHeader::SIZE as u64, ChdMapHeader::deserialize)?;
        if header.meta_offset < ChdMapHeader::SIZE as u64 || header.meta_length > MAX_META_LENGTH
        {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Invalid metadata location: offset {}, length {}",
                    header.meta_offset, header.meta_length
                ),
            ));
        }

        let meta: ChdMapMeta =
            reader.read_exact_at(header.meta_offset, header.meta_length, |data| {
                rmp_serde::from_slice(data).map_err(|e| {
                    Error::new(
                        ErrorKind::InvalidData,
                        format!("Failed to deserialize ChdMapMeta: {}", e),
                    )
                })
            })?;
        if meta.version != FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Unsupported format version {} (expected {})",
                    meta.version, FORMAT_VERSION
                ),
            ));
        }
        let hash_state = H::load(&meta.hash_config)?;
        let (chunk_seeds, slot_offsets, bucket_offsets) = Self::chunk_layout(&meta)?;

        let read_section = |section: &ChdMapSection| -> Result<Vec<u64>> {
            let in_payload = section.offset >= ChdMapHeader::SIZE as u64
                && section.end().is_some_and(|end| end <= header.meta_offset);
            if section.length == 0 {
                return Ok(Vec::new());
            }
            if !in_payload {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Section [{}, +{}) lies outside the payload",
                        section.offset, section.length
                    ),
                ));
            }
            reader.read_exact_at(section.offset, section.length, words_from_bytes)
        };

        let coefficients = CompactArray::from_words(
            meta.coefficient_width,
            meta.bucket_count,
            read_section(&meta.coefficients)?,
        )?;
        let holes = RankBitVector::from_words(meta.slot_count, read_section(&meta.holes)?)?;
        if meta.slot_count.checked_sub(holes.count_ones()) != Some(meta.entry_count) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Slot table has {} holes in {} slots for {} entries",
                    holes.count_ones(),
                    meta.slot_count,
                    meta.entry_count
                ),
            ));
        }
        let values = CompactArray::from_words(
            meta.value_width,
            meta.entry_count,
            read_section(&meta.values)?,
        )?;
        let signatures = CompactArray::from_words(
            meta.signature_width,
            meta.entry_count,
            read_section(&meta.signatures)?,
        )?;

        debug!(
            entries = meta.entry_count,
            chunks = meta.chunks.len(),
            slots = meta.slot_count,
            "loaded chdmap"
        );

        Ok(ChdMap {
            header,
            meta,
            hash_state,
            chunk_seeds,
            slot_offsets,
            bucket_offsets,
            coefficients,
            holes,
            values,
            signatures,
            phantom_data: PhantomData,
        })
    }

    /// Splits the chunk records into flat arrays with a trailing sentinel,
    /// rejecting layouts that would let a query index out of bounds.
    #[allow(clippy::type_complexity)]
    fn chunk_layout(meta: &ChdMapMeta) -> Result<(Vec<u64>, Vec<u64>, Vec<u64>)> {
        let invalid = |message: String| Error::new(ErrorKind::InvalidData, message);

        if meta.entry_count == 0 {
            if !meta.chunks.is_empty() || meta.slot_count != 0 || meta.bucket_count != 0 {
                return Err(invalid("Empty map with a non-empty layout".to_string()));
            }
            return Ok((Vec::new(), vec![0], vec![0]));
        }

        let chunk_count = meta.chunks.len() as u64;
        let expected_chunks = match meta.chunk_shift {
            64 => Some(1),
            shift @ 1..=63 => 1u64.checked_shl(64 - shift),
            _ => None,
        };
        if expected_chunks != Some(chunk_count) {
            return Err(invalid(format!(
                "Chunk shift {} does not match {} chunks",
                meta.chunk_shift, chunk_count
            )));
        }

        let mut seeds = Vec::with_capacity(meta.chunks.len());
        let mut slot_offsets = Vec::with_capacity(meta.chunks.len() + 1);
        let mut bucket_offsets = Vec::with_capacity(meta.chunks.len() + 1);
        for chunk in &meta.chunks {
            seeds.push(chunk.seed);
            slot_offsets.push(chunk.slot_offset);
            bucket_offsets.push(chunk.bucket_offset);
        }
        slot_offsets.push(meta.slot_count);
        bucket_offsets.push(meta.bucket_count);

        if slot_offsets[0] != 0 || bucket_offsets[0] != 0 {
            return Err(invalid("First chunk does not start at zero".to_string()));
        }
        for window in slot_offsets.windows(2) {
            // Every chunk needs at least two slots for the step modulus.
            if window[1] < window[0].saturating_add(2) || window[1] - window[0] > u32::MAX as u64 {
                return Err(invalid(format!(
                    "Invalid chunk slot range [{}, {})",
                    window[0], window[1]
                )));
            }
        }
        for window in bucket_offsets.windows(2) {
            if window[1] <= window[0] {
                return Err(invalid(format!(
                    "Invalid chunk bucket range [{}, {})",
                    window[0], window[1]
                )));
            }
        }
        Ok((seeds, slot_offsets, bucket_offsets))
    }

    /// Returns the number of keys the map was built from.
    pub fn len(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.entry_count == 0
    }

    /// Returns the value associated with `key`.
    ///
    /// Runs in time linear in the key length and constant in the number of
    /// keys. For a key outside the original key set the result is unspecified
    /// but deterministic; an empty map returns zero.
    #[inline]
    pub fn query(&self, key: &[u8]) -> u64 {
        if self.meta.entry_count == 0 {
            return 0;
        }
        let (_, rank) = self.locate(&Fingerprint::of(&self.hash_state, key));
        self.values.get(rank.min(self.meta.entry_count - 1))
    }

    /// Returns the minimal perfect hash of `key`: a distinct integer in
    /// `0..len()` for every key of the original key set.
    ///
    /// Keys outside the key set may produce any value in `0..=len()`.
    #[inline]
    pub fn index(&self, key: &[u8]) -> u64 {
        if self.meta.entry_count == 0 {
            return 0;
        }
        self.locate(&Fingerprint::of(&self.hash_state, key)).1
    }

    /// Returns the value associated with `key`, or `None` when the map can
    /// tell the key was not in the original key set.
    ///
    /// Without signatures only keys that land on an empty slot are rejected.
    /// With a `w`-bit signature an absent key is accepted with probability
    /// about `2^-w`.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        if self.meta.entry_count == 0 {
            return None;
        }
        let fingerprint = Fingerprint::of(&self.hash_state, key);
        let (slot, rank) = self.locate(&fingerprint);
        if self.holes.get(slot) || rank >= self.meta.entry_count {
            return None;
        }
        if self.meta.signature_width != 0
            && self.signatures.get(rank) != signature(&fingerprint, self.meta.signature_width)
        {
            return None;
        }
        Some(self.values.get(rank))
    }

    /// Returns `(slot, rank)` for a fingerprint. The map must not be empty.
    #[inline]
    fn locate(&self, fingerprint: &Fingerprint) -> (u64, u64) {
        let chunk = fingerprint.chunk(self.meta.chunk_shift);
        let slot_offset = self.slot_offsets[chunk];
        let size = self.slot_offsets[chunk + 1] - slot_offset;
        let bucket_offset = self.bucket_offsets[chunk];
        let buckets = self.bucket_offsets[chunk + 1] - bucket_offset;

        let [h0, h1, h2] = fingerprint.spread(self.chunk_seeds[chunk]);
        let (position, step) = probe(h1, h2, size);
        let coefficient = self.coefficients.get(bucket_offset + (h0 >> 1) % buckets);
        let slot = slot_offset + displace(position, step, coefficient, size);
        (slot, slot - self.holes.rank(slot))
    }

    /// Size in bits of the query structures.
    pub fn num_bits(&self) -> u64 {
        self.coefficients.num_bits()
            + self.holes.num_bits()
            + self.values.num_bits()
            + self.signatures.num_bits()
            + (self.chunk_seeds.len() + self.slot_offsets.len() + self.bucket_offsets.len()) as u64
                * u64::BITS as u64
    }

    pub fn bits_per_key(&self) -> f64 {
        if self.meta.entry_count == 0 {
            0.0
        } else {
            self.num_bits() as f64 / self.meta.entry_count as f64
        }
    }

    /// Summary of the loaded file, as returned by the builder.
    pub fn info(&self) -> ChdMapInfo {
        ChdMapInfo {
            header: self.header,
            meta: self.meta.clone(),
            file_length: self.header.meta_offset + self.header.meta_length,
            bits_per_key: self.bits_per_key(),
        }
    }
}

/// Initial position in `0..size` and probe step in `1..size` of a key.
#[inline]
pub(crate) fn probe(h1: u64, h2: u64, size: u64) -> (u64, u64) {
    ((h1 >> 1) % size, (h2 >> 1) % (size - 1) + 1)
}

/// Slot in `0..size` of a key under its bucket's coefficient. The builder
/// places keys with this same function.
#[inline]
pub(crate) fn displace(position: u64, step: u64, coefficient: u64, size: u64) -> u64 {
    position
        .wrapping_add((coefficient % size).wrapping_mul(step))
        .wrapping_add(coefficient / size)
        % size
}

#[inline]
pub(crate) fn signature(fingerprint: &Fingerprint, width: u32) -> u64 {
    if width >= u64::BITS {
        fingerprint.lo
    } else {
        fingerprint.lo & ((1u64 << width) - 1)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::testing::MemoryFile;
    use crate::*;

    fn build_memory(builder: ChdMapBuilder, entries: &[(&str, u64)]) -> MemoryFile {
        let file = MemoryFile::new(64 << 20);
        builder.build(&file, entries.iter()).unwrap();
        file
    }

    #[test]
    fn test_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chdmap.bin");
        let writer = std::fs::File::create(&path).unwrap();
        let entries = vec![
            ("apple", 1u64),
            ("banana", 2),
            ("cherry", 3),
            ("date", 4),
            ("elderberry", 5),
        ];
        let builder = ChdMapBuilder::default()
            .with_hash_seed(42)
            .with_lambda(2)
            .with_writer_buffer_size(8 << 20); // 8 MiB
        let info = builder.build(&writer, entries.iter()).unwrap();
        assert_eq!(info.meta.entry_count, 5);

        let file = std::fs::File::open(&path).unwrap();
        assert_eq!(info.file_length, file.metadata().unwrap().len());
        let map = ChdMap::open(&file).unwrap();
        assert_eq!(map.len(), 5);
        assert_eq!(map.meta.hash_config.seed(), 42);
        assert_eq!(map.meta.bucket_count, 3);
        for (key, value) in &entries {
            assert_eq!(map.query(key.as_bytes()), *value);
            assert_eq!(map.get(key.as_bytes()), Some(*value));
        }

        let indices: HashSet<u64> = entries.iter().map(|(k, _)| map.index(k.as_bytes())).collect();
        assert_eq!(indices, (0..5).collect());
    }

    #[test]
    fn test_100k() {
        const N: u64 = 100_000;
        let keys: Vec<String> = (0..N).map(|i| format!("key-{i:08}")).collect();
        let file = MemoryFile::new(64 << 20);
        ChdMapBuilder::default()
            .with_log2_chunk_size(12)
            .build(&file, keys.iter().enumerate().map(|(i, k)| (k.as_str(), i as u64 * 3)))
            .unwrap();

        let map = ChdMap::open(&file).unwrap();
        assert_eq!(map.len(), N);
        assert!(map.meta.chunks.len() > 1);
        assert!(map.bits_per_key() < 64.0, "{} bits/key", map.bits_per_key());

        let mut seen = vec![false; N as usize];
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(map.query(key.as_bytes()), i as u64 * 3);
            let index = map.index(key.as_bytes());
            assert!(!seen[index as usize], "index {} assigned twice", index);
            seen[index as usize] = true;
        }

        for _ in 0..1000 {
            let key = rand::random::<u64>().to_le_bytes();
            let value = map.query(&key);
            assert_eq!(map.query(&key), value);
            assert!(map.index(&key) <= N);
        }
    }

    #[test]
    fn test_empty_map() {
        let file = build_memory(ChdMapBuilder::default(), &[]);
        let map = ChdMap::open(&file).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.query(b"anything"), 0);
        assert_eq!(map.index(b"anything"), 0);
        assert_eq!(map.get(b"anything"), None);
    }

    #[test]
    fn test_single_and_empty_key() {
        let file = build_memory(ChdMapBuilder::default(), &[("", 11)]);
        let map = ChdMap::open(&file).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.query(b""), 11);
        assert_eq!(map.get(b""), Some(11));
        assert_eq!(map.index(b""), 0);

        let file = build_memory(ChdMapBuilder::default(), &[("abc", 7), ("", 0)]);
        let map = ChdMap::open(&file).unwrap();
        assert_eq!(map.query(b"abc"), 7);
        assert_eq!(map.query(b""), 0);
    }

    #[test]
    fn test_reproducible_across_loads() {
        let entries: Vec<(String, u64)> = (0..5000).map(|i| (format!("k{i}"), i % 17)).collect();
        let file = MemoryFile::new(64 << 20);
        ChdMapBuilder::default().build(&file, entries.iter()).unwrap();

        let first = ChdMap::open(&file).unwrap();
        let second = ChdMap::open(&file).unwrap();
        for (key, value) in &entries {
            assert_eq!(first.query(key.as_bytes()), *value);
            assert_eq!(first.query(key.as_bytes()), second.query(key.as_bytes()));
            assert_eq!(first.index(key.as_bytes()), second.index(key.as_bytes()));
        }
        for i in 0..1000 {
            let absent = format!("absent-{i}");
            assert_eq!(first.query(absent.as_bytes()), second.query(absent.as_bytes()));
        }
    }

    #[test]
    fn test_signed_map_rejects_absent_keys() {
        let entries: Vec<(String, u64)> = (0..2000).map(|i| (format!("present-{i}"), i)).collect();
        let file = MemoryFile::new(64 << 20);
        ChdMapBuilder::default()
            .with_signature_width(32)
            .build(&file, entries.iter())
            .unwrap();
        let map = ChdMap::open(&file).unwrap();
        assert_eq!(map.meta.signature_width, 32);

        for (key, value) in &entries {
            assert_eq!(map.get(key.as_bytes()), Some(*value));
        }
        let accepted = (0..2000)
            .filter(|i| map.get(format!("absent-{i}").as_bytes()).is_some())
            .count();
        assert_eq!(accepted, 0);
    }

    #[test]
    fn test_concurrent_queries() {
        let entries: Vec<(String, u64)> = (0..10_000).map(|i| (i.to_string(), i)).collect();
        let file = MemoryFile::new(64 << 20);
        ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
        let map = Arc::new(ChdMap::open(&file).unwrap());

        const P: u64 = 4;
        let threads: Vec<_> = (0..P)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for v in (t..10_000).step_by(P as usize) {
                        assert_eq!(map.query(v.to_string().as_bytes()), v);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_invalid_data() {
        const N: u64 = 1000;
        let entries: Vec<(String, u64)> = (0..N).map(|i| (i.to_string(), i)).collect();
        let file = MemoryFile::new(64 << 20);
        let info = ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
        ChdMap::open(&file).unwrap();

        {
            // Corrupt metadata.
            let file = MemoryFile::new(64 << 20);
            ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
            file.corrupt(info.header.meta_offset, b"invalid data");
            let err = ChdMap::open(&file).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        }

        {
            // Truncated metadata.
            let file = MemoryFile::new(64 << 20);
            ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
            file.truncate(info.file_length - 8);
            let err = ChdMap::open(&file).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        }

        {
            // Bad magic number.
            let file = MemoryFile::new(64 << 20);
            ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
            file.corrupt(0, b"invalid data");
            ChdMap::open(&file).unwrap_err();
        }

        {
            // Empty source.
            let file = MemoryFile::new(64 << 20);
            let err = ChdMap::open(&file).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        }

        {
            // Hole section that disagrees with the entry count.
            let file = MemoryFile::new(64 << 20);
            ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
            let holes = info.meta.holes;
            assert!(holes.length >= 8);
            file.corrupt(holes.offset, &u64::MAX.to_le_bytes());
            let err = ChdMap::open(&file).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        }

        {
            // Real file cut in the middle of the payload.
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("truncated.bin");
            let writer = std::fs::File::create(&path).unwrap();
            ChdMapBuilder::default().build(&writer, entries.iter()).unwrap();
            writer.set_len(info.header.meta_offset / 2).unwrap();
            let file = std::fs::File::open(&path).unwrap();
            ChdMap::open(&file).unwrap_err();
        }
    }

    #[test]
    fn test_info_matches_builder() {
        let entries = [("x", 10u64), ("y", 20), ("z", 30)];
        let file = MemoryFile::new(1 << 20);
        let built = ChdMapBuilder::default().build(&file, entries.iter()).unwrap();
        let map = ChdMap::open(&file).unwrap();
        let info = map.info();
        assert_eq!(info.header, built.header);
        assert_eq!(info.meta, built.meta);
        assert_eq!(info.file_length, file.len());
        assert_eq!(info.meta.value_width, 5);
        serde_json::to_string(&info).unwrap();
    }
}
