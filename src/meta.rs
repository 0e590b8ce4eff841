use std::io::{Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

use super::{ChdMapHashConfig, MAGIC_NUMBER};

/// Version of the on-disk layout written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed-size header at the beginning of every chdmap file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChdMapHeader {
    /// Absolute offset at which the serialized metadata begins.
    pub meta_offset: u64,
    /// Length in bytes of the serialized metadata blob.
    pub meta_length: u64,
}

impl ChdMapHeader {
    pub const SIZE: usize = std::mem::size_of::<u64>() * 3;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut data = [0u8; Self::SIZE];
        data[..8].copy_from_slice(&MAGIC_NUMBER.to_be_bytes());
        data[8..16].copy_from_slice(&self.meta_offset.to_be_bytes());
        data[16..].copy_from_slice(&self.meta_length.to_be_bytes());
        data
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("header needs {} bytes, got {}", Self::SIZE, data.len()),
            ));
        }
        let magic_number = u64::from_be_bytes(data[..8].try_into().unwrap());
        if magic_number != MAGIC_NUMBER {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Invalid magic number: {}", magic_number),
            ));
        }
        Ok(ChdMapHeader {
            meta_offset: u64::from_be_bytes(data[8..16].try_into().unwrap()),
            meta_length: u64::from_be_bytes(data[16..24].try_into().unwrap()),
        })
    }
}

/// Byte range of one payload section.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChdMapSection {
    pub offset: u64,
    pub length: u64,
}

impl ChdMapSection {
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Layout of one chunk of the hash table.
///
/// Keys are split into chunks by the top bits of their fingerprint; each
/// chunk is an independent displacement table of prime size.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChdMapChunk {
    /// Seed mixed into the fingerprint of every key in the chunk.
    pub seed: u64,
    /// Index of the chunk's first slot in the global slot space.
    pub slot_offset: u64,
    /// Index of the chunk's first bucket in the coefficient array.
    pub bucket_offset: u64,
}

/// Metadata serialized at the tail of every chdmap file.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ChdMapMeta {
    /// Layout version, see [`FORMAT_VERSION`].
    pub version: u32,
    /// Hash function used to fingerprint keys.
    pub hash_config: ChdMapHashConfig,
    /// Number of keys in the map.
    pub entry_count: u64,
    /// Shift applied to the high fingerprint word to select a chunk.
    pub chunk_shift: u32,
    /// Average bucket size requested at build time.
    pub lambda: u32,
    /// Load factor requested at build time.
    pub load_factor: f64,
    /// Total number of slots across all chunks.
    pub slot_count: u64,
    /// Total number of buckets across all chunks.
    pub bucket_count: u64,
    /// Per-chunk layout, in chunk order.
    pub chunks: Vec<ChdMapChunk>,
    /// Bits per displacement coefficient.
    pub coefficient_width: u32,
    /// Bits per value.
    pub value_width: u32,
    /// Bits per signature, zero for an unsigned map.
    pub signature_width: u32,
    pub coefficients: ChdMapSection,
    pub holes: ChdMapSection,
    pub values: ChdMapSection,
    pub signatures: ChdMapSection,
}

/// Summary returned by [`ChdMapBuilder::build`](crate::ChdMapBuilder::build)
/// and [`ChdMap::info`](crate::ChdMap::info).
#[derive(Serialize, Debug, Clone)]
pub struct ChdMapInfo {
    pub header: ChdMapHeader,
    pub meta: ChdMapMeta,
    /// Final size of the file in bytes.
    pub file_length: u64,
    /// In-memory footprint of the query structures per key.
    pub bits_per_key: f64,
}
