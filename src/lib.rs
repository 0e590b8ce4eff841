//! Static, space-efficient maps from byte strings to integers, plus the
//! harness used to benchmark their lookups.
//!
//! The `chdmap` crate builds a minimal perfect hash function over a fixed key
//! set with the "hash, displace and compress" technique and stores the
//! associated values in bit-packed arrays. [`ChdMapBuilder`] serializes a map
//! to any positional writer, and [`ChdMap`] decodes it back into memory for
//! constant-time lookups that never allocate.
//!
//! The [`bench`] module reads a newline-delimited key corpus and times
//! repeated query passes over it; the `chdmap-bench` binary wires it to the
//! command line.
//!
//! ```
//! use chdmap::{ChdMap, ChdMapBuilder};
//!
//! # fn main() -> std::io::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("fruits.chdmap");
//! let entries = [("apple", 1u64), ("banana", 2u64), ("cherry", 3u64)];
//! let file = std::fs::File::create(&path)?;
//! ChdMapBuilder::default().build(&file, entries.iter())?;
//!
//! let file = std::fs::File::open(&path)?;
//! let map = ChdMap::open(&file)?;
//! assert_eq!(map.query(b"banana"), 2);
//! assert_eq!(map.len(), 3);
//! # Ok(())
//! # }
//! ```
const MAGIC_NUMBER: u64 = u64::from_be_bytes(*b"CHDMAP!!");

pub mod bits;

mod hasher;
pub use hasher::{ChdMapDefaultHashLoader, ChdMapHashConfig, ChdMapHashLoader};

mod meta;
pub use meta::{
    ChdMapChunk, ChdMapHeader, ChdMapInfo, ChdMapMeta, ChdMapSection, FORMAT_VERSION,
};

mod reader;
pub use reader::ChdMapReader;

mod writer;
pub use writer::ChdMapWriter;

mod chdmap;
pub use chdmap::ChdMap;

mod builder;
pub use builder::ChdMapBuilder;

pub mod bench;

#[cfg(test)]
mod testing;
