//! Lookup benchmark harness.
//!
//! A run loads a map, reads a newline-delimited key corpus into memory, then
//! performs a fixed number of timed passes that query every key in order:
//!
//! ```
//! use chdmap::ChdMapBuilder;
//! use chdmap::bench::{KeyCorpus, open_map, run_trials};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let map_path = dir.path().join("words.chdmap");
//! let file = std::fs::File::create(&map_path)?;
//! ChdMapBuilder::default().build(&file, [("hello", 1u64), ("world", 2u64)].iter())?;
//!
//! let map = open_map(&map_path)?;
//! let corpus = KeyCorpus::parse(b"hello\nworld\n".to_vec(), 2)?;
//! let report = run_trials(&map, &corpus, 3);
//! assert_eq!(report.checksum, 9);
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use crate::ChdMap;

mod corpus;
pub use corpus::{KeyCorpus, KeySpan};

mod error;
pub use error::{BenchError, Result};

mod report;
pub use report::{BenchReport, BenchSummary, TrialStats};

mod trial;
pub use trial::{KeyQuery, run_trials, run_trials_with};

/// Opens and fully loads the map stored at `path`.
pub fn open_map(path: impl AsRef<Path>) -> Result<ChdMap> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|source| BenchError::FileOpen {
        path: path.to_path_buf(),
        source,
    })?;
    ChdMap::open(&file).map_err(BenchError::Load)
}
