use std::path::Path;

use super::error::{BenchError, Result};

/// Byte range of one key inside a [`KeyCorpus`] buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeySpan {
    pub offset: usize,
    pub length: usize,
}

impl KeySpan {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

#[inline]
fn is_delimiter(byte: u8) -> bool {
    byte == b'\n' || byte == b'\r'
}

/// In-memory key corpus: the raw file bytes plus the span of every key.
///
/// Records are separated by runs of LF and CR bytes, which never belong to a
/// key. The corpus is immutable once built, so every trial sees exactly the
/// same keys in the same order.
#[derive(Debug, Clone, Default)]
pub struct KeyCorpus {
    bytes: Vec<u8>,
    spans: Vec<KeySpan>,
}

impl KeyCorpus {
    /// Splits `bytes` into exactly `expected` keys.
    ///
    /// Before each key a run of delimiters is skipped; the key then extends to
    /// the next delimiter or the end of the buffer. Bytes after the last
    /// requested key are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::CorpusTooShort`] when the buffer runs out before
    /// `expected` keys have been found.
    pub fn parse(bytes: Vec<u8>, expected: usize) -> Result<Self> {
        // A key takes at least one byte, so the buffer bounds the key count.
        let mut spans = Vec::with_capacity(expected.min(bytes.len() / 2 + 1));
        let mut position = 0;
        while spans.len() < expected {
            while position < bytes.len() && is_delimiter(bytes[position]) {
                position += 1;
            }
            if position == bytes.len() {
                return Err(BenchError::CorpusTooShort {
                    expected,
                    found: spans.len(),
                });
            }
            let offset = position;
            while position < bytes.len() && !is_delimiter(bytes[position]) {
                position += 1;
            }
            spans.push(KeySpan {
                offset,
                length: position - offset,
            });
        }
        Ok(Self { bytes, spans })
    }

    /// Reads the whole file at `path` and splits it into `expected` keys.
    ///
    /// When `expected` is `None` every record of the file is taken.
    pub fn read(path: impl AsRef<Path>, expected: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| BenchError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let expected = expected.unwrap_or_else(|| Self::count_keys(&bytes));
        Self::parse(bytes, expected)
    }

    /// Number of records [`parse`](Self::parse) can extract from `bytes`.
    pub fn count_keys(bytes: &[u8]) -> usize {
        bytes
            .split(|&b| is_delimiter(b))
            .filter(|record| !record.is_empty())
            .count()
    }

    /// Builds a corpus from explicit keys. Empty keys are kept as is.
    pub fn from_keys<K: AsRef<[u8]>>(keys: impl IntoIterator<Item = K>) -> Self {
        let mut bytes = Vec::new();
        let mut spans = Vec::new();
        for key in keys {
            let key = key.as_ref();
            spans.push(KeySpan {
                offset: bytes.len(),
                length: key.len(),
            });
            bytes.extend_from_slice(key);
            bytes.push(b'\n');
        }
        Self { bytes, spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Returns the `index`-th key, or `None` when out of range.
    pub fn key(&self, index: usize) -> Option<&[u8]> {
        self.spans
            .get(index)
            .map(|span| &self.bytes[span.offset..span.end()])
    }

    pub fn span(&self, index: usize) -> Option<KeySpan> {
        self.spans.get(index).copied()
    }

    pub fn spans(&self) -> &[KeySpan] {
        &self.spans
    }

    /// Iterates over the keys in corpus order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + '_ {
        self.spans
            .iter()
            .map(|span| &self.bytes[span.offset..span.end()])
    }

    /// The underlying buffer, delimiters included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
