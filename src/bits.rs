use std::io::{Error, ErrorKind, Result, Write};

const WORD_BITS: u64 = u64::BITS as u64;
const WORDS_PER_BLOCK: usize = 8;

/// Number of bits needed to represent `value` (zero needs zero bits).
pub fn bit_width(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

/// Number of 64-bit words needed to hold `bits` bits.
pub fn words_for_bits(bits: u64) -> u64 {
    bits.div_ceil(WORD_BITS)
}

pub(crate) fn write_words<W: Write>(writer: &mut W, words: &[u64]) -> Result<()> {
    for word in words {
        writer.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

pub(crate) fn words_from_bytes(data: &[u8]) -> Result<Vec<u64>> {
    if data.len() % 8 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("section length {} is not a multiple of 8", data.len()),
        ));
    }
    Ok(data
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

/// Fixed-width packed array of unsigned integers.
///
/// Every element occupies exactly `width` bits (0..=64) in a contiguous run of
/// little-endian words; an element may straddle two words. A width of zero
/// stores nothing and reads back zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactArray {
    width: u32,
    len: u64,
    words: Vec<u64>,
}

impl CompactArray {
    /// Creates a zero-filled array of `len` elements of `width` bits each.
    pub fn new(width: u32, len: u64) -> Self {
        assert!(width <= u64::BITS, "width {width} exceeds 64 bits");
        let words = vec![0; words_for_bits(width as u64 * len) as usize];
        Self { width, len, words }
    }

    /// Packs `values` using the smallest width able to hold the largest one.
    pub fn from_values(values: &[u64]) -> Self {
        let max = values.iter().copied().max().unwrap_or(0);
        let mut array = Self::new(bit_width(max), values.len() as u64);
        for (index, &value) in values.iter().enumerate() {
            array.set(index as u64, value);
        }
        array
    }

    /// Rebuilds an array from its serialized words.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidData` when the width is larger than 64 bits or
    /// the number of words does not match `width * len`.
    pub fn from_words(width: u32, len: u64, words: Vec<u64>) -> Result<Self> {
        if width > u64::BITS {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("invalid element width: {}", width),
            ));
        }
        let expected = (width as u64)
            .checked_mul(len)
            .map(words_for_bits)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "compact array too large"))?;
        if words.len() as u64 != expected {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "compact array expects {} words, found {}",
                    expected,
                    words.len()
                ),
            ));
        }
        Ok(Self { width, len, words })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn num_bits(&self) -> u64 {
        self.words.len() as u64 * WORD_BITS
    }

    fn mask(&self) -> u64 {
        if self.width == u64::BITS {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Returns the element at `index`. The caller keeps `index < len`.
    #[inline]
    pub fn get(&self, index: u64) -> u64 {
        debug_assert!(index < self.len);
        if self.width == 0 {
            return 0;
        }
        let bit = index * self.width as u64;
        let word = (bit / WORD_BITS) as usize;
        let shift = (bit % WORD_BITS) as u32;
        let mask = self.mask();
        if shift + self.width <= u64::BITS {
            (self.words[word] >> shift) & mask
        } else {
            ((self.words[word] >> shift) | (self.words[word + 1] << (u64::BITS - shift))) & mask
        }
    }

    /// Stores `value` at `index`, truncated to the element width.
    pub fn set(&mut self, index: u64, value: u64) {
        assert!(index < self.len, "index {index} out of bounds {}", self.len);
        if self.width == 0 {
            return;
        }
        let mask = self.mask();
        let value = value & mask;
        let bit = index * self.width as u64;
        let word = (bit / WORD_BITS) as usize;
        let shift = (bit % WORD_BITS) as u32;
        self.words[word] = (self.words[word] & !(mask << shift)) | (value << shift);
        if shift + self.width > u64::BITS {
            let spill = u64::BITS - shift;
            self.words[word + 1] = (self.words[word + 1] & !(mask >> spill)) | (value >> spill);
        }
    }
}

/// Bit vector with a constant-time rank directory.
///
/// The directory stores, for every block of 512 bits, the number of ones that
/// precede it, so [`rank`](Self::rank) costs one directory read plus at most
/// eight popcounts. Only the raw words are serialized; the directory is
/// recomputed on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankBitVector {
    len: u64,
    words: Vec<u64>,
    blocks: Vec<u64>,
}

impl RankBitVector {
    /// Builds a vector of `len` bits with ones at the given positions.
    pub fn from_ones(len: u64, ones: impl IntoIterator<Item = u64>) -> Self {
        let mut words = vec![0u64; words_for_bits(len) as usize];
        for position in ones {
            assert!(position < len, "bit {position} out of bounds {len}");
            words[(position / WORD_BITS) as usize] |= 1 << (position % WORD_BITS);
        }
        Self::with_directory(len, words)
    }

    /// Rebuilds a vector from its serialized words.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidData` when the word count does not match
    /// `len`, or when bits past `len` are set.
    pub fn from_words(len: u64, words: Vec<u64>) -> Result<Self> {
        if words.len() as u64 != words_for_bits(len) {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "bit vector of {} bits expects {} words, found {}",
                    len,
                    words_for_bits(len),
                    words.len()
                ),
            ));
        }
        let tail = len % WORD_BITS;
        if tail != 0 && words[words.len() - 1] >> tail != 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "bit vector has bits set past its length",
            ));
        }
        Ok(Self::with_directory(len, words))
    }

    fn with_directory(len: u64, words: Vec<u64>) -> Self {
        let mut blocks = Vec::with_capacity(words.len() / WORDS_PER_BLOCK + 1);
        let mut ones = 0u64;
        for (index, word) in words.iter().enumerate() {
            if index % WORDS_PER_BLOCK == 0 {
                blocks.push(ones);
            }
            ones += word.count_ones() as u64;
        }
        if words.len() % WORDS_PER_BLOCK == 0 {
            blocks.push(ones);
        }
        Self { len, words, blocks }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn count_ones(&self) -> u64 {
        self.rank(self.len)
    }

    /// Size in bits including the rank directory.
    pub fn num_bits(&self) -> u64 {
        (self.words.len() + self.blocks.len()) as u64 * WORD_BITS
    }

    #[inline]
    pub fn get(&self, position: u64) -> bool {
        debug_assert!(position < self.len);
        (self.words[(position / WORD_BITS) as usize] >> (position % WORD_BITS)) & 1 == 1
    }

    /// Number of ones in positions `0..position`, for `position <= len`.
    #[inline]
    pub fn rank(&self, position: u64) -> u64 {
        debug_assert!(position <= self.len);
        let word = (position / WORD_BITS) as usize;
        let block = word / WORDS_PER_BLOCK;
        let mut rank = self.blocks[block];
        for w in &self.words[block * WORDS_PER_BLOCK..word] {
            rank += w.count_ones() as u64;
        }
        let offset = position % WORD_BITS;
        if offset != 0 {
            rank += (self.words[word] & ((1u64 << offset) - 1)).count_ones() as u64;
        }
        rank
    }
}
