//! The reserved hole of a detached signature.
//!
//! A `/ByteRange` is the array `[start0 len0 start1 len1]`. The digest covers
//! the two spans it describes, and the gap between them holds exactly one
//! hex string token, `<...>`, which is the `/Contents` of the signature
//! dictionary.

use std::ops::Range;

use lopdf::{Document, Object};
use thiserror::Error;

use crate::ExactArrayOrNone;

/// Why a hole descriptor does not bound its placeholder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ByteRangeMismatch {
    #[error("/ByteRange is not an array of four integers")]
    NotFourIntegers,
    #[error("negative value in /ByteRange {0:?}")]
    NegativeValue([i64; 4]),
    #[error("file is not signed from the beginning (start0 is {0})")]
    NonZeroStart(i64),
    #[error("offsets overlap: second range starts at {start1}, before the first range ends at {end0}")]
    OffsetsOverlap { end0: i64, start1: i64 },
    #[error("hole outside file bounds: {start}..{end} in a file of {file_len} bytes")]
    HoleOutOfBounds {
        start: i64,
        end: i64,
        file_len: usize,
    },
    #[error("second range ends at {end}, past the end of the file ({file_len} bytes)")]
    RangePastEnd { end: i64, file_len: usize },
    #[error("hole of {0} bytes can not hold a delimited hex string")]
    HoleTooSmall(usize),
    #[error("opening '<' expected at offset {expected}, found {found:?}")]
    OpeningDelimiter {
        expected: usize,
        found: Option<usize>,
    },
    #[error("closing '>' expected at offset {expected}, found {found:?}")]
    ClosingDelimiter {
        expected: usize,
        found: Option<usize>,
    },
    #[error("hole contains more than one delimited token")]
    MultipleTokens,
    #[error("non-hex character {byte:#04x} at offset {offset}")]
    NonHex { offset: usize, byte: u8 },
    #[error("odd number of hex digits in the hole: {0}")]
    OddLength(usize),
    #[error("length mismatch: hole holds {actual} hex digits, /Contents needs {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("bytes in the hole do not decode to /Contents")]
    ContentMismatch,
}

/// The four integers of a `/ByteRange` array.
///
/// Values are kept signed so that a negative entry read from a document can
/// be reported instead of silently wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start0: i64,
    pub len0: i64,
    pub start1: i64,
    pub len1: i64,
}

impl ByteRange {
    pub fn new(start0: i64, len0: i64, start1: i64, len1: i64) -> Self {
        Self {
            start0,
            len0,
            start1,
            len1,
        }
    }

    pub fn from_array([start0, len0, start1, len1]: [i64; 4]) -> Self {
        Self::new(start0, len0, start1, len1)
    }

    pub fn to_array(&self) -> [i64; 4] {
        [self.start0, self.len0, self.start1, self.len1]
    }

    /// Reads a `/ByteRange` value, following indirect references.
    pub fn from_object(doc: &Document, obj: &Object) -> Result<Self, ByteRangeMismatch> {
        let (_, array) = doc
            .dereference(obj)
            .map_err(|_| ByteRangeMismatch::NotFourIntegers)?;
        let values = array
            .as_array()
            .map_err(|_| ByteRangeMismatch::NotFourIntegers)?
            .iter()
            .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_i64()))
            .collect::<lopdf::Result<ExactArrayOrNone<i64, 4>>>()
            .map_err(|_| ByteRangeMismatch::NotFourIntegers)?
            .0
            .ok_or(ByteRangeMismatch::NotFourIntegers)?;
        Ok(Self::from_array(values))
    }

    /// The byte offsets of the reserved hole, `start0 + len0 .. start1`, or
    /// `None` if the first range ends past `i64::MAX`.
    pub fn hole(&self) -> Option<Range<i64>> {
        Some(self.start0.checked_add(self.len0)?..self.start1)
    }

    /// Offset one past the last signed byte, or `None` on overflow.
    pub fn coverage_end(&self) -> Option<i64> {
        self.start1.checked_add(self.len1)
    }

    /// Checks the numeric invariants against a file of `file_len` bytes and
    /// returns the hole as a usable range.
    pub fn check_bounds(&self, file_len: usize) -> Result<Range<usize>, ByteRangeMismatch> {
        let values = self.to_array();
        if values.iter().any(|&v| v < 0) {
            return Err(ByteRangeMismatch::NegativeValue(values));
        }
        if self.start0 != 0 {
            return Err(ByteRangeMismatch::NonZeroStart(self.start0));
        }

        let Some(hole) = self.hole() else {
            return Err(ByteRangeMismatch::HoleOutOfBounds {
                start: self.start0,
                end: self.start1,
                file_len,
            });
        };
        if hole.end < hole.start {
            return Err(ByteRangeMismatch::OffsetsOverlap {
                end0: hole.start,
                start1: hole.end,
            });
        }
        if hole.end as u64 > file_len as u64 {
            return Err(ByteRangeMismatch::HoleOutOfBounds {
                start: hole.start,
                end: hole.end,
                file_len,
            });
        }
        let end = self.coverage_end().ok_or(ByteRangeMismatch::RangePastEnd {
            end: i64::MAX,
            file_len,
        })?;
        if end as u64 > file_len as u64 {
            return Err(ByteRangeMismatch::RangePastEnd { end, file_len });
        }

        Ok(hole.start as usize..hole.end as usize)
    }

    /// The two signed spans of `bytes`, if the range is within bounds.
    pub fn signed_spans<'a>(&self, bytes: &'a [u8]) -> Option<[&'a [u8]; 2]> {
        let hole = self.check_bounds(bytes.len()).ok()?;
        let end = self.coverage_end()? as usize;
        Some([&bytes[..hole.start], &bytes[hole.end..end]])
    }
}

/// Returns the bytes between the hole delimiters, if the hole starts with `<`
/// and ends with `>`. Used for facts even when the full check fails.
pub(crate) fn hole_token<'a>(range: &ByteRange, bytes: &'a [u8]) -> Option<&'a [u8]> {
    let hole = range.check_bounds(bytes.len()).ok()?;
    let hole = &bytes[hole];
    if hole.len() >= 2 && hole[0] == b'<' && hole[hole.len() - 1] == b'>' {
        Some(&hole[1..hole.len() - 1])
    } else {
        None
    }
}

/// Proves that `range` bounds exactly the hex token holding `contents`.
///
/// `contents` is the decoded value of the `/Contents` string.
pub fn verify_byte_range_hole(
    range: &ByteRange,
    contents: &[u8],
    bytes: &[u8],
) -> Result<(), ByteRangeMismatch> {
    let hole = range.check_bounds(bytes.len())?;
    let (start, end) = (hole.start, hole.end);
    let hole = &bytes[hole];
    if hole.len() < 2 {
        return Err(ByteRangeMismatch::HoleTooSmall(hole.len()));
    }

    if hole[0] != b'<' {
        return Err(ByteRangeMismatch::OpeningDelimiter {
            expected: start,
            found: hole.iter().position(|&b| b == b'<').map(|p| start + p),
        });
    }
    if hole[hole.len() - 1] != b'>' {
        return Err(ByteRangeMismatch::ClosingDelimiter {
            expected: end - 1,
            found: hole.iter().rposition(|&b| b == b'>').map(|p| start + p),
        });
    }

    let digits = &hole[1..hole.len() - 1];
    if digits.iter().any(|&b| b == b'<' || b == b'>') {
        return Err(ByteRangeMismatch::MultipleTokens);
    }
    if let Some(pos) = digits.iter().position(|b| !b.is_ascii_hexdigit()) {
        return Err(ByteRangeMismatch::NonHex {
            offset: start + 1 + pos,
            byte: digits[pos],
        });
    }
    if digits.len() % 2 != 0 {
        return Err(ByteRangeMismatch::OddLength(digits.len()));
    }
    if digits.len() != contents.len() * 2 {
        return Err(ByteRangeMismatch::LengthMismatch {
            expected: contents.len() * 2,
            actual: digits.len(),
        });
    }

    if !digits
        .chunks_exact(2)
        .map(|pair| hex_value(pair[0]) << 4 | hex_value(pair[1]))
        .eq(contents.iter().copied())
    {
        return Err(ByteRangeMismatch::ContentMismatch);
    }

    Ok(())
}

fn hex_value(digit: u8) -> u8 {
    (digit as char).to_digit(16).unwrap_or(0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A 1500 byte file with a 200 byte hole at offset 1000.
    fn sample() -> (Vec<u8>, Vec<u8>) {
        let mut bytes = vec![b'a'; 1000];
        bytes.push(b'<');
        bytes.extend(std::iter::repeat(b'0').take(198));
        bytes.push(b'>');
        bytes.extend(std::iter::repeat(b'z').take(300));
        assert_eq!(bytes.len(), 1500);
        (bytes, vec![0; 99])
    }

    #[test]
    fn test_valid_hole() {
        let (bytes, contents) = sample();
        let range = ByteRange::new(0, 1000, 1200, 300);
        assert_eq!(range.check_bounds(bytes.len()), Ok(1000..1200));
        assert_eq!(verify_byte_range_hole(&range, &contents, &bytes), Ok(()));
    }

    #[test]
    fn test_overlap_and_shifted_end() {
        let (bytes, contents) = sample();

        let overlapping = ByteRange::new(0, 1000, 990, 300);
        let err = verify_byte_range_hole(&overlapping, &contents, &bytes).unwrap_err();
        assert!(matches!(err, ByteRangeMismatch::OffsetsOverlap { .. }));
        assert!(err.to_string().contains("offsets overlap"));

        // Moving the end of the hole into the digits leaves it without its '>'.
        let shifted = ByteRange::new(0, 1000, 1190, 300);
        assert_eq!(
            verify_byte_range_hole(&shifted, &contents, &bytes),
            Err(ByteRangeMismatch::ClosingDelimiter {
                expected: 1189,
                found: None
            })
        );
    }

    #[test]
    fn test_one_byte_shift_of_start1() {
        let (bytes, contents) = sample();
        for start1 in [1199, 1201] {
            let range = ByteRange::new(0, 1000, start1, 299);
            assert!(verify_byte_range_hole(&range, &contents, &bytes).is_err());
        }
    }

    #[test]
    fn test_delimiter_mutations() {
        let (bytes, contents) = sample();
        let range = ByteRange::new(0, 1000, 1200, 300);

        let mut opening = bytes.clone();
        opening[1000] = b'0';
        assert!(matches!(
            verify_byte_range_hole(&range, &contents, &opening),
            Err(ByteRangeMismatch::OpeningDelimiter {
                expected: 1000,
                ..
            })
        ));

        let mut closing = bytes.clone();
        closing[1199] = b'0';
        assert!(matches!(
            verify_byte_range_hole(&range, &contents, &closing),
            Err(ByteRangeMismatch::ClosingDelimiter { .. })
        ));

        let mut extra = bytes.clone();
        extra[1100] = b'>';
        assert_eq!(
            verify_byte_range_hole(&range, &contents, &extra),
            Err(ByteRangeMismatch::MultipleTokens)
        );

        let mut non_hex = bytes;
        non_hex[1050] = b'g';
        assert_eq!(
            verify_byte_range_hole(&range, &contents, &non_hex),
            Err(ByteRangeMismatch::NonHex {
                offset: 1050,
                byte: b'g'
            })
        );
    }

    #[test]
    fn test_bounds() {
        let (bytes, contents) = sample();

        let past_end = ByteRange::new(0, 1000, 1200, 301);
        assert!(matches!(
            verify_byte_range_hole(&past_end, &contents, &bytes),
            Err(ByteRangeMismatch::RangePastEnd { end: 1501, .. })
        ));

        let outside = ByteRange::new(0, 1000, 1600, 0);
        let err = verify_byte_range_hole(&outside, &contents, &bytes).unwrap_err();
        assert!(err.to_string().contains("hole outside file bounds"));

        let not_from_start = ByteRange::new(1, 999, 1200, 300);
        assert_eq!(
            verify_byte_range_hole(&not_from_start, &contents, &bytes),
            Err(ByteRangeMismatch::NonZeroStart(1))
        );

        let negative = ByteRange::new(0, -1, 1200, 300);
        assert!(matches!(
            negative.check_bounds(bytes.len()),
            Err(ByteRangeMismatch::NegativeValue(_))
        ));
    }

    #[test]
    fn test_huge_lengths_are_reported() {
        let (bytes, contents) = sample();

        let huge_len1 = ByteRange::new(0, 10, 20, i64::MAX);
        assert!(matches!(
            huge_len1.check_bounds(100),
            Err(ByteRangeMismatch::RangePastEnd { .. })
        ));
        assert!(huge_len1.signed_spans(&bytes).is_none());
        assert!(verify_byte_range_hole(&huge_len1, &contents, &bytes).is_err());

        let huge_len0 = ByteRange::new(0, i64::MAX, 20, 10);
        assert!(matches!(
            huge_len0.check_bounds(100),
            Err(ByteRangeMismatch::HoleOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_contents_must_match_the_hole() {
        let (bytes, _) = sample();
        let range = ByteRange::new(0, 1000, 1200, 300);

        assert_eq!(
            verify_byte_range_hole(&range, &[0; 100], &bytes),
            Err(ByteRangeMismatch::LengthMismatch {
                expected: 200,
                actual: 198
            })
        );

        let mut other = vec![0; 99];
        other[0] = 0x30;
        assert_eq!(
            verify_byte_range_hole(&range, &other, &bytes),
            Err(ByteRangeMismatch::ContentMismatch)
        );
    }

    #[test]
    fn test_signed_spans() {
        let (bytes, _) = sample();
        let range = ByteRange::new(0, 1000, 1200, 300);
        let [first, second] = range.signed_spans(&bytes).unwrap();
        assert_eq!(first.len(), 1000);
        assert_eq!(second.len(), 300);
        assert!(second.iter().all(|&b| b == b'z'));
        assert_eq!(hole_token(&range, &bytes).map(<[u8]>::len), Some(198));
    }
}
