//! Locates the tail of a revision: the last `%%EOF`, the `startxref` pointer
//! before it, and the cross-reference section the pointer names.

use lazy_static::lazy_static;
use regex::bytes::Regex;
use thiserror::Error;

const EOF_MARKER: &[u8] = b"%%EOF";
const STARTXREF: &[u8] = b"startxref";
const ENDOBJ: &[u8] = b"endobj";
const PROBE_LEN: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedTail {
    #[error("no %%EOF marker")]
    MissingEof,
    #[error("no startxref keyword before the last %%EOF")]
    MissingStartxref,
    #[error("startxref is not followed by an offset")]
    MissingOffset,
    #[error("startxref offset {0:?} is not a number")]
    NonNumericOffset(String),
    #[error("startxref offset {offset} is outside the file ({file_len} bytes)")]
    OffsetOutOfBounds { offset: i64, file_len: usize },
    #[error("{0} unexpected byte(s) after %%EOF")]
    TrailingBytes(usize),
    #[error("startxref offset {0} is not positive")]
    NonPositiveOffset(i64),
}

/// Form of the cross-reference section a `startxref` points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefKind {
    /// Classic `xref` table.
    Table,
    /// Cross-reference stream, an object with `/Type /XRef`.
    Stream,
}

impl XrefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            XrefKind::Table => "table",
            XrefKind::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailInfo {
    /// Offset written after `startxref`.
    pub declared_offset: usize,
    /// Start of the last cross-reference section actually present before
    /// `startxref`.
    pub actual_offset: Option<usize>,
    /// What the declared offset points to, if it is a cross-reference section.
    pub kind: Option<XrefKind>,
    /// Offset of the last `%%EOF` marker.
    pub eof_offset: usize,
    /// The declared offset points to a table or stream.
    pub ok: bool,
}

impl TailInfo {
    /// True when the pointer is valid and names the last section in the file.
    pub fn is_consistent(&self) -> bool {
        self.ok && self.actual_offset == Some(self.declared_offset)
    }
}

lazy_static! {
    static ref OFFSET_REGEX: Regex = Regex::new(r"(?-u)^[\r\n\t ]*([^\r\n\t ]*)").unwrap();
    static ref TABLE_PROBE: Regex = Regex::new(r"(?-u)^xref[\r\n\t ]").unwrap();
    static ref STREAM_PROBE: Regex =
        Regex::new(r"(?s-u)^\d+[\r\n\t ]+\d+[\r\n\t ]+obj[\r\n\t ]*<<.*?/Type[\r\n\t ]*/XRef\b").unwrap();
    static ref TABLE_SCAN: Regex = Regex::new(r"(?m-u)^xref[\r\n\t ]").unwrap();
    static ref OBJECT_SCAN: Regex = Regex::new(r"(?m-u)^\d+[\r\n\t ]+\d+[\r\n\t ]+obj\b").unwrap();
}

/// Finds and checks the trailing pointer of a revision.
///
/// In strict mode the pointer must be positive and nothing but line
/// terminators may follow the `%%EOF` marker.
pub fn locate_tail(bytes: &[u8], strict: bool) -> Result<TailInfo, MalformedTail> {
    let eof_offset = rfind(bytes, EOF_MARKER).ok_or(MalformedTail::MissingEof)?;
    let startxref = rfind(&bytes[..eof_offset], STARTXREF).ok_or(MalformedTail::MissingStartxref)?;

    let after_keyword = &bytes[startxref + STARTXREF.len()..eof_offset];
    let token = OFFSET_REGEX
        .captures(after_keyword)
        .and_then(|c| c.get(1))
        .map(|m| m.as_bytes())
        .filter(|t| !t.is_empty())
        .ok_or(MalformedTail::MissingOffset)?;
    let token = String::from_utf8_lossy(token).into_owned();
    let declared: i64 = token
        .parse()
        .map_err(|_| MalformedTail::NonNumericOffset(token.clone()))?;

    if strict {
        let trailing = &bytes[eof_offset + EOF_MARKER.len()..];
        let stray = trailing
            .iter()
            .filter(|&&b| b != b'\r' && b != b'\n')
            .count();
        if stray > 0 {
            return Err(MalformedTail::TrailingBytes(stray));
        }
        if declared <= 0 {
            return Err(MalformedTail::NonPositiveOffset(declared));
        }
    }

    if declared < 0 || declared as u64 >= startxref as u64 {
        return Err(MalformedTail::OffsetOutOfBounds {
            offset: declared,
            file_len: bytes.len(),
        });
    }
    let declared_offset = declared as usize;

    let probe = object_window(&bytes[..startxref], declared_offset);
    let kind = if TABLE_PROBE.is_match(probe) {
        Some(XrefKind::Table)
    } else if STREAM_PROBE.is_match(probe) {
        Some(XrefKind::Stream)
    } else {
        None
    };

    let info = TailInfo {
        declared_offset,
        actual_offset: last_xref_section(&bytes[..startxref]),
        kind,
        eof_offset,
        ok: kind.is_some(),
    };
    log::debug!("tail located: {info:?}");
    Ok(info)
}

/// Offset of the last `xref` table or cross-reference stream object.
fn last_xref_section(bytes: &[u8]) -> Option<usize> {
    let table = TABLE_SCAN.find_iter(bytes).last().map(|m| m.start());
    let headers: Vec<usize> = OBJECT_SCAN
        .find_iter(bytes)
        .map(|m| m.start())
        .filter(|&start| Some(start) > table)
        .collect();
    let stream = headers
        .into_iter()
        .rev()
        .find(|&start| STREAM_PROBE.is_match(object_window(bytes, start)));
    table.max(stream)
}

/// The bytes from `start` up to the first `endobj`, capped at the probe length.
fn object_window(bytes: &[u8], start: usize) -> &[u8] {
    let end = (start + PROBE_LEN).min(bytes.len());
    let window = &bytes[start..end];
    let object_end = window
        .windows(ENDOBJ.len())
        .position(|w| w == ENDOBJ)
        .unwrap_or(window.len());
    &window[..object_end]
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}
