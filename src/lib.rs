#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

#[cfg(feature = "openssl")]
pub mod openssl;

pub mod byte_range;
pub mod config;
pub mod facts;
pub mod field_validation;
pub mod form;
mod increment;
pub mod lifecycle;
pub mod signer;
pub mod tail;

pub use byte_range::{verify_byte_range_hole, ByteRange, ByteRangeMismatch};
pub use config::{Config, RowLayout, RowSpec, SignaturePlacement};
pub use facts::{collect_facts, diff, FactDiff, FactSet, Facts};
pub use field_validation::{validate_signature_field, FieldReport};
pub use form::{CertificationLevel, Field, FormField, LockAction, SigFieldLock};
pub use lifecycle::{Coordinator, LifecycleState, LifecycleViolation, Phase};
pub use signer::{CryptoContext, Pkcs7Signer};
pub use tail::{locate_tail, MalformedTail, TailInfo, XrefKind};

use lopdf::Document;
use regex::bytes::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed tail: {0}")]
    MalformedTail(#[from] MalformedTail),
    #[error("byte range mismatch: {0}")]
    ByteRangeMismatch(#[from] ByteRangeMismatch),
    #[error("structural violation: {}", .0.join("; "))]
    StructuralViolation(Vec<String>),
    #[error("lifecycle violation: {0}")]
    LifecycleViolation(#[from] LifecycleViolation),
    #[error("key material error")]
    KeyMaterial(#[source] anyhow::Error),
    #[error("can not resolve {0}")]
    Resolution(String),
    #[error("signature of {needed} bytes does not fit the {capacity} byte placeholder")]
    PlaceholderOverflow { needed: usize, capacity: usize },
    #[error("PDF parsing error")]
    Parsing(#[from] lopdf::Error),
    #[error("invalid configuration")]
    Config(#[from] serde_json::Error),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One saved state of a document: its raw bytes and the object graph parsed
/// from them.
pub struct Revision<'a> {
    doc: Document,
    bytes: &'a [u8],
}

impl<'a> Revision<'a> {
    /// Parses a revision from its complete byte representation.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let doc = Document::load_mem(bytes)?;
        Ok(Self { doc, bytes })
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

pub(crate) struct ExactArrayOrNone<T, const N: usize>(pub(crate) Option<[T; N]>);

impl<T, const N: usize> FromIterator<T> for ExactArrayOrNone<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut iter = iter.into_iter();
        let result = array_init::from_iter(&mut iter);
        let result = if iter.next().is_none() { result } else { None };
        ExactArrayOrNone(result)
    }
}

lazy_static::lazy_static! {
    static ref EOF_REGEX: Regex = Regex::new(r"(?:\r\n|\r|\n)%%EOF[ \t]*(?:\r\n|\r|\n)?$").unwrap();
}

/// Tests if the bytes end with the %%EOF marker.
pub(crate) fn pdf_ends_with_eof(pdf_bytes: &[u8]) -> bool {
    EOF_REGEX.is_match(pdf_bytes)
}

#[cfg(test)]
pub(crate) mod test_support;
