//! Writing an incremental update and checking one against its base.
//!
//! The update is serialized by [`IncrementalDocument`] after the last byte of
//! the base revision, with a cross-reference section of the same kind as the
//! base one. A signature dictionary is written with a `/ByteRange` of
//! fixed-width dummy numbers and a zero-filled `/Contents` reservation. Both
//! are found again in the output and patched without moving any byte.

use std::collections::HashSet;
use std::ops::Range;

use lopdf::{xref::XrefEntry, Dictionary, Document, IncrementalDocument, Object, ObjectId, StringFormat};

use crate::byte_range::ByteRange;
use crate::form::FormTree;
use crate::{Error, FormField, Result};

/// Width of each patched `/ByteRange` number.
const BYTE_RANGE_FIELD: usize = 10;
/// Dummy `/ByteRange` entry, as wide as a patched one.
const BYTE_RANGE_DUMMY: i64 = 9_999_999_999;
const BYTE_RANGE_PREFIX: &[u8] = b"/ByteRange[0 ";
const CONTENTS_PREFIX: &[u8] = b"/Contents<";

/// Trailer entries of the base that do not describe the new section.
const STALE_TRAILER_KEYS: [&[u8]; 3] = [b"DecodeParms", b"Filter", b"XRefStm"];

struct Placeholder {
    id: ObjectId,
    capacity: usize,
}

/// Objects to append on top of a base revision.
pub(crate) struct IncrementalUpdate {
    inner: IncrementalDocument,
    placeholder: Option<Placeholder>,
}

impl IncrementalUpdate {
    pub(crate) fn new(base: &[u8], doc: &Document) -> Self {
        let mut inner = IncrementalDocument::create_from(base.to_vec(), doc.clone());
        inner.new_document.version = doc.version.clone();
        for key in STALE_TRAILER_KEYS {
            inner.new_document.trailer.remove(key);
        }
        Self {
            inner,
            placeholder: None,
        }
    }

    pub(crate) fn add_object(&mut self, object: impl Into<Object>) -> ObjectId {
        self.inner.new_document.add_object(object.into())
    }

    /// The current value of `id`: the updated copy if there is one.
    pub(crate) fn object(&self, id: ObjectId) -> Result<&Object> {
        match self.inner.new_document.objects.get(&id) {
            Some(obj) => Ok(obj),
            None => Ok(self.inner.get_prev_documents().get_object(id)?),
        }
    }

    pub(crate) fn dictionary(&self, id: ObjectId) -> Result<&Dictionary> {
        Ok(self.object(id)?.as_dict()?)
    }

    /// Copies `id` into the update on first use and returns the copy.
    pub(crate) fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object> {
        self.inner.opt_clone_object_to_new_document(id)?;
        self.inner
            .new_document
            .objects
            .get_mut(&id)
            .ok_or_else(|| Error::Resolution(format!("object {} {}", id.0, id.1)))
    }

    pub(crate) fn dictionary_mut(&mut self, id: ObjectId) -> Result<&mut Dictionary> {
        Ok(self.object_mut(id)?.as_dict_mut()?)
    }

    /// The object referenced by `key` of the dictionary `holder`.
    ///
    /// An inline value is moved into a new object of its own and a missing
    /// entry is created from `default`, so the caller can always edit the
    /// value through its id.
    pub(crate) fn indirect_entry(
        &mut self,
        holder: ObjectId,
        key: &[u8],
        default: impl FnOnce() -> Object,
    ) -> Result<ObjectId> {
        let current = self.dictionary(holder)?.get(key).ok().cloned();
        let value = match current {
            Some(Object::Reference(id)) => return Ok(id),
            Some(inline) => inline,
            None => default(),
        };
        let id = self.add_object(value);
        self.dictionary_mut(holder)?.set(key.to_vec(), id);
        Ok(id)
    }

    /// Adds the signature dictionary with placeholder `/ByteRange` and
    /// `/Contents` entries, reserving `capacity` bytes for the signature.
    pub(crate) fn add_signature_dictionary(
        &mut self,
        mut dict: Dictionary,
        capacity: usize,
    ) -> ObjectId {
        dict.set(
            "ByteRange",
            vec![
                Object::Integer(0),
                Object::Integer(BYTE_RANGE_DUMMY),
                Object::Integer(BYTE_RANGE_DUMMY),
                Object::Integer(BYTE_RANGE_DUMMY),
            ],
        );
        dict.set(
            "Contents",
            Object::String(vec![0; capacity], StringFormat::Hexadecimal),
        );
        let id = self.add_object(dict);
        self.placeholder = Some(Placeholder { id, capacity });
        id
    }

    /// Serializes the update after the base bytes.
    pub(crate) fn prepare(mut self) -> Result<PreparedRevision> {
        let base_len = self.inner.get_prev_documents_bytes().len();
        let objects = self.inner.new_document.objects.len();
        let mut out = Vec::with_capacity(base_len + 4096);
        self.inner.save_to(&mut out)?;

        let signature = match &self.placeholder {
            Some(placeholder) => Some(reserve_signature(&mut out, base_len, placeholder)?),
            None => None,
        };

        log::debug!(
            "prepared increment of {objects} objects, {} bytes appended",
            out.len() - base_len
        );
        Ok(PreparedRevision {
            bytes: out,
            signature,
        })
    }
}

struct SignatureSlot {
    hole: Range<usize>,
    capacity: usize,
}

/// Finds the placeholder entries of the signature dictionary in the appended
/// bytes and patches `/ByteRange` with the final offsets.
fn reserve_signature(
    out: &mut [u8],
    base_len: usize,
    placeholder: &Placeholder,
) -> Result<SignatureSlot> {
    let (id, generation) = placeholder.id;
    let missing = |what: &str| {
        Error::Resolution(format!("{what} of signature dictionary {id} {generation}"))
    };

    let header = format!("\n{id} {generation} obj\n");
    let start = find(&out[base_len..], header.as_bytes())
        .map(|p| base_len + p + header.len())
        .ok_or_else(|| missing("object header"))?;
    let end = find(&out[start..], b"endobj")
        .map(|p| start + p)
        .ok_or_else(|| missing("end"))?;
    let object = &out[start..end];

    let field = find(object, BYTE_RANGE_PREFIX)
        .map(|p| start + p + BYTE_RANGE_PREFIX.len())
        .ok_or_else(|| missing("/ByteRange"))?;
    let hole_start = find(object, CONTENTS_PREFIX)
        .map(|p| start + p + CONTENTS_PREFIX.len() - 1)
        .ok_or_else(|| missing("/Contents"))?;
    let hole = hole_start..hole_start + placeholder.capacity * 2 + 2;
    if out.get(hole.end - 1) != Some(&b'>') {
        return Err(missing("closing '>' of /Contents"));
    }

    let range = ByteRange::new(
        0,
        hole.start as i64,
        hole.end as i64,
        (out.len() - hole.end) as i64,
    );
    patch_byte_range(out, field, &range)?;
    Ok(SignatureSlot {
        hole,
        capacity: placeholder.capacity,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn patch_byte_range(out: &mut [u8], at: usize, range: &ByteRange) -> Result<()> {
    let text = format!(
        "{:<w$} {:<w$} {:<w$}",
        range.len0,
        range.start1,
        range.len1,
        w = BYTE_RANGE_FIELD
    );
    if text.len() != 3 * BYTE_RANGE_FIELD + 2 {
        return Err(Error::PlaceholderOverflow {
            needed: text.len(),
            capacity: 3 * BYTE_RANGE_FIELD + 2,
        });
    }
    out[at..at + text.len()].copy_from_slice(text.as_bytes());
    Ok(())
}

/// A serialized revision whose signature, if any, is still zero-filled.
pub(crate) struct PreparedRevision {
    bytes: Vec<u8>,
    signature: Option<SignatureSlot>,
}

impl PreparedRevision {
    #[cfg(test)]
    pub(crate) fn byte_range(&self) -> Option<ByteRange> {
        self.signature.as_ref().map(|s| {
            ByteRange::new(
                0,
                s.hole.start as i64,
                s.hole.end as i64,
                (self.bytes.len() - s.hole.end) as i64,
            )
        })
    }

    /// The bytes the signature must cover.
    pub(crate) fn signed_spans(&self) -> Option<[&[u8]; 2]> {
        let slot = self.signature.as_ref()?;
        Some([&self.bytes[..slot.hole.start], &self.bytes[slot.hole.end..]])
    }

    /// Writes `cms` at the front of the reservation. The rest stays zero.
    pub(crate) fn embed(mut self, cms: &[u8]) -> Result<Vec<u8>> {
        let Some(slot) = &self.signature else {
            return Ok(self.bytes);
        };
        if cms.len() > slot.capacity {
            return Err(Error::PlaceholderOverflow {
                needed: cms.len(),
                capacity: slot.capacity,
            });
        }
        let hex: String = cms.iter().map(|b| format!("{b:02X}")).collect();
        let start = slot.hole.start + 1;
        self.bytes[start..start + hex.len()].copy_from_slice(hex.as_bytes());
        Ok(self.bytes)
    }

    #[cfg(test)]
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Unfortunately, XrefEntry does not implement PartialEq.
struct XrefEntryComparer<'a>(&'a XrefEntry);

impl PartialEq for XrefEntryComparer<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self.0, other.0) {
            (
                XrefEntry::Normal { offset, generation },
                XrefEntry::Normal {
                    offset: other_offset,
                    generation: other_generation,
                },
            ) => offset == other_offset && generation == other_generation,
            (
                XrefEntry::Compressed { container, index },
                XrefEntry::Compressed {
                    container: other_container,
                    index: other_index,
                },
            ) => container == other_container && index == other_index,
            (XrefEntry::Free, XrefEntry::Free)
            | (XrefEntry::UnusableFree, XrefEntry::UnusableFree) => true,
            _ => false,
        }
    }
}

/// Checks that `next` is a pure append to `previous` and leaves every
/// existing signature alone. Returns the violations found.
pub(crate) fn check_increment(
    previous_bytes: &[u8],
    previous: &Document,
    next_bytes: &[u8],
    next: &Document,
) -> Vec<String> {
    let mut violations = Vec::new();

    if !next_bytes.starts_with(previous_bytes) {
        let first_difference = previous_bytes
            .iter()
            .zip(next_bytes)
            .position(|(a, b)| a != b)
            .unwrap_or(previous_bytes.len().min(next_bytes.len()));
        violations.push(format!(
            "new revision rewrites the previous one at byte {first_difference}"
        ));
    }

    let tree = FormTree::read(previous);
    for sig in tree.signatures().filter(|s| s.is_signed()) {
        let mut ids: HashSet<ObjectId> = sig.widgets().iter().copied().collect();
        ids.insert(sig.id());
        if let crate::form::SignatureValue::Indirect(value) = sig.value {
            ids.insert(value);
        }
        for id in ids {
            let before = previous.reference_table.entries.get(&id.0);
            let after = next.reference_table.entries.get(&id.0);
            let unchanged = match (before, after) {
                (Some(before), Some(after)) => {
                    XrefEntryComparer(before) == XrefEntryComparer(after)
                }
                _ => false,
            };
            if !unchanged {
                violations.push(format!(
                    "{}: object {} {} of an existing signature was rewritten",
                    sig.name(),
                    id.0,
                    id.1
                ));
            }
        }
    }

    let previous_fields = field_references(previous);
    let next_fields = field_references(next);
    for missing in previous_fields.difference(&next_fields) {
        violations.push(format!(
            "field {} {} was dropped from /AcroForm /Fields",
            missing.0, missing.1
        ));
    }

    violations
}

fn field_references(doc: &Document) -> HashSet<ObjectId> {
    crate::form::acro_form(doc)
        .and_then(|a| a.get(b"Fields").ok())
        .and_then(|f| doc.dereference(f).ok())
        .and_then(|(_, f)| f.as_array().ok())
        .map(|fields| fields.iter().filter_map(|f| f.as_reference().ok()).collect())
        .unwrap_or_default()
}
