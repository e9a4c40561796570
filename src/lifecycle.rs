//! Certification and row signing as state transitions of a document.
//!
//! A document starts unsigned. It may be certified once, before any row is
//! signed, and then each row is signed at most once, every signature in its
//! own incremental revision. A row signature carries an `Include` lock naming
//! that row's fill-in fields, so it freezes nothing outside the row.
//!
//! Every transition is checked against the document before anything is
//! written, and the result is validated after signing. Nothing reaches the
//! output path unless every check passed.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tempfile::NamedTempFile;

use crate::facts::collect_facts;
use crate::form::{self, encode_text_string, CertificationLevel, Field, FormTree, SigFieldLock};
use crate::increment::{check_increment, IncrementalUpdate};
use crate::{Config, CryptoContext, Error, FormField, Result, Revision, SignaturePlacement};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleViolation {
    #[error("document is already certified")]
    AlreadyCertified,
    #[error("row {0} is already signed, certification must come first")]
    RowsAlreadySigned(usize),
    #[error("row {0} is already signed")]
    RowAlreadySigned(usize),
    #[error("certification level {0:?} forbids further signatures")]
    CertificationForbidsChanges(CertificationLevel),
    #[error("field {field} is locked by signature {signature}")]
    FieldLocked { field: String, signature: String },
}

/// Where a document is in its signing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unsigned,
    Certified,
    /// Number of signed rows.
    RowSigned(usize),
}

/// Lifecycle facts read back from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleState {
    /// Level of the certification, if there is one. An unreadable level
    /// counts as [`CertificationLevel::NoChanges`].
    pub certification: Option<CertificationLevel>,
    /// One-based indexes of the rows already signed.
    pub signed_rows: BTreeSet<usize>,
    /// Locks of the signed signature fields, by field name.
    pub locks: Vec<(String, SigFieldLock)>,
}

impl LifecycleState {
    pub fn inspect(doc: &Document, config: &Config) -> Self {
        let tree = FormTree::read(doc);
        let certification = form::certification(doc)
            .map(|c| c.level.unwrap_or(CertificationLevel::NoChanges));

        let signed_rows = config
            .rows
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                tree.find(&row.signature_field)
                    .and_then(Field::as_signature)
                    .is_some_and(|sig| sig.is_signed())
            })
            .map(|(i, _)| i + 1)
            .collect();

        let locks = tree
            .signatures()
            .filter(|sig| sig.is_signed())
            .filter_map(|sig| match &sig.lock {
                Some(Ok(lock)) => Some((sig.name().to_string(), lock.clone())),
                _ => None,
            })
            .collect();

        Self {
            certification,
            signed_rows,
            locks,
        }
    }

    pub fn phase(&self) -> Phase {
        if !self.signed_rows.is_empty() {
            Phase::RowSigned(self.signed_rows.len())
        } else if self.certification.is_some() {
            Phase::Certified
        } else {
            Phase::Unsigned
        }
    }

    /// The signature whose lock freezes `field`, if any.
    fn locked_by(&self, field: &str) -> Option<&str> {
        self.locks
            .iter()
            .find(|(_, lock)| lock.covers(field))
            .map(|(name, _)| name.as_str())
    }
}

/// Runs the lifecycle transitions with one configuration and one signer.
pub struct Coordinator {
    config: Config,
    crypto: CryptoContext,
}

impl Coordinator {
    pub fn new(config: Config, crypto: CryptoContext) -> Self {
        Self { config, crypto }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Certifies the document in `input` and writes the result to `output`.
    pub fn certify(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        level: CertificationLevel,
    ) -> Result<()> {
        let input = std::fs::read(input)?;
        let signed = self.certify_bytes(&input, level)?;
        persist(output.as_ref(), &signed)
    }

    /// Signs row `row` of the document in `input`, after filling in `values`,
    /// and writes the result to `output`.
    pub fn sign_row(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        row: usize,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let input = std::fs::read(input)?;
        let signed = self.sign_row_bytes(&input, row, values)?;
        persist(output.as_ref(), &signed)
    }

    pub fn certify_bytes(&self, input: &[u8], level: CertificationLevel) -> Result<Vec<u8>> {
        let revision = Revision::parse(input)?;
        let state = LifecycleState::inspect(revision.doc(), &self.config);
        if state.certification.is_some() {
            return Err(LifecycleViolation::AlreadyCertified.into());
        }
        if let Some(&row) = state.signed_rows.iter().next() {
            return Err(LifecycleViolation::RowsAlreadySigned(row).into());
        }

        let tree = FormTree::read(revision.doc());
        let mut update = IncrementalUpdate::new(input, revision.doc());
        let catalog = catalog_id(revision.doc())?;
        let acro_form = prepare_acro_form(&mut update, catalog)?;
        let field = signature_field(
            &mut update,
            &tree,
            revision.doc(),
            acro_form,
            &self.config.certification,
        )?;

        let mut sig = self.signature_dictionary();
        sig.set(
            "Reference",
            vec![Object::Dictionary(dictionary! {
                "Type" => "SigRef",
                "TransformMethod" => "DocMDP",
                "TransformParams" => dictionary! {
                    "Type" => "TransformParams",
                    "P" => level.permission(),
                    "V" => "1.2",
                },
            })],
        );
        let sig = update.add_signature_dictionary(sig, self.config.contents_capacity);
        update.dictionary_mut(field)?.set("V", sig);

        let perms = update.indirect_entry(catalog, b"Perms", || Dictionary::new().into())?;
        update.dictionary_mut(perms)?.set("DocMDP", sig);

        log::info!(
            "certifying with level {} in field {}",
            level.permission(),
            self.config.certification.field_name
        );
        self.finish(&revision, update)
    }

    pub fn sign_row_bytes(
        &self,
        input: &[u8],
        row: usize,
        values: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>> {
        let spec = self.config.rows.row(row).ok_or_else(|| {
            Error::Resolution(format!(
                "row {row}: the layout has rows 1 to {}",
                self.config.rows.len()
            ))
        })?;

        let revision = Revision::parse(input)?;
        let state = LifecycleState::inspect(revision.doc(), &self.config);
        if state.signed_rows.contains(&row) {
            return Err(LifecycleViolation::RowAlreadySigned(row).into());
        }
        if let Some(level) = state.certification.filter(|l| !l.allows_signing()) {
            return Err(LifecycleViolation::CertificationForbidsChanges(level).into());
        }

        let tree = FormTree::read(revision.doc());
        let mut targets = Vec::with_capacity(values.len());
        for (name, value) in values {
            if !spec.fill_fields.contains(name) {
                return Err(Error::Resolution(format!(
                    "field {name} is not a fill-in field of row {row}"
                )));
            }
            let Some(Field::Text(text)) = tree.find(name) else {
                return Err(Error::Resolution(format!("text field {name}")));
            };
            targets.push((text.node.id, name, value));
        }
        for name in values.keys().chain([&spec.signature_field]) {
            if let Some(signature) = state.locked_by(name) {
                return Err(LifecycleViolation::FieldLocked {
                    field: name.clone(),
                    signature: signature.to_string(),
                }
                .into());
            }
        }

        let mut update = IncrementalUpdate::new(input, revision.doc());
        for (id, name, value) in targets {
            log::debug!("setting {name} to {value:?}");
            update
                .dictionary_mut(id)?
                .set("V", encode_text_string(value));
        }

        let catalog = catalog_id(revision.doc())?;
        let acro_form = prepare_acro_form(&mut update, catalog)?;
        let field = signature_field(
            &mut update,
            &tree,
            revision.doc(),
            acro_form,
            &spec.placement(),
        )?;

        let lock = match tree.find(&spec.signature_field).and_then(Field::as_signature) {
            Some(existing) => match &existing.lock {
                Some(Ok(lock)) => lock.clone(),
                Some(Err(reason)) => {
                    return Err(Error::Resolution(format!(
                        "{}: {reason}",
                        spec.signature_field
                    )))
                }
                None => SigFieldLock::include(spec.fill_fields.iter().cloned()),
            },
            None => SigFieldLock::include(spec.fill_fields.iter().cloned()),
        };

        let mut transform = dictionary! {
            "Type" => "TransformParams",
            "Action" => Object::Name(lock.action.as_name().into()),
            "V" => "1.2",
        };
        if !lock.fields.is_empty() {
            transform.set("Fields", lock.fields_array());
        }
        let mut sig = self.signature_dictionary();
        sig.set(
            "Reference",
            vec![Object::Dictionary(dictionary! {
                "Type" => "SigRef",
                "TransformMethod" => "FieldMDP",
                "TransformParams" => transform,
            })],
        );
        let sig = update.add_signature_dictionary(sig, self.config.contents_capacity);

        let field_dict = update.dictionary_mut(field)?;
        field_dict.set("V", sig);
        if !field_dict.has(b"Lock") {
            field_dict.set("Lock", lock.to_dictionary());
        }

        log::info!("signing row {row} in field {}", spec.signature_field);
        self.finish(&revision, update)
    }

    fn signature_dictionary(&self) -> Dictionary {
        let mut dict = dictionary! {
            "Type" => "Sig",
            "Filter" => Object::Name(self.config.expected_filter.as_bytes().to_vec()),
            "SubFilter" => Object::Name(self.config.sub_filter.as_bytes().to_vec()),
            "M" => Object::string_literal(self.crypto.pdf_date()),
        };
        if let Some(name) = self.crypto.signer_name() {
            dict.set("Name", encode_text_string(name));
        }
        if let Some(reason) = &self.config.reason {
            dict.set("Reason", encode_text_string(reason));
        }
        if let Some(location) = &self.config.location {
            dict.set("Location", encode_text_string(location));
        }
        dict
    }

    /// Serializes, signs and validates the update.
    fn finish(&self, previous: &Revision, update: IncrementalUpdate) -> Result<Vec<u8>> {
        let prepared = update.prepare()?;
        let spans = prepared
            .signed_spans()
            .ok_or_else(|| Error::Resolution("signature placeholder".into()))?;
        let cms = self.crypto.sign(spans)?;
        let bytes = prepared.embed(&cms)?;

        let violations = {
            let next = Revision::parse(&bytes)?;
            let mut violations =
                check_increment(previous.bytes(), previous.doc(), &bytes, next.doc());
            violations.extend(collect_facts(&next, &self.config).blockers);
            violations
        };
        if !violations.is_empty() {
            for violation in &violations {
                log::warn!("{violation}");
            }
            return Err(Error::StructuralViolation(violations));
        }
        Ok(bytes)
    }
}

fn catalog_id(doc: &Document) -> Result<ObjectId> {
    doc.trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|_| Error::Resolution("/Root of the trailer".into()))
}

/// Makes sure the AcroForm allows signatures and has a default appearance.
fn prepare_acro_form(update: &mut IncrementalUpdate, catalog: ObjectId) -> Result<ObjectId> {
    let acro_form = update.indirect_entry(catalog, b"AcroForm", || {
        dictionary! { "Fields" => Vec::<Object>::new() }.into()
    })?;

    let current = update.dictionary(acro_form)?;
    let sig_flags_set = current
        .get(b"SigFlags")
        .ok()
        .and_then(|f| f.as_i64().ok())
        == Some(3);
    let has_da = current.has(b"DA");
    let has_dr = current.has(b"DR");

    if !has_dr {
        let font = update.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        update
            .dictionary_mut(acro_form)?
            .set("DR", dictionary! { "Font" => dictionary! { "Helv" => font } });
    }
    if !has_da {
        update
            .dictionary_mut(acro_form)?
            .set("DA", Object::string_literal("/Helv 0 Tf 0 g"));
    }
    if !sig_flags_set {
        update.dictionary_mut(acro_form)?.set("SigFlags", 3);
    }
    Ok(acro_form)
}

/// The unsigned signature field at `placement`, injected if the document
/// does not have it yet.
fn signature_field(
    update: &mut IncrementalUpdate,
    tree: &FormTree,
    doc: &Document,
    acro_form: ObjectId,
    placement: &SignaturePlacement,
) -> Result<ObjectId> {
    let name = &placement.field_name;
    match tree.find(name) {
        Some(Field::Signature(sig)) if sig.is_signed() => Err(Error::Resolution(format!(
            "unsigned signature field {name}"
        ))),
        Some(Field::Signature(sig)) if sig.widgets().is_empty() => {
            Err(Error::Resolution(format!("widget of signature field {name}")))
        }
        Some(Field::Signature(sig)) => Ok(sig.id()),
        Some(_) => Err(Error::Resolution(format!(
            "{name} exists but is not a signature field"
        ))),
        None if name.contains('.') => Err(Error::Resolution(format!(
            "parent of hierarchical field {name}"
        ))),
        None => {
            let page = doc
                .get_pages()
                .get(&placement.page)
                .copied()
                .ok_or_else(|| Error::Resolution(format!("page {}", placement.page)))?;
            let appearance = update.add_object(border_appearance(placement.rect));
            let field = update.add_object(dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "FT" => "Sig",
                "T" => encode_text_string(name),
                "Rect" => placement.rect.iter().map(|&v| Object::Real(v)).collect::<Vec<_>>(),
                "F" => 4,
                "P" => page,
                "AP" => dictionary! { "N" => appearance },
            });

            let fields = update.indirect_entry(acro_form, b"Fields", || {
                Vec::<Object>::new().into()
            })?;
            update.object_mut(fields)?.as_array_mut()?.push(field.into());
            let annots = update.indirect_entry(page, b"Annots", || Vec::<Object>::new().into())?;
            update.object_mut(annots)?.as_array_mut()?.push(field.into());

            log::debug!("injected signature field {name} on page {}", placement.page);
            Ok(field)
        }
    }
}

/// A thin border filling the widget rectangle.
fn border_appearance([x0, y0, x1, y1]: [f32; 4]) -> Stream {
    let (width, height) = ((x1 - x0).abs(), (y1 - y0).abs());
    let content = format!(
        "q 0.5 w 0 G 0.25 0.25 {} {} re S Q",
        width - 0.5,
        height - 0.5
    );
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), Object::Real(width), Object::Real(height)],
            "Resources" => Dictionary::new(),
        },
        content.into_bytes(),
    )
}

/// Writes `bytes` next to `output` and renames the file into place.
fn persist(output: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(output).map_err(|e| Error::Io(e.error))?;
    log::info!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}
