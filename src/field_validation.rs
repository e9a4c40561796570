//! Checks a signature field and its widgets for everything a strict reader
//! needs to display the signature.
//!
//! Every check is independent and all of them run: the result is the list of
//! every violated rule, each message naming the field and what was expected.

use std::collections::HashMap;

use lopdf::{xref::XrefEntry, Dictionary, Object, ObjectId, StringFormat};

use crate::byte_range::{self, verify_byte_range_hole, ByteRange};
use crate::facts::FactSet;
use crate::form::{
    self, media_box, name_of, page_numbers, rect_of, Field, FormField, FormTree, SignatureField,
    SignatureValue,
};
use crate::{pdf_ends_with_eof, Config, Revision};

const FLAG_INVISIBLE: i64 = 1;
const FLAG_HIDDEN: i64 = 2;
const FLAG_PRINT: i64 = 4;
const FLAG_NO_VIEW: i64 = 32;

/// Outcome of [`validate_signature_field`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReport {
    pub field: String,
    pub ok: bool,
    pub blockers: Vec<String>,
}

/// Facts and blockers produced while inspecting one part of a revision.
#[derive(Debug, Default)]
pub(crate) struct Findings {
    pub(crate) facts: FactSet,
    pub(crate) blockers: Vec<String>,
}

impl Findings {
    pub(crate) fn fact(&mut self, path: impl AsRef<str>, value: impl ToString) {
        self.facts.insert(path, value);
    }

    pub(crate) fn block(&mut self, blocker: String) {
        log::debug!("blocker: {blocker}");
        self.blockers.push(blocker);
    }
}

/// Validates the signature field named `field_name`.
pub fn validate_signature_field(
    revision: &Revision,
    field_name: &str,
    config: &Config,
) -> FieldReport {
    let tree = FormTree::read(revision.doc());
    let mut findings = Findings::default();

    match tree.find(field_name) {
        None => findings.block(format!("{field_name}: no such field in /AcroForm")),
        Some(Field::Signature(field)) => {
            let pages = page_numbers(revision.doc());
            SignatureInspector::new(revision, config, &pages, field).inspect(true, &mut findings);
        }
        Some(other) => findings.block(format!(
            "{field_name}: /FT is {}, expected /Sig",
            other
                .node()
                .field_type
                .as_deref()
                .map_or("missing".to_string(), |t| format!("/{t}"))
        )),
    }

    FieldReport {
        field: field_name.to_string(),
        ok: findings.blockers.is_empty(),
        blockers: findings.blockers,
    }
}

/// Runs the checks of one signature field, recording facts under
/// `sig.<name>.`.
pub(crate) struct SignatureInspector<'r, 'a> {
    revision: &'r Revision<'a>,
    config: &'r Config,
    pages: &'r HashMap<ObjectId, u32>,
    field: &'r SignatureField,
}

impl<'r, 'a> SignatureInspector<'r, 'a> {
    pub(crate) fn new(
        revision: &'r Revision<'a>,
        config: &'r Config,
        pages: &'r HashMap<ObjectId, u32>,
        field: &'r SignatureField,
    ) -> Self {
        Self {
            revision,
            config,
            pages,
            field,
        }
    }

    fn name(&self) -> &str {
        self.field.name()
    }

    fn path(&self, key: &str) -> String {
        format!("sig.{}.{key}", self.name())
    }

    /// With `require_value`, an unsigned field is itself a blocker; otherwise
    /// only the widget wiring and the lock are checked.
    pub(crate) fn inspect(&self, require_value: bool, out: &mut Findings) {
        out.fact(self.path("signed"), self.field.is_signed());

        match self.field.value {
            SignatureValue::Unsigned if require_value => {
                out.block(format!("{}: /V is missing, the field is not signed", self.name()))
            }
            SignatureValue::Unsigned => (),
            SignatureValue::Invalid => out.block(format!(
                "{}: /V does not resolve to a signature dictionary",
                self.name()
            )),
            SignatureValue::Inline => {
                out.fact(self.path("value"), "inline");
                out.block(format!(
                    "{}: signature dictionary is inline in /V, expected an indirect reference",
                    self.name()
                ));
            }
            SignatureValue::Indirect(_) => out.fact(self.path("value"), "indirect"),
        }

        if let Some(sig) = self.field.value_dictionary(self.revision.doc()) {
            self.check_value_dictionary(sig, out);
        }
        self.check_lock(out);
        self.check_widgets(out);
    }

    fn check_value_dictionary(&self, sig: &Dictionary, out: &mut Findings) {
        let doc = self.revision.doc();
        let name = self.name();

        let type_tag = sig.get(b"Type").ok().and_then(name_of);
        out.fact(self.path("type"), type_tag.as_deref().unwrap_or("<none>"));
        if type_tag.as_deref() != Some("Sig") {
            out.block(format!(
                "{name}: signature dictionary /Type is {}, expected /Sig",
                display_name(type_tag.as_deref())
            ));
        }

        let filter = sig.get(b"Filter").ok().and_then(name_of);
        out.fact(self.path("filter"), filter.as_deref().unwrap_or("<none>"));
        if filter.as_deref() != Some(self.config.expected_filter.as_str()) {
            out.block(format!(
                "{name}: /Filter is {}, expected /{}",
                display_name(filter.as_deref()),
                self.config.expected_filter
            ));
        }

        let sub_filter = sig.get(b"SubFilter").ok().and_then(name_of);
        out.fact(self.path("subfilter"), sub_filter.as_deref().unwrap_or("<none>"));
        if !sub_filter
            .as_deref()
            .is_some_and(|s| self.config.accepts_sub_filter(s.as_bytes()))
        {
            out.block(format!(
                "{name}: /SubFilter is {}, expected one of {}",
                display_name(sub_filter.as_deref()),
                self.config.accepted_sub_filters.join(", ")
            ));
        }

        if let Some(p) = form::docmdp_permission(doc, sig) {
            out.fact(self.path("docmdp.p"), p);
        }

        let contents = sig
            .get(b"Contents")
            .ok()
            .and_then(|c| doc.dereference(c).ok())
            .map(|(_, c)| c);
        let contents = match contents {
            Some(Object::String(bytes, format)) => {
                let hex = *format == StringFormat::Hexadecimal;
                out.fact(self.path("contents.bytes"), bytes.len());
                if !hex {
                    out.block(format!(
                        "{name}: /Contents is a literal string, expected a hex string"
                    ));
                }
                Some(bytes.as_slice())
            }
            Some(_) => {
                out.block(format!("{name}: /Contents is not a string"));
                None
            }
            None => {
                out.block(format!("{name}: /Contents is missing"));
                None
            }
        };

        let range = match sig.get(b"ByteRange") {
            Ok(obj) => match ByteRange::from_object(doc, obj) {
                Ok(range) => Some(range),
                Err(e) => {
                    out.block(format!("{name}: {e}"));
                    None
                }
            },
            Err(_) => {
                out.block(format!("{name}: /ByteRange is missing"));
                None
            }
        };

        let Some(range) = range else {
            return;
        };
        for (i, value) in range.to_array().iter().enumerate() {
            out.fact(self.path(&format!("byterange.{i}")), value);
        }

        let bytes = self.revision.bytes();
        match byte_range::hole_token(&range, bytes) {
            Some(token) => {
                let all_hex = token.iter().all(u8::is_ascii_hexdigit);
                out.fact(self.path("contents.hexlen"), token.len());
                out.fact(self.path("contents.hex"), all_hex);
                if token.len() % 2 != 0 {
                    out.block(format!(
                        "{name}: /Contents has an odd hex length of {}",
                        token.len()
                    ));
                }
            }
            None => out.fact(self.path("contents.hex"), false),
        }

        if let Some(contents) = contents {
            if let Err(e) = verify_byte_range_hole(&range, contents, bytes) {
                out.block(format!("{name}: /ByteRange {:?}: {e}", range.to_array()));
            }
        }

        let end = range.coverage_end().unwrap_or(i64::MAX);
        if end >= 0 && end as u64 <= bytes.len() as u64 && !pdf_ends_with_eof(&bytes[..end as usize])
        {
            out.block(format!(
                "{name}: signed range ends at {end}, which is not the end of a revision"
            ));
        }

        // The signature dictionary itself must be in the signed part.
        if let SignatureValue::Indirect(id) = self.field.value {
            if let Some(XrefEntry::Normal { offset, .. }) = doc.reference_table.entries.get(&id.0) {
                if *offset as i64 >= range.len0 {
                    out.block(format!(
                        "{name}: signature dictionary at offset {offset} lies after the hole at {}",
                        range.len0
                    ));
                }
            }
        }
    }

    fn check_lock(&self, out: &mut Findings) {
        match &self.field.lock {
            None => out.fact(self.path("lock"), "<none>"),
            Some(Ok(lock)) => {
                out.fact(self.path("lock.action"), lock.action.as_name());
                out.fact(self.path("lock.fields"), lock.fields.join(","));
            }
            Some(Err(reason)) => {
                out.fact(self.path("lock"), "invalid");
                out.block(format!("{}: {reason}", self.name()));
            }
        }
    }

    fn check_widgets(&self, out: &mut Findings) {
        let widgets = self.field.widgets();
        out.fact(self.path("widgets"), widgets.len());
        if widgets.is_empty() {
            out.block(format!("{}: no widget annotation", self.name()));
        }
        for (i, &widget) in widgets.iter().enumerate() {
            self.check_widget(i, widget, out);
        }
    }

    fn check_widget(&self, index: usize, widget_id: ObjectId, out: &mut Findings) {
        let doc = self.revision.doc();
        let name = self.name();
        let label = format!("{name}: widget {} {}", widget_id.0, widget_id.1);
        let path = |key: &str| self.path(&format!("widget.{index}.{key}"));

        let widget = match doc.get_dictionary(widget_id) {
            Ok(widget) => widget,
            Err(e) => {
                out.block(format!("{label} is unreadable: {e}"));
                return;
            }
        };

        if !form::is_widget(widget) {
            out.block(format!("{label} is not a /Subtype /Widget annotation"));
        }

        // Rectangle
        let rect = widget.get(b"Rect").ok().and_then(|r| rect_of(doc, r));
        let rect = match rect {
            Some(rect) => {
                let rect = normalize(rect);
                out.fact(path("rect"), format_rect(rect));
                if area(rect) <= 0.0 {
                    out.block(format!("{label}: /Rect {} has no area", format_rect(rect)));
                }
                Some(rect)
            }
            None => {
                out.block(format!("{label}: /Rect is missing or not four numbers"));
                None
            }
        };

        // Page assignment and membership
        let page = match widget.get(b"P") {
            Err(_) => {
                out.block(format!("{label}: /P is missing, the widget is not assigned to a page"));
                None
            }
            Ok(p) => match p.as_reference() {
                Ok(page_id) => match self.pages.get(&page_id) {
                    Some(&number) => Some((page_id, number)),
                    None => {
                        out.block(format!(
                            "{label}: /P {} {} R is not a page of the document",
                            page_id.0, page_id.1
                        ));
                        None
                    }
                },
                Err(_) => {
                    out.block(format!("{label}: /P is not an indirect reference to a page"));
                    None
                }
            },
        };

        if let Some((page_id, number)) = page {
            out.fact(path("page"), number);

            match (rect, media_box(doc, page_id)) {
                (Some(rect), Some(mbox)) => {
                    if !intersects(rect, normalize(mbox)) {
                        out.block(format!(
                            "{label}: /Rect {} lies outside page {number} /MediaBox {}",
                            format_rect(rect),
                            format_rect(normalize(mbox))
                        ));
                    }
                }
                (_, None) => out.block(format!("{label}: page {number} has no /MediaBox")),
                (None, Some(_)) => (),
            }

            let membership = annots_membership(doc, page_id, widget_id, widget);
            out.fact(path("annots"), membership.unwrap_or("absent"));
            if membership.is_none() {
                out.block(format!("{label}: not listed in page {number} /Annots"));
            }
        }

        // Flags
        let flags = widget
            .get(b"F")
            .ok()
            .and_then(|f| doc.dereference(f).ok())
            .and_then(|(_, f)| f.as_i64().ok())
            .unwrap_or(0);
        out.fact(path("flags"), flags);
        if flags & FLAG_PRINT == 0 {
            out.block(format!("{label}: /F {flags} lacks the Print flag (4)"));
        }
        if flags & (FLAG_INVISIBLE | FLAG_HIDDEN | FLAG_NO_VIEW) != 0 {
            out.block(format!(
                "{label}: /F {flags} sets Invisible, Hidden or NoView"
            ));
        }

        // Appearance
        let has_normal_appearance = widget
            .get(b"AP")
            .ok()
            .and_then(|ap| form::deref_dict(doc, ap))
            .and_then(|ap| ap.get(b"N").ok())
            .and_then(|n| doc.dereference(n).ok())
            .is_some_and(|(_, n)| matches!(n, Object::Stream(_) | Object::Dictionary(_)));
        out.fact(path("ap.n"), has_normal_appearance);
        if !has_normal_appearance {
            out.block(format!("{label}: no normal appearance stream (/AP /N)"));
        }

        // Layout of row fields
        if let (Some(rect), Some((row, spec))) =
            (rect, self.config.rows.row_for_signature_field(name))
        {
            let expected = normalize(spec.rect);
            let tolerance = self.config.rect_tolerance;
            if rect
                .iter()
                .zip(expected.iter())
                .any(|(a, e)| (a - e).abs() > tolerance)
            {
                out.block(format!(
                    "{label}: /Rect {} differs from the row {row} layout {} by more than {tolerance}",
                    format_rect(rect),
                    format_rect(expected)
                ));
            }
        }
    }
}

/// How the page's `/Annots` lists the widget: by reference, or only by an
/// equal dictionary.
fn annots_membership(
    doc: &lopdf::Document,
    page_id: ObjectId,
    widget_id: ObjectId,
    widget: &Dictionary,
) -> Option<&'static str> {
    let annots = doc
        .get_dictionary(page_id)
        .ok()?
        .get(b"Annots")
        .ok()
        .and_then(|a| doc.dereference(a).ok())
        .and_then(|(_, a)| a.as_array().ok())?;

    if annots
        .iter()
        .any(|a| matches!(a, Object::Reference(id) if *id == widget_id))
    {
        return Some("reference");
    }
    annots
        .iter()
        .filter_map(|a| form::deref_dict(doc, a))
        .any(|a| a == widget)
        .then_some("value")
}

fn display_name(name: Option<&str>) -> String {
    name.map_or("missing".to_string(), |n| format!("/{n}"))
}

fn normalize([x0, y0, x1, y1]: [f32; 4]) -> [f32; 4] {
    [x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)]
}

fn area([x0, y0, x1, y1]: [f32; 4]) -> f32 {
    (x1 - x0) * (y1 - y0)
}

fn intersects(a: [f32; 4], b: [f32; 4]) -> bool {
    a[0] < b[2] && b[0] < a[2] && a[1] < b[3] && b[1] < a[3]
}

pub(crate) fn format_rect(rect: [f32; 4]) -> String {
    format!("[{} {} {} {}]", rect[0], rect[1], rect[2], rect[3])
}

#[cfg(test)]
mod tests {
    use lopdf::Document;

    use super::*;
    use crate::test_support::{self, field_id, page_dict_mut, Template};

    fn signed_row_one() -> Vec<u8> {
        let template = Template::rows(4).build();
        test_support::coordinator()
            .sign_row_bytes(&template, 1, &test_support::values(&[("row_1_name", "Ada")]))
            .unwrap()
    }

    #[test]
    fn test_signed_row_has_no_blockers() {
        let signed = signed_row_one();
        let revision = Revision::parse(&signed).unwrap();
        let report = validate_signature_field(&revision, "sig_row_1", &test_support::config());
        assert_eq!(report.blockers, Vec::<String>::new());
        assert!(report.ok);

        let widget = revision.doc().get_dictionary(field_id(revision.doc(), "sig_row_1")).unwrap();
        assert_eq!(widget.get(b"F").unwrap().as_i64().unwrap(), 4);
        assert_eq!(
            rect_of(revision.doc(), widget.get(b"Rect").unwrap()),
            Some([100.0, 100.0, 220.0, 130.0])
        );
    }

    #[test]
    fn test_widget_missing_from_annots() {
        let signed = signed_row_one();
        let mut revision = Revision::parse(&signed).unwrap();
        let widget = field_id(revision.doc(), "sig_row_1");

        let page = page_dict_mut(&mut revision.doc);
        let annots = page.get_mut(b"Annots").unwrap().as_array_mut().unwrap();
        annots.retain(|a| a.as_reference().ok() != Some(widget));

        let report = validate_signature_field(&revision, "sig_row_1", &test_support::config());
        assert!(!report.ok);
        assert_eq!(report.blockers.len(), 1, "{:?}", report.blockers);
        assert!(report.blockers[0].contains("/Annots"));
    }

    #[test]
    fn test_unsigned_and_wrong_type() {
        let template = Template::rows(2).build();
        let revision = Revision::parse(&template).unwrap();
        let config = test_support::config();

        let report = validate_signature_field(&revision, "sig_row_2", &config);
        assert_eq!(report.blockers.len(), 1);
        assert!(report.blockers[0].contains("not signed"));

        let report = validate_signature_field(&revision, "row_2_name", &config);
        assert_eq!(report.blockers, ["row_2_name: /FT is /Tx, expected /Sig"]);

        let report = validate_signature_field(&revision, "nope", &config);
        assert!(!report.ok);
    }

    #[test]
    fn test_every_widget_violation_is_reported() {
        let signed = signed_row_one();
        let mut revision = Revision::parse(&signed).unwrap();
        let widget_id = field_id(revision.doc(), "sig_row_1");

        let widget = revision
            .doc
            .get_object_mut(widget_id)
            .unwrap()
            .as_dict_mut()
            .unwrap();
        widget.set("F", 6);
        widget.set("Rect", vec![700.into(), 900.into(), 820.into(), 930.into()]);
        widget.remove(b"AP");

        let report = validate_signature_field(&revision, "sig_row_1", &test_support::config());
        let joined = report.blockers.join("\n");
        assert_eq!(report.blockers.len(), 4, "{joined}");
        assert!(joined.contains("outside page 1 /MediaBox"));
        assert!(joined.contains("Invisible, Hidden or NoView"));
        assert!(joined.contains("/AP /N"));
        assert!(joined.contains("row 1 layout"));
    }

    #[test]
    fn test_value_dictionary_checks() {
        let signed = signed_row_one();
        let mut revision = Revision::parse(&signed).unwrap();
        let field = revision
            .doc
            .get_dictionary(field_id(revision.doc(), "sig_row_1"))
            .unwrap();
        let sig_id = field.get(b"V").unwrap().as_reference().unwrap();

        let sig = revision
            .doc
            .get_object_mut(sig_id)
            .unwrap()
            .as_dict_mut()
            .unwrap();
        sig.set("SubFilter", Object::Name(b"adbe.x509.rsa_sha1".to_vec()));
        sig.set("ByteRange", vec![0.into(), 10.into(), 5.into(), 10.into()]);

        let report = validate_signature_field(&revision, "sig_row_1", &test_support::config());
        let joined = report.blockers.join("\n");
        assert!(joined.contains("/SubFilter is /adbe.x509.rsa_sha1"), "{joined}");
        assert!(joined.contains("offsets overlap"), "{joined}");
    }

    #[test]
    fn test_hierarchical_widget() {
        let template = Template::rows(1).with_hierarchy("approvals").build();
        let revision = Revision::parse(&template).unwrap();
        let mut findings = Findings::default();
        let tree = FormTree::read(revision.doc());
        let field = tree.find("approvals.sig").unwrap().as_signature().unwrap();
        let pages = page_numbers(revision.doc());
        SignatureInspector::new(&revision, &test_support::config(), &pages, field)
            .inspect(false, &mut findings);

        assert!(findings.blockers.is_empty(), "{:?}", findings.blockers);
        assert!(findings.facts.contains("sig.approvals.sig.widget.0.annots=reference"));
        assert!(findings.facts.contains("sig.approvals.sig.widget.0.page=1"));
    }

    #[test]
    fn test_value_equality_fallback() {
        let doc = Document::with_version("1.7");
        assert!(annots_membership(&doc, (1, 0), (2, 0), &Dictionary::new()).is_none());

        let signed = signed_row_one();
        let mut revision = Revision::parse(&signed).unwrap();
        let widget_id = field_id(revision.doc(), "sig_row_1");
        let widget = revision.doc().get_dictionary(widget_id).unwrap().clone();

        let page = page_dict_mut(&mut revision.doc);
        let annots = page.get_mut(b"Annots").unwrap().as_array_mut().unwrap();
        for annot in annots.iter_mut() {
            if annot.as_reference().ok() == Some(widget_id) {
                *annot = Object::Dictionary(widget.clone());
            }
        }

        let page_id = *revision.doc().get_pages().get(&1).unwrap();
        assert_eq!(
            annots_membership(revision.doc(), page_id, widget_id, &widget),
            Some("value")
        );
    }
}
