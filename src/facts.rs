//! Canonical fact sets describing the structure of one revision, and the
//! differ comparing a candidate against a reference.
//!
//! A fact is a `path=value` line. The set is sorted and deduplicated, so two
//! runs over the same bytes produce identical output and a reference file
//! can be compared line by line.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};

use crate::field_validation::{Findings, SignatureInspector};
use crate::form::{self, acro_form, deref_dict, name_of, page_numbers, Field, FormTree};
use crate::tail::locate_tail;
use crate::{Config, Revision};

/// Sorted, deduplicated `path=value` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactSet(BTreeSet<String>);

impl FactSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `path=value`. Line breaks in the value are escaped, so every
    /// fact stays on one line.
    pub fn insert(&mut self, path: impl AsRef<str>, value: impl ToString) {
        let value = value
            .to_string()
            .replace('\\', "\\\\")
            .replace('\n', "\\n")
            .replace('\r', "\\r");
        self.0.insert(format!("{}={value}", path.as_ref()));
    }

    pub fn contains(&self, fact: &str) -> bool {
        self.0.contains(fact)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: FactSet) {
        self.0.extend(other.0);
    }

    /// Writes one fact per line, in order.
    pub fn write_to(&self, mut writer: impl Write) -> std::io::Result<()> {
        for fact in &self.0 {
            writeln!(writer, "{fact}")?;
        }
        writer.flush()
    }

    /// Reads a file produced by [`FactSet::write_to`]. Blank lines are
    /// ignored.
    pub fn read_from(reader: impl BufRead) -> std::io::Result<Self> {
        let mut set = BTreeSet::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                set.insert(line.to_string());
            }
        }
        Ok(FactSet(set))
    }
}

impl FromIterator<String> for FactSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        FactSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FactSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Output of [`collect_facts`].
#[derive(Debug, Clone, Default)]
pub struct Facts {
    pub facts: FactSet,
    /// Conditions a strict reader would reject, in the order found.
    pub blockers: Vec<String>,
}

/// Walks the whole revision and records its structure.
pub fn collect_facts(revision: &Revision, config: &Config) -> Facts {
    let mut out = Findings::default();
    let doc = revision.doc();

    out.fact("file.size", revision.bytes().len());

    match acro_form(doc) {
        None => {
            out.fact("acroform.present", false);
            out.block("document has no /AcroForm in the catalog".into());
        }
        Some(acro_form) => {
            out.fact("acroform.present", true);

            let da = acro_form
                .get(b"DA")
                .ok()
                .and_then(|da| da.as_str().ok())
                .map(|da| String::from_utf8_lossy(da).into_owned());
            out.fact("acroform.da", da.as_deref().unwrap_or("<none>"));

            let sig_flags = acro_form
                .get(b"SigFlags")
                .ok()
                .and_then(|f| doc.dereference(f).ok())
                .and_then(|(_, f)| f.as_i64().ok());
            out.fact(
                "acroform.sigflags",
                sig_flags.map_or("<none>".to_string(), |f| f.to_string()),
            );

            let dr = acro_form.get(b"DR").ok().and_then(|dr| deref_dict(doc, dr));
            out.fact("acroform.dr.present", dr.is_some());
            let fonts = dr
                .and_then(|dr| dr.get(b"Font").ok())
                .and_then(|f| deref_dict(doc, f));
            for (name, font) in fonts.into_iter().flat_map(|f| f.iter()) {
                let name = String::from_utf8_lossy(name);
                let is_font = deref_dict(doc, font)
                    .and_then(|f| f.get(b"Type").ok())
                    .and_then(name_of)
                    .is_some_and(|t| t == "Font");
                out.fact(format!("acroform.dr.font.{name}"), is_font);
                if !is_font {
                    out.block(format!(
                        "/AcroForm /DR /Font /{name} does not resolve to a /Type /Font dictionary"
                    ));
                }
            }
        }
    }

    let tree = FormTree::read(doc);
    for problem in &tree.problems {
        out.block(problem.clone());
    }
    out.fact("acroform.fields", tree.names().join(","));

    let pages = page_numbers(doc);
    for field in &tree.fields {
        let node = field.node();
        let path = |key: &str| format!("field.{}.{key}", node.name);
        out.fact(path("ft"), node.field_type.as_deref().unwrap_or("<none>"));
        out.fact(path("kids"), node.kids.len());
        out.fact(path("parent"), node.parent.is_some());
        match field {
            Field::Text(text) => {
                out.fact(path("value"), text.value.as_deref().unwrap_or("<none>"));
            }
            Field::Signature(sig) => {
                SignatureInspector::new(revision, config, &pages, sig).inspect(false, &mut out);
            }
            Field::Generic(_) => (),
        }
    }

    match form::certification(doc) {
        Some(cert) => {
            out.fact("perms.docmdp", true);
            out.fact(
                "perms.docmdp.p",
                cert.level.map_or("invalid".to_string(), |l| l.permission().to_string()),
            );
            if cert.signature.is_none() {
                out.block("/Perms /DocMDP is not an indirect reference to a signature".into());
            }
        }
        None => out.fact("perms.docmdp", false),
    }

    tail_facts(revision.bytes(), &mut out);

    log::debug!(
        "collected {} facts and {} blockers",
        out.facts.len(),
        out.blockers.len()
    );
    Facts {
        facts: out.facts,
        blockers: out.blockers,
    }
}

fn tail_facts(bytes: &[u8], out: &mut Findings) {
    match locate_tail(bytes, false) {
        Err(e) => {
            out.fact("tail.ok", false);
            out.block(format!("tail: {e}"));
        }
        Ok(tail) => {
            out.fact("tail.startxref", tail.declared_offset);
            out.fact(
                "tail.xref.actual",
                tail.actual_offset
                    .map_or("<none>".to_string(), |o| o.to_string()),
            );
            out.fact("tail.xref.kind", tail.kind.map_or("<none>", |k| k.as_str()));
            out.fact("tail.eof", tail.eof_offset);
            out.fact("tail.ok", tail.ok);
            if !tail.ok {
                out.block(format!(
                    "tail: startxref {} does not point at an xref table or stream",
                    tail.declared_offset
                ));
            }
            if tail.actual_offset != Some(tail.declared_offset) {
                out.block(format!(
                    "tail: startxref declares {}, the last cross-reference section is at {}",
                    tail.declared_offset,
                    tail.actual_offset
                        .map_or("<none>".to_string(), |o| o.to_string())
                ));
            }
        }
    }

    match locate_tail(bytes, true) {
        Ok(_) => out.fact("tail.strict", true),
        Err(e) => {
            out.fact("tail.strict", false);
            out.block(format!("tail (strict): {e}"));
        }
    }
}

/// Difference between a reference fact set and a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactDiff {
    pub only_in_reference: Vec<String>,
    pub only_in_candidate: Vec<String>,
    pub blockers: Vec<String>,
}

impl FactDiff {
    /// No differing facts and no blockers.
    pub fn is_clean(&self) -> bool {
        self.only_in_reference.is_empty()
            && self.only_in_candidate.is_empty()
            && self.blockers.is_empty()
    }
}

/// Set difference in both directions, with the candidate's blockers.
pub fn diff(reference: &FactSet, candidate: &FactSet, blockers: &[String]) -> FactDiff {
    FactDiff {
        only_in_reference: reference.0.difference(&candidate.0).cloned().collect(),
        only_in_candidate: candidate.0.difference(&reference.0).cloned().collect(),
        blockers: blockers.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use lopdf::Object;

    use super::*;
    use crate::test_support::{self, page_dict_mut, values, Template};

    #[test]
    fn test_template_facts() {
        let template = Template::rows(4).build();
        let revision = Revision::parse(&template).unwrap();
        let facts = collect_facts(&revision, &test_support::config());

        assert_eq!(facts.blockers, Vec::<String>::new());
        assert!(facts.facts.contains("acroform.present=true"));
        assert!(facts.facts.contains("acroform.dr.font.Helv=true"));
        assert!(facts.facts.contains("field.sig_row_2.ft=Sig"));
        assert!(facts.facts.contains("sig.sig_row_2.signed=false"));
        assert!(facts.facts.contains("tail.ok=true"));
        assert!(facts.facts.contains("tail.xref.kind=stream"));
        assert!(facts.facts.contains(&format!("file.size={}", template.len())));
    }

    #[test]
    fn test_classic_table_facts() {
        let template = Template::rows(2).with_classic_xref().build();
        let config = test_support::config();
        let facts = collect_facts(&Revision::parse(&template).unwrap(), &config);
        assert_eq!(facts.blockers, Vec::<String>::new());
        assert!(facts.facts.contains("tail.xref.kind=table"));
        assert!(facts.facts.contains("tail.ok=true"));

        let signed = test_support::coordinator()
            .sign_row_bytes(&template, 1, &values(&[("row_1_name", "Ada")]))
            .unwrap();
        let facts = collect_facts(&Revision::parse(&signed).unwrap(), &config);
        assert!(facts.blockers.is_empty(), "{:?}", facts.blockers);
        assert!(facts.facts.contains("tail.xref.kind=table"));
        assert!(facts.facts.contains("sig.sig_row_1.signed=true"));
    }

    #[test]
    fn test_deterministic() {
        let signed = test_support::coordinator()
            .sign_row_bytes(&Template::rows(4).build(), 2, &values(&[("row_2_name", "Grace")]))
            .unwrap();
        let config = test_support::config();

        let first = collect_facts(&Revision::parse(&signed).unwrap(), &config);
        let second = collect_facts(&Revision::parse(&signed).unwrap(), &config);
        assert_eq!(first.facts, second.facts);
        assert_eq!(first.blockers, second.blockers);
        assert!(first.blockers.is_empty(), "{:?}", first.blockers);

        let d = diff(&first.facts, &second.facts, &second.blockers);
        assert!(d.is_clean());
        assert!(first.facts.contains("field.row_2_name.value=Grace"));
        assert!(first.facts.contains("sig.sig_row_2.lock.action=Include"));
        assert!(first
            .facts
            .contains("sig.sig_row_2.lock.fields=row_2_name,row_2_date"));
    }

    #[test]
    fn test_diff_between_rows() {
        let template = Template::rows(4).build();
        let coordinator = test_support::coordinator();
        let config = test_support::config();
        let fill = values(&[]);

        let row1 = coordinator.sign_row_bytes(&template, 1, &fill).unwrap();
        let row3 = coordinator.sign_row_bytes(&template, 3, &fill).unwrap();
        let f1 = collect_facts(&Revision::parse(&row1).unwrap(), &config);
        let f3 = collect_facts(&Revision::parse(&row3).unwrap(), &config);

        let d = diff(&f1.facts, &f3.facts, &f3.blockers);
        assert!(d.blockers.is_empty());
        assert!(!d.is_clean());
        assert!(d.only_in_reference.contains(&"sig.sig_row_1.signed=true".to_string()));
        assert!(d.only_in_candidate.contains(&"sig.sig_row_3.signed=true".to_string()));
        // Rows nobody signed look the same in both.
        assert!(!d
            .only_in_reference
            .iter()
            .chain(&d.only_in_candidate)
            .any(|f| f.starts_with("sig.sig_row_2.") || f.starts_with("sig.sig_row_4.")));
    }

    #[test]
    fn test_later_row_leaves_earlier_row_alone() {
        let coordinator = test_support::coordinator();
        let config = test_support::config();

        let row1 = coordinator
            .sign_row_bytes(&Template::rows(4).build(), 1, &values(&[("row_1_name", "Ada")]))
            .unwrap();
        let row3 = coordinator
            .sign_row_bytes(&row1, 3, &values(&[("row_3_name", "Grace")]))
            .unwrap();
        let before = collect_facts(&Revision::parse(&row1).unwrap(), &config);
        let after = collect_facts(&Revision::parse(&row3).unwrap(), &config);

        let d = diff(&before.facts, &after.facts, &after.blockers);
        assert!(d.blockers.is_empty(), "{:?}", d.blockers);
        assert!(d.only_in_candidate.contains(&"sig.sig_row_3.signed=true".to_string()));
        let row3_or_file = |fact: &String| {
            ["file.", "tail.", "field.row_3_", "field.sig_row_3.", "sig.sig_row_3."]
                .iter()
                .any(|prefix| fact.starts_with(prefix))
        };
        for fact in d.only_in_reference.iter().chain(&d.only_in_candidate) {
            assert!(row3_or_file(fact), "unexpected difference {fact}");
        }
    }

    #[test]
    fn test_blockers() {
        let mut bytes = Template::rows(1).build();
        bytes.extend_from_slice(b"  ");
        let mut revision = Revision::parse(&bytes).unwrap();
        let font = page_dict_mut(&mut revision.doc)
            .get(b"Resources")
            .unwrap()
            .as_dict()
            .unwrap()
            .get(b"Font")
            .unwrap()
            .as_dict()
            .unwrap()
            .get(b"Helv")
            .unwrap()
            .as_reference()
            .unwrap();
        revision
            .doc
            .get_object_mut(font)
            .unwrap()
            .as_dict_mut()
            .unwrap()
            .set("Type", Object::Name(b"Encoding".to_vec()));

        let facts = collect_facts(&revision, &test_support::config());
        let joined = facts.blockers.join("\n");
        assert_eq!(facts.blockers.len(), 2, "{joined}");
        assert!(joined.contains("/DR /Font /Helv"));
        assert!(joined.contains("tail (strict)"));
        assert!(facts.facts.contains("tail.strict=false"));
    }

    #[test]
    fn test_fact_file() {
        let mut set = FactSet::new();
        set.insert("b.path", "two\nlines");
        set.insert("a.path", 1);
        set.insert("a.path", 1);
        assert_eq!(set.len(), 2);

        let mut file = Vec::new();
        set.write_to(&mut file).unwrap();
        assert_eq!(file, b"a.path=1\nb.path=two\\nlines\n");

        let read = FactSet::read_from(&file[..]).unwrap();
        assert_eq!(read, set);
    }
}
