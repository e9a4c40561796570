//! Read-side model of the AcroForm field tree.
//!
//! Fields, widgets and pages reference each other in cycles. Nothing here
//! holds a native reference into that graph: nodes are identified by their
//! [`ObjectId`] and every edge is an id looked up in the [`Document`] on
//! demand.

use std::collections::{HashMap, HashSet};

use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};

use crate::ExactArrayOrNone;

const MAX_INHERITANCE_DEPTH: usize = 32;

/// Capability shared by every kind of field.
pub trait FormField {
    /// Object holding the field dictionary.
    fn id(&self) -> ObjectId;
    /// Fully qualified name, the partial names joined by dots.
    fn name(&self) -> &str;
    /// Widget annotations of the field.
    fn widgets(&self) -> &[ObjectId];
}

/// Position of a field dictionary in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldNode {
    pub id: ObjectId,
    pub name: String,
    /// `/FT`, possibly inherited from an ancestor.
    pub field_type: Option<String>,
    pub parent: Option<ObjectId>,
    /// Child field dictionaries. Widget-only kids are in `widgets`.
    pub kids: Vec<ObjectId>,
    pub widgets: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextField {
    pub node: FieldNode,
    pub value: Option<String>,
}

/// How a signature field refers to its signature dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureValue {
    Unsigned,
    /// The dictionary is embedded in the field.
    Inline,
    Indirect(ObjectId),
    /// `/V` is something other than a dictionary.
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureField {
    pub node: FieldNode,
    pub value: SignatureValue,
    /// `/Lock`, or the reason it could not be read.
    pub lock: Option<Result<SigFieldLock, String>>,
}

impl SignatureField {
    pub fn is_signed(&self) -> bool {
        self.value != SignatureValue::Unsigned
    }

    /// The signature dictionary, wherever it lives.
    pub fn value_dictionary<'d>(&self, doc: &'d Document) -> Option<&'d Dictionary> {
        let field = doc.get_dictionary(self.node.id).ok()?;
        deref_dict(doc, field.get(b"V").ok()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenericField {
    pub node: FieldNode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Text(TextField),
    Signature(SignatureField),
    Generic(GenericField),
}

impl Field {
    pub fn node(&self) -> &FieldNode {
        match self {
            Field::Text(f) => &f.node,
            Field::Signature(f) => &f.node,
            Field::Generic(f) => &f.node,
        }
    }

    pub fn as_signature(&self) -> Option<&SignatureField> {
        match self {
            Field::Signature(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextField> {
        match self {
            Field::Text(f) => Some(f),
            _ => None,
        }
    }
}

impl FormField for FieldNode {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn widgets(&self) -> &[ObjectId] {
        &self.widgets
    }
}

macro_rules! delegate_form_field {
    ($($field:ty),*) => {$(
        impl FormField for $field {
            fn id(&self) -> ObjectId {
                self.node.id
            }

            fn name(&self) -> &str {
                &self.node.name
            }

            fn widgets(&self) -> &[ObjectId] {
                &self.node.widgets
            }
        }
    )*};
}

delegate_form_field!(TextField, SignatureField, GenericField);

impl FormField for Field {
    fn id(&self) -> ObjectId {
        self.node().id
    }

    fn name(&self) -> &str {
        &self.node().name
    }

    fn widgets(&self) -> &[ObjectId] {
        &self.node().widgets
    }
}

/// Every field reachable from `/AcroForm /Fields`, in tree order, and the
/// nodes that could not be read.
#[derive(Debug, Default)]
pub struct FormTree {
    pub fields: Vec<Field>,
    pub problems: Vec<String>,
}

impl FormTree {
    pub fn read(doc: &Document) -> Self {
        let mut tree = FormTree::default();
        let Some(acro_form) = acro_form(doc) else {
            return tree;
        };
        let Some(fields) = acro_form
            .get(b"Fields")
            .ok()
            .and_then(|f| doc.dereference(f).ok())
            .and_then(|(_, f)| f.as_array().ok())
        else {
            tree.problems.push("/AcroForm has no /Fields array".into());
            return tree;
        };

        let mut seen = HashSet::new();
        for field in fields {
            match field.as_reference() {
                Ok(id) => tree.walk(doc, id, None, &mut seen, 0),
                Err(_) => tree
                    .problems
                    .push("/AcroForm /Fields holds a direct object instead of a reference".into()),
            }
        }
        tree
    }

    pub fn find(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &SignatureField> {
        self.fields.iter().filter_map(Field::as_signature)
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name()).collect()
    }

    fn walk(
        &mut self,
        doc: &Document,
        id: ObjectId,
        parent: Option<&FieldNode>,
        seen: &mut HashSet<ObjectId>,
        depth: usize,
    ) {
        if depth > MAX_INHERITANCE_DEPTH || !seen.insert(id) {
            self.problems
                .push(format!("field tree loops back to object {} {}", id.0, id.1));
            return;
        }
        let dict = match doc.get_dictionary(id) {
            Ok(dict) => dict,
            Err(e) => {
                self.problems
                    .push(format!("field object {} {} is unreadable: {e}", id.0, id.1));
                return;
            }
        };

        let partial = dict
            .get(b"T")
            .ok()
            .and_then(|t| t.as_str().ok())
            .map(decode_text_string);
        let name = match (parent.map(|p| p.name.as_str()), partial) {
            (Some(p), Some(t)) if !p.is_empty() => format!("{p}.{t}"),
            (_, Some(t)) => t,
            (Some(p), None) => p.to_string(),
            (None, None) => String::new(),
        };
        let field_type = dict
            .get(b"FT")
            .ok()
            .and_then(name_of)
            .or_else(|| parent.and_then(|p| p.field_type.clone()));

        let mut kids = Vec::new();
        let mut widgets = Vec::new();
        if is_widget(dict) {
            widgets.push(id);
        }
        if let Some(array) = dict
            .get(b"Kids")
            .ok()
            .and_then(|k| doc.dereference(k).ok())
            .and_then(|(_, k)| k.as_array().ok())
        {
            for kid in array {
                let Ok(kid_id) = kid.as_reference() else {
                    self.problems
                        .push(format!("field {name} has a direct object in /Kids"));
                    continue;
                };
                match doc.get_dictionary(kid_id) {
                    Ok(kid) if kid.has(b"T") => kids.push(kid_id),
                    Ok(_) => widgets.push(kid_id),
                    Err(e) => self.problems.push(format!(
                        "kid {} {} of field {name} is unreadable: {e}",
                        kid_id.0, kid_id.1
                    )),
                }
            }
        }

        let node = FieldNode {
            id,
            name,
            field_type,
            parent: dict.get(b"Parent").ok().and_then(|p| p.as_reference().ok()),
            kids,
            widgets,
        };

        let field = match node.field_type.as_deref() {
            Some("Sig") => Field::Signature(SignatureField {
                value: match dict.get(b"V") {
                    Err(_) | Ok(Object::Null) => SignatureValue::Unsigned,
                    Ok(Object::Dictionary(_)) => SignatureValue::Inline,
                    Ok(Object::Reference(v)) if doc.get_dictionary(*v).is_ok() => {
                        SignatureValue::Indirect(*v)
                    }
                    Ok(_) => SignatureValue::Invalid,
                },
                lock: dict
                    .get(b"Lock")
                    .ok()
                    .map(|lock| SigFieldLock::from_object(doc, lock)),
                node: node.clone(),
            }),
            Some("Tx") => Field::Text(TextField {
                value: dict
                    .get(b"V")
                    .ok()
                    .and_then(|v| doc.dereference(v).ok())
                    .and_then(|(_, v)| v.as_str().ok())
                    .map(decode_text_string),
                node: node.clone(),
            }),
            _ => Field::Generic(GenericField { node: node.clone() }),
        };
        self.fields.push(field);

        for kid in &node.kids {
            self.walk(doc, *kid, Some(&node), seen, depth + 1);
        }
    }
}

/// Action of a signature field lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    /// Only the listed fields are locked.
    Include,
    /// Every field except the listed ones is locked.
    Exclude,
    All,
}

impl LockAction {
    pub fn as_name(&self) -> &'static str {
        match self {
            LockAction::Include => "Include",
            LockAction::Exclude => "Exclude",
            LockAction::All => "All",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"Include" => Some(LockAction::Include),
            b"Exclude" => Some(LockAction::Exclude),
            b"All" => Some(LockAction::All),
            _ => None,
        }
    }
}

/// `/Lock` dictionary of a signature field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigFieldLock {
    pub action: LockAction,
    /// Ordered field names, empty for [`LockAction::All`].
    pub fields: Vec<String>,
}

impl SigFieldLock {
    pub fn include(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            action: LockAction::Include,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_object(doc: &Document, obj: &Object) -> Result<Self, String> {
        let dict = deref_dict(doc, obj).ok_or("/Lock is not a dictionary")?;
        let action = dict
            .get(b"Action")
            .ok()
            .and_then(|a| a.as_name().ok())
            .ok_or("/Lock has no /Action name")?;
        let action = LockAction::from_name(action).ok_or_else(|| {
            format!(
                "/Lock /Action /{} is not Include, Exclude or All",
                String::from_utf8_lossy(action)
            )
        })?;

        let fields = match dict.get(b"Fields") {
            Ok(fields) => doc
                .dereference(fields)
                .ok()
                .and_then(|(_, f)| f.as_array().ok())
                .ok_or("/Lock /Fields is not an array")?
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(decode_text_string)
                        .map_err(|_| "/Lock /Fields holds a non-string entry".to_string())
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) if action == LockAction::All => Vec::new(),
            Err(_) => return Err(format!("/Lock /Action /{} needs /Fields", action.as_name())),
        };

        Ok(Self { action, fields })
    }

    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.set("Type", Object::Name(b"SigFieldLock".to_vec()));
        dict.set("Action", Object::Name(self.action.as_name().into()));
        if self.action != LockAction::All {
            dict.set("Fields", self.fields_array());
        }
        dict
    }

    pub(crate) fn fields_array(&self) -> Object {
        Object::Array(self.fields.iter().map(|f| encode_text_string(f)).collect())
    }

    /// True when a change to `field` after signing invalidates the signature.
    pub fn covers(&self, field: &str) -> bool {
        let listed = self.fields.iter().any(|f| f == field);
        match self.action {
            LockAction::Include => listed,
            LockAction::Exclude => !listed,
            LockAction::All => true,
        }
    }
}

/// DocMDP permission level of a certification signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificationLevel {
    NoChanges,
    FormFilling,
    FormFillingAndAnnotations,
}

impl CertificationLevel {
    /// The `/P` value of the DocMDP transform parameters.
    pub fn permission(&self) -> i64 {
        match self {
            CertificationLevel::NoChanges => 1,
            CertificationLevel::FormFilling => 2,
            CertificationLevel::FormFillingAndAnnotations => 3,
        }
    }

    pub fn from_permission(p: i64) -> Option<Self> {
        match p {
            1 => Some(CertificationLevel::NoChanges),
            2 => Some(CertificationLevel::FormFilling),
            3 => Some(CertificationLevel::FormFillingAndAnnotations),
            _ => None,
        }
    }

    /// Whether later approval signatures keep the certification valid.
    pub fn allows_signing(&self) -> bool {
        *self != CertificationLevel::NoChanges
    }
}

/// The certification signature registered in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Certification {
    pub signature: Option<ObjectId>,
    /// `None` when `/P` is outside 1..=3.
    pub level: Option<CertificationLevel>,
}

/// Reads `/Perms /DocMDP` from the catalog.
pub fn certification(doc: &Document) -> Option<Certification> {
    let catalog = doc.catalog().ok()?;
    let perms = deref_dict(doc, catalog.get(b"Perms").ok()?)?;
    let docmdp = perms.get(b"DocMDP").ok()?;
    let signature = docmdp.as_reference().ok();
    let level = deref_dict(doc, docmdp).and_then(|sig| docmdp_permission(doc, sig));
    Some(Certification {
        signature,
        level: level.and_then(CertificationLevel::from_permission),
    })
}

/// `/P` of the DocMDP transform in a signature dictionary's `/Reference`.
pub(crate) fn docmdp_permission(doc: &Document, sig: &Dictionary) -> Option<i64> {
    let references = sig
        .get(b"Reference")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, r)| r.as_array().ok())?;
    references
        .iter()
        .filter_map(|r| deref_dict(doc, r))
        .find(|r| {
            r.get(b"TransformMethod")
                .ok()
                .and_then(|m| m.as_name().ok())
                == Some(b"DocMDP".as_slice())
        })
        .map(|r| {
            r.get(b"TransformParams")
                .ok()
                .and_then(|p| deref_dict(doc, p))
                .and_then(|p| p.get(b"P").ok())
                .and_then(|p| p.as_i64().ok())
                .unwrap_or(2)
        })
}

pub(crate) fn acro_form(doc: &Document) -> Option<&Dictionary> {
    let catalog = doc.catalog().ok()?;
    deref_dict(doc, catalog.get(b"AcroForm").ok()?)
}

pub(crate) fn deref_dict<'d>(doc: &'d Document, obj: &'d Object) -> Option<&'d Dictionary> {
    doc.dereference(obj).ok()?.1.as_dict().ok()
}

pub(crate) fn name_of(obj: &Object) -> Option<String> {
    obj.as_name()
        .ok()
        .map(|n| String::from_utf8_lossy(n).into_owned())
}

pub(crate) fn is_widget(dict: &Dictionary) -> bool {
    dict.get(b"Subtype").ok().and_then(|s| s.as_name().ok()) == Some(b"Widget".as_slice())
}

/// `[x0 y0 x1 y1]`, following references.
pub(crate) fn rect_of(doc: &Document, obj: &Object) -> Option<[f32; 4]> {
    doc.dereference(obj)
        .ok()?
        .1
        .as_array()
        .ok()?
        .iter()
        .map(|r| doc.dereference(r).and_then(|(_, r)| r.as_float()))
        .collect::<lopdf::Result<ExactArrayOrNone<f32, 4>>>()
        .ok()?
        .0
}

/// One-based page number of every page object.
pub(crate) fn page_numbers(doc: &Document) -> HashMap<ObjectId, u32> {
    doc.get_pages()
        .into_iter()
        .map(|(number, id)| (id, number))
        .collect()
}

/// `/MediaBox` of a page, inherited through the page tree.
pub(crate) fn media_box(doc: &Document, page: ObjectId) -> Option<[f32; 4]> {
    let mut id = page;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        let dict = doc.get_dictionary(id).ok()?;
        if let Ok(mbox) = dict.get(b"MediaBox") {
            return rect_of(doc, mbox);
        }
        id = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

/// Decodes a PDF text string: UTF-16BE with a byte order mark, otherwise
/// one byte per character.
pub fn decode_text_string(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Inverse of [`decode_text_string`].
pub fn encode_text_string(text: &str) -> Object {
    if text.chars().all(|c| (c as u32) < 0x80) {
        Object::String(text.as_bytes().to_vec(), StringFormat::Literal)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        bytes.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
        Object::String(bytes, StringFormat::Literal)
    }
}
