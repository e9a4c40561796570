//! In-memory fixtures shared by the unit tests.

use std::collections::BTreeMap;

use lopdf::xref::XrefType;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use crate::{Config, Coordinator, CryptoContext, FormField, Pkcs7Signer, RowLayout};

/// Builder of an unsigned one-page template with signable rows.
pub(crate) struct Template {
    layout: RowLayout,
    signature_fields: bool,
    hierarchy: Option<String>,
    classic_xref: bool,
}

impl Template {
    /// `count` rows laid out like [`Config::new`] lays out its rows.
    pub(crate) fn rows(count: usize) -> Self {
        Self {
            layout: RowLayout::uniform(count, 1, [100.0, 100.0, 220.0, 130.0], 50.0, &["name", "date"]),
            signature_fields: true,
            hierarchy: None,
            classic_xref: false,
        }
    }

    /// Leaves the signature fields out, so they have to be injected.
    pub(crate) fn without_signature_fields(mut self) -> Self {
        self.signature_fields = false;
        self
    }

    /// Adds a non-terminal field `parent` with one signature kid `sig` whose
    /// widget is a separate object.
    pub(crate) fn with_hierarchy(mut self, parent: &str) -> Self {
        self.hierarchy = Some(parent.to_string());
        self
    }

    /// Saves with a classic `xref` table instead of a cross-reference stream.
    pub(crate) fn with_classic_xref(mut self) -> Self {
        self.classic_xref = true;
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let page_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            b"BT /Helv 12 Tf 72 720 Td (Inspection log) Tj ET".to_vec(),
        ));

        let mut annots: Vec<Object> = Vec::new();
        let mut fields: Vec<Object> = Vec::new();
        for row in &self.layout.rows {
            let [_, y0, _, y1] = row.rect;
            for (i, name) in row.fill_fields.iter().enumerate() {
                let x0 = 240 + 120 * i as i64;
                let id = doc.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Widget",
                    "FT" => "Tx",
                    "T" => Object::string_literal(name.as_str()),
                    "Rect" => vec![x0.into(), (y0 as i64).into(), (x0 + 110).into(), (y1 as i64).into()],
                    "F" => 4,
                    "P" => page_id,
                    "DA" => Object::string_literal("/Helv 10 Tf 0 g"),
                });
                annots.push(id.into());
                fields.push(id.into());
            }
            if self.signature_fields {
                let appearance = blank_appearance(&mut doc, row.rect);
                let id = doc.add_object(dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Widget",
                    "FT" => "Sig",
                    "T" => Object::string_literal(row.signature_field.as_str()),
                    "Rect" => rect_object(row.rect),
                    "F" => 4,
                    "P" => page_id,
                    "AP" => dictionary! { "N" => appearance },
                });
                annots.push(id.into());
                fields.push(id.into());
            }
        }

        if let Some(parent) = &self.hierarchy {
            let parent_id = doc.new_object_id();
            let kid_id = doc.new_object_id();
            let rect = [300.0, 600.0, 420.0, 630.0];
            let appearance = blank_appearance(&mut doc, rect);
            let widget_id = doc.add_object(dictionary! {
                "Type" => "Annot",
                "Subtype" => "Widget",
                "Parent" => kid_id,
                "Rect" => rect_object(rect),
                "F" => 4,
                "P" => page_id,
                "AP" => dictionary! { "N" => appearance },
            });
            doc.objects.insert(
                kid_id,
                Object::Dictionary(dictionary! {
                    "FT" => "Sig",
                    "T" => Object::string_literal("sig"),
                    "Parent" => parent_id,
                    "Kids" => vec![widget_id.into()],
                }),
            );
            doc.objects.insert(
                parent_id,
                Object::Dictionary(dictionary! {
                    "T" => Object::string_literal(parent.as_str()),
                    "Kids" => vec![kid_id.into()],
                }),
            );
            annots.push(widget_id.into());
            fields.push(parent_id.into());
        }

        doc.objects.insert(
            page_id,
            Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! { "Font" => dictionary! { "Helv" => font_id } },
                "Annots" => annots,
            }),
        );
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let acro_form_id = doc.add_object(dictionary! {
            "Fields" => fields,
            "DA" => Object::string_literal("/Helv 0 Tf 0 g"),
            "DR" => dictionary! { "Font" => dictionary! { "Helv" => font_id } },
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
            "AcroForm" => acro_form_id,
        });
        doc.trailer.set("Root", catalog_id);
        if self.classic_xref {
            doc.reference_table.cross_reference_type = XrefType::CrossReferenceTable;
        }

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }
}

fn blank_appearance(doc: &mut Document, [x0, y0, x1, y1]: [f32; 4]) -> ObjectId {
    let bbox = vec![0.into(), 0.into(), Object::Real(x1 - x0), Object::Real(y1 - y0)];
    doc.add_object(Stream::new(
        dictionary! { "Type" => "XObject", "Subtype" => "Form", "BBox" => bbox },
        Vec::new(),
    ))
}

fn rect_object(rect: [f32; 4]) -> Vec<Object> {
    rect.iter().map(|&v| Object::Real(v)).collect()
}

/// Signer returning a fixed, DER-looking blob.
pub(crate) struct FakeSigner;

impl Pkcs7Signer for FakeSigner {
    fn sign(&self, signed_data: [&[u8]; 2]) -> anyhow::Result<Vec<u8>> {
        let covered = (signed_data[0].len() + signed_data[1].len()) as u32;
        let mut blob = vec![0x30, 0x82, 0x01, 0x00];
        blob.extend_from_slice(&covered.to_be_bytes());
        blob.resize(260, 0xA5);
        Ok(blob)
    }
}

/// Signer whose key can not be used.
pub(crate) struct LockedKeySigner;

impl Pkcs7Signer for LockedKeySigner {
    fn sign(&self, _signed_data: [&[u8]; 2]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("private key is locked"))
    }
}

pub(crate) fn config() -> Config {
    Config::new().with_contents_capacity(1024)
}

pub(crate) fn coordinator() -> Coordinator {
    Coordinator::new(config(), CryptoContext::new(FakeSigner).with_signer_name("Test Signer"))
}

/// Looks up the object of a named field in a parsed document.
pub(crate) fn field_id(doc: &Document, name: &str) -> ObjectId {
    crate::form::FormTree::read(doc).find(name).unwrap().id()
}

pub(crate) fn page_dict_mut(doc: &mut Document) -> &mut Dictionary {
    let page = *doc.get_pages().get(&1).unwrap();
    doc.get_object_mut(page).unwrap().as_dict_mut().unwrap()
}

pub(crate) fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
