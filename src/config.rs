//! Configuration of the expected signature shape and the form layout.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Where a signature widget goes when the field has to be injected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignaturePlacement {
    /// Fully qualified name of the signature field.
    pub field_name: String,
    /// One-based page number.
    pub page: u32,
    /// `[x0 y0 x1 y1]` in default user space.
    pub rect: [f32; 4],
}

/// One signable row of the form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSpec {
    pub signature_field: String,
    /// Text fields frozen by this row's signature.
    pub fill_fields: Vec<String>,
    pub page: u32,
    pub rect: [f32; 4],
}

impl RowSpec {
    pub fn placement(&self) -> SignaturePlacement {
        SignaturePlacement {
            field_name: self.signature_field.clone(),
            page: self.page,
            rect: self.rect,
        }
    }
}

/// The rows of the form, numbered from 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowLayout {
    pub rows: Vec<RowSpec>,
}

impl RowLayout {
    /// `count` rows stacked upwards from `first_rect`, `pitch` units apart.
    ///
    /// Row `k` has the signature field `sig_row_k` and the fill-in fields
    /// `row_k_<suffix>` for each of `fill_suffixes`.
    pub fn uniform(
        count: usize,
        page: u32,
        first_rect: [f32; 4],
        pitch: f32,
        fill_suffixes: &[&str],
    ) -> Self {
        let rows = (1..=count)
            .map(|k| {
                let dy = pitch * (k - 1) as f32;
                let [x0, y0, x1, y1] = first_rect;
                RowSpec {
                    signature_field: format!("sig_row_{k}"),
                    fill_fields: fill_suffixes
                        .iter()
                        .map(|suffix| format!("row_{k}_{suffix}"))
                        .collect(),
                    page,
                    rect: [x0, y0 + dy, x1, y1 + dy],
                }
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row with one-based index `index`.
    pub fn row(&self, index: usize) -> Option<&RowSpec> {
        index.checked_sub(1).and_then(|i| self.rows.get(i))
    }

    /// The row whose signature field is `name`, with its one-based index.
    pub fn row_for_signature_field(&self, name: &str) -> Option<(usize, &RowSpec)> {
        self.rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.signature_field == name)
            .map(|(i, row)| (i + 1, row))
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `/Filter` every signature dictionary must carry.
    pub expected_filter: String,
    /// `/SubFilter` written into new signatures.
    pub sub_filter: String,
    /// `/SubFilter` values accepted when validating.
    pub accepted_sub_filters: Vec<String>,
    /// Reserved size of `/Contents`, in bytes before hex encoding.
    pub contents_capacity: usize,
    /// Allowed distance between a row widget rectangle and its layout.
    pub rect_tolerance: f32,
    pub rows: RowLayout,
    pub certification: SignaturePlacement,
    pub reason: Option<String>,
    pub location: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            expected_filter: "Adobe.PPKLite".into(),
            sub_filter: "adbe.pkcs7.detached".into(),
            accepted_sub_filters: vec!["adbe.pkcs7.detached".into(), "ETSI.CAdES.detached".into()],
            contents_capacity: 8192,
            rect_tolerance: 0.5,
            rows: RowLayout::uniform(4, 1, [100.0, 100.0, 220.0, 130.0], 50.0, &["name", "date"]),
            certification: SignaturePlacement {
                field_name: "certification".into(),
                page: 1,
                rect: [400.0, 700.0, 560.0, 740.0],
            },
            reason: None,
            location: None,
        }
    }

    /// Loads a configuration from a JSON file. Missing keys take their
    /// default value.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn with_rows(mut self, rows: RowLayout) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_contents_capacity(mut self, capacity: usize) -> Self {
        self.contents_capacity = capacity;
        self
    }

    pub fn with_certification(mut self, placement: SignaturePlacement) -> Self {
        self.certification = placement;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn accepts_sub_filter(&self, sub_filter: &[u8]) -> bool {
        self.accepted_sub_filters
            .iter()
            .any(|accepted| accepted.as_bytes() == sub_filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_rows() {
        let layout = RowLayout::uniform(3, 2, [10.0, 20.0, 110.0, 40.0], 30.0, &["name"]);
        assert_eq!(layout.len(), 3);
        assert!(layout.row(0).is_none());
        assert!(layout.row(4).is_none());

        let third = layout.row(3).unwrap();
        assert_eq!(third.signature_field, "sig_row_3");
        assert_eq!(third.fill_fields, ["row_3_name"]);
        assert_eq!(third.rect, [10.0, 80.0, 110.0, 100.0]);
        assert_eq!(third.page, 2);

        let (index, row) = layout.row_for_signature_field("sig_row_2").unwrap();
        assert_eq!(index, 2);
        assert_eq!(row.rect[1], 50.0);
    }

    #[test]
    fn test_partial_json() {
        let config: Config =
            serde_json::from_str(r#"{ "contents_capacity": 4096, "reason": "approved" }"#).unwrap();
        assert_eq!(config.contents_capacity, 4096);
        assert_eq!(config.reason.as_deref(), Some("approved"));
        assert_eq!(config.expected_filter, "Adobe.PPKLite");
        assert_eq!(config.rows.len(), 4);
        assert!(config.accepts_sub_filter(b"ETSI.CAdES.detached"));
        assert!(!config.accepts_sub_filter(b"adbe.x509.rsa_sha1"));
    }
}
