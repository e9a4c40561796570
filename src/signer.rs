//! The signing seam and the context carrying everything a signature needs.

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Produces a detached CMS/PKCS #7 signature over the two signed spans of a
/// document.
///
/// The spans are passed separately because they are not contiguous in the
/// file. The returned bytes are the DER encoding of the signature.
pub trait Pkcs7Signer {
    fn sign(&self, signed_data: [&[u8]; 2]) -> anyhow::Result<Vec<u8>>;
}

/// Signer, signer identity and signing time, built explicitly by the caller
/// and passed into every signing operation.
pub struct CryptoContext {
    signer: Box<dyn Pkcs7Signer + Send + Sync>,
    signer_name: Option<String>,
    signing_time: DateTime<Utc>,
}

impl CryptoContext {
    /// A context signing with `signer` at the current time.
    pub fn new(signer: impl Pkcs7Signer + Send + Sync + 'static) -> Self {
        Self {
            signer: Box::new(signer),
            signer_name: None,
            signing_time: Utc::now(),
        }
    }

    /// Name written into `/Name` of the signature dictionary.
    pub fn with_signer_name(mut self, name: impl Into<String>) -> Self {
        self.signer_name = Some(name.into());
        self
    }

    pub fn with_signing_time(mut self, time: DateTime<Utc>) -> Self {
        self.signing_time = time;
        self
    }

    pub fn signer_name(&self) -> Option<&str> {
        self.signer_name.as_deref()
    }

    pub fn signing_time(&self) -> DateTime<Utc> {
        self.signing_time
    }

    /// The signing time as a PDF date string, for `/M`.
    pub fn pdf_date(&self) -> String {
        self.signing_time
            .format("D:%Y%m%d%H%M%S+00'00'")
            .to_string()
    }

    pub(crate) fn sign(&self, signed_data: [&[u8]; 2]) -> Result<Vec<u8>> {
        self.signer.sign(signed_data).map_err(Error::KeyMaterial)
    }
}
