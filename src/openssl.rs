//! Optional OpenSSL module for producing signatures.
//!
//! This module provides an OpenSSL-based implementation of the signer. See
//! [`OpenSslSigner`]. It is enabled by the `openssl` feature.

use anyhow::Context;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;

/// OpenSSL implementation of the signer.
pub struct OpenSslSigner {
    certificate: X509,
    private_key: PKey<Private>,
    chain: Stack<X509>,
}

impl OpenSslSigner {
    /// Creates a new signer from the signing certificate, its private key and
    /// the intermediary certificates to embed in the signature.
    pub fn new(certificate: X509, private_key: PKey<Private>, chain: Stack<X509>) -> Self {
        Self {
            certificate,
            private_key,
            chain,
        }
    }

    /// Loads the key and certificates from a DER encoded PKCS #12 keystore.
    pub fn from_pkcs12(der: &[u8], password: &str) -> anyhow::Result<Self> {
        let parsed = Pkcs12::from_der(der)
            .context("keystore is not PKCS #12")?
            .parse2(password)
            .context("can not open keystore")?;
        let private_key = parsed.pkey.context("keystore holds no private key")?;
        let certificate = parsed.cert.context("keystore holds no certificate")?;
        let chain = match parsed.ca {
            Some(chain) => chain,
            None => Stack::new()?,
        };
        Ok(Self::new(certificate, private_key, chain))
    }

    /// Common name of the signing certificate's subject.
    pub fn common_name(&self) -> Option<String> {
        self.certificate
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().to_string().ok())
    }
}

impl crate::Pkcs7Signer for OpenSslSigner {
    /// Produces a detached PKCS #7 signature, DER encoded.
    fn sign(&self, signed_data: [&[u8]; 2]) -> anyhow::Result<Vec<u8>> {
        // Unfortunately OpenSSL requires a contiguous array of bytes to sign,
        // so we must allocate and copy the slices.
        let mut contiguous = Vec::with_capacity(signed_data[0].len() + signed_data[1].len());
        contiguous.extend_from_slice(signed_data[0]);
        contiguous.extend_from_slice(signed_data[1]);

        let pkcs7 = Pkcs7::sign(
            &self.certificate,
            &self.private_key,
            &self.chain,
            &contiguous,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )?;
        Ok(pkcs7.to_der()?)
    }
}
