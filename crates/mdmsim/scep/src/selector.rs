//! Recipient certificate selection.

use color_eyre::eyre::WrapErr as _;
use der::Encode as _;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

/// Picks which of the CA/RA certificates a PKCSReq is addressed to.
#[derive(Debug, Clone)]
pub enum CertsSelector {
    /// Accept every certificate the CA returned.
    Nop,
    /// Accept only certificates matching a fingerprint. The hash is
    /// inferred from the fingerprint length: 16 bytes MD5, 20 bytes
    /// SHA-1, 32 bytes SHA-256.
    Fingerprint(Vec<u8>),
}

impl CertsSelector {
    /// Build a selector from a configured fingerprint. An empty
    /// fingerprint selects everything.
    pub fn from_fingerprint(fingerprint: &[u8]) -> color_eyre::eyre::Result<Self> {
        match fingerprint.len() {
            0 => Ok(Self::Nop),
            16 | 20 | 32 => Ok(Self::Fingerprint(fingerprint.to_vec())),
            n => color_eyre::eyre::bail!("unsupported scep fingerprint length: {n}"),
        }
    }

    /// Filter the candidate certificates.
    pub fn select(&self, certs: &[Certificate]) -> color_eyre::eyre::Result<Vec<Certificate>> {
        match self {
            Self::Nop => Ok(certs.to_vec()),
            Self::Fingerprint(fp) => {
                let mut selected = Vec::new();
                for cert in certs {
                    let der = cert.to_der().wrap_err("failed to encode certificate")?;
                    let digest: Vec<u8> = match fp.len() {
                        16 => Md5::digest(&der).to_vec(),
                        20 => Sha1::digest(&der).to_vec(),
                        32 => Sha256::digest(&der).to_vec(),
                        n => color_eyre::eyre::bail!("unsupported scep fingerprint length: {n}"),
                    };
                    if digest == *fp {
                        selected.push(cert.clone());
                    }
                }
                Ok(selected)
            }
        }
    }
}
