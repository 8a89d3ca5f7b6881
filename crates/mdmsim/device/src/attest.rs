//! Operator-supplied attestation CA.
//!
//! Signs the fake Apple-style attestation leaf certificates presented
//! during the ACME device-attest-01 challenge. The CA certificate and
//! key are loaded from PEM files at process start; the key may be a
//! password-encrypted PKCS#8 blob.

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::WrapErr as _;
use der::asn1::BitString;
use der::{Decode as _, Encode as _};
use pkcs8::DecodePrivateKey as _;
use rand::rngs::OsRng;
use rand::RngCore as _;
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate;

use crate::csr;
use crate::keychain::DeviceKey;

const LEAF_VALIDITY: Duration = Duration::from_secs(3600);

/// The attestation CA: a certificate plus its signing key. Read-only and
/// shareable across devices.
pub struct AttestationCa {
    cert: Certificate,
    key: DeviceKey,
}

impl AttestationCa {
    /// Load the CA from PEM files. `key_password` decrypts an encrypted
    /// PKCS#8 key and is ignored for unencrypted keys.
    pub fn load(
        cert_path: &Path,
        key_path: &Path,
        key_password: &str,
    ) -> color_eyre::eyre::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .wrap_err_with(|| format!("failed reading ca certificate {}", cert_path.display()))?;
        let cert_der = parse_pem_tag(&cert_pem, "CERTIFICATE")?;
        let cert = Certificate::from_der(&cert_der).wrap_err("failed parsing ca certificate")?;

        let key_pem = std::fs::read_to_string(key_path)
            .wrap_err_with(|| format!("failed reading ca key {}", key_path.display()))?;
        let key = parse_private_key_pem(&key_pem, key_password)?;

        Ok(Self { cert, key })
    }

    /// Build an [`AttestationCa`] from already-loaded materials.
    pub fn new(cert: Certificate, key: DeviceKey) -> Self {
        Self { cert, key }
    }

    /// Sign a leaf described by subject, public key and raw extensions;
    /// returns the two-certificate chain `[leaf, ca]`.
    pub fn sign_leaf(
        &self,
        subject: Name,
        spki: SubjectPublicKeyInfoOwned,
        extensions: Vec<Extension>,
    ) -> color_eyre::eyre::Result<Vec<Certificate>> {
        let mut serial_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut serial_bytes);
        serial_bytes[0] &= 0x7f;

        let algorithm = csr::signature_algorithm(&self.key);
        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&serial_bytes)
                .wrap_err("failed building leaf serial")?,
            signature: algorithm.clone(),
            issuer: self.cert.tbs_certificate.subject.clone(),
            validity: Validity::from_now(LEAF_VALIDITY)
                .wrap_err("failed building leaf validity")?,
            subject,
            subject_public_key_info: spki,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(extensions),
        };

        let tbs_der = tbs.to_der().wrap_err("failed encoding leaf certificate")?;
        let signature = csr::sign_der(&self.key, &tbs_der)?;

        let leaf = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature)
                .wrap_err("failed wrapping leaf signature")?,
        };

        Ok(vec![leaf, self.cert.clone()])
    }
}

fn parse_pem_tag(pem_str: &str, tag: &str) -> color_eyre::eyre::Result<Vec<u8>> {
    let parsed = pem::parse(pem_str)
        .map_err(|e| color_eyre::eyre::eyre!("failed to parse PEM: {e}"))?;
    if parsed.tag() != tag {
        color_eyre::eyre::bail!("PEM is not a {tag}, got: {}", parsed.tag());
    }
    Ok(parsed.into_contents())
}

fn parse_private_key_pem(pem_str: &str, password: &str) -> color_eyre::eyre::Result<DeviceKey> {
    let parsed = pem::parse(pem_str)
        .map_err(|e| color_eyre::eyre::eyre!("failed to parse key PEM: {e}"))?;

    match parsed.tag() {
        "ENCRYPTED PRIVATE KEY" => {
            if let Ok(key) =
                rsa::RsaPrivateKey::from_pkcs8_encrypted_der(parsed.contents(), password)
            {
                return Ok(DeviceKey::Rsa(key));
            }
            let key = p256::SecretKey::from_pkcs8_encrypted_der(parsed.contents(), password)
                .wrap_err("failed decrypting ca key")?;
            Ok(DeviceKey::P256(key))
        }
        "PRIVATE KEY" => {
            if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(parsed.contents()) {
                return Ok(DeviceKey::Rsa(key));
            }
            let key = p256::SecretKey::from_pkcs8_der(parsed.contents())
                .wrap_err("failed parsing ca key")?;
            Ok(DeviceKey::P256(key))
        }
        "RSA PRIVATE KEY" => Ok(DeviceKey::Rsa(
            rsa::RsaPrivateKey::from_pkcs1_der(parsed.contents())
                .wrap_err("failed parsing RSA ca key")?,
        )),
        "EC PRIVATE KEY" => Ok(DeviceKey::P256(
            p256::SecretKey::from_sec1_der(parsed.contents())
                .wrap_err("failed parsing EC ca key")?,
        )),
        other => color_eyre::eyre::bail!("unsupported ca key PEM tag: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn test_ca() -> AttestationCa {
        // self-signed CA assembled with the same manual TBS path the leaf
        // signing uses
        let key = DeviceKey::P256(p256::SecretKey::random(&mut OsRng));
        let subject = Name::from_str("CN=Fake Attestation CA,O=mdmsim").unwrap();
        let spki = csr::public_key_info(&key).unwrap();

        let algorithm = csr::signature_algorithm(&key);
        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&[1]).unwrap(),
            signature: algorithm.clone(),
            issuer: subject.clone(),
            validity: Validity::from_now(Duration::from_secs(86400)).unwrap(),
            subject,
            subject_public_key_info: spki,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };
        let tbs_der = tbs.to_der().unwrap();
        let signature = csr::sign_der(&key, &tbs_der).unwrap();
        let cert = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature).unwrap(),
        };
        AttestationCa::new(cert, key)
    }

    #[test]
    fn test_sign_leaf_chain() {
        let ca = test_ca();
        let leaf_key = DeviceKey::P256(p256::SecretKey::random(&mut OsRng));
        let spki = csr::public_key_info(&leaf_key).unwrap();
        let subject = Name::from_str("CN=fake attestation cert").unwrap();

        let chain = ca.sign_leaf(subject, spki.clone(), Vec::new()).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain[0].tbs_certificate.issuer,
            ca.cert.tbs_certificate.subject
        );
        assert_eq!(chain[0].tbs_certificate.subject_public_key_info, spki);
        assert_eq!(chain[1].tbs_certificate, ca.cert.tbs_certificate);
    }
}
