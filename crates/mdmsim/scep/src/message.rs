//! SCEP PKI message construction and parsing.

use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut as _, KeyIvInit as _};
use cms::builder::{
    ContentEncryptionAlgorithm, EnvelopedDataBuilder, KeyTransRecipientInfoBuilder,
    SignedDataBuilder, SignerInfoBuilder,
};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::ContentInfo;
use cms::enveloped_data::{EnvelopedData, RecipientIdentifier, RecipientInfo};
use cms::signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier};
use color_eyre::eyre::WrapErr as _;
use const_oid::ObjectIdentifier;
use der::asn1::{OctetString, PrintableStringRef, SetOfVec};
use der::{Any, Decode as _, Encode as _, Tag};
use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey as _;
use rsa::Pkcs1v15Encrypt;
use sha2::{Digest as _, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;
use x509_cert::Certificate;

/// SCEP attribute OIDs (RFC 8894 §3.2).
pub mod oid {
    use const_oid::ObjectIdentifier;

    /// scep-messageType (2.16.840.1.113733.1.9.2)
    pub const MESSAGE_TYPE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.2");

    /// scep-pkiStatus (2.16.840.1.113733.1.9.3)
    pub const PKI_STATUS: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.3");

    /// scep-failInfo (2.16.840.1.113733.1.9.4)
    pub const FAIL_INFO: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.4");

    /// scep-senderNonce (2.16.840.1.113733.1.9.5)
    pub const SENDER_NONCE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.5");

    /// scep-recipientNonce (2.16.840.1.113733.1.9.6)
    pub const RECIPIENT_NONCE: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.6");

    /// scep-transactionID (2.16.840.1.113733.1.9.7)
    pub const TRANSACTION_ID: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.7");
}

/// messageType value for a PKCSReq message.
const MESSAGE_TYPE_PKCS_REQ: &str = "19";

const OID_AES_128_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.2");
const OID_AES_256_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");

/// pkiStatus of a CertRep message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiStatus {
    /// Request granted; the message carries the issued certificate.
    Success,
    /// Request rejected.
    Failure,
    /// Request pending manual approval.
    Pending,
}

impl PkiStatus {
    fn parse(s: &str) -> color_eyre::eyre::Result<Self> {
        match s {
            "0" => Ok(Self::Success),
            "2" => Ok(Self::Failure),
            "3" => Ok(Self::Pending),
            other => color_eyre::eyre::bail!("unknown pkiStatus: {other}"),
        }
    }
}

/// A parsed CertRep response message.
#[derive(Debug)]
pub struct CertRep {
    /// Response status.
    pub status: PkiStatus,
    /// failInfo attribute value, when present.
    pub fail_info: Option<String>,
    /// Raw encapsulated content (EnvelopedData) when status is success.
    enveloped: Option<Vec<u8>>,
}

/// The transaction identifier for a CSR: hex SHA-256 of its
/// SubjectPublicKeyInfo, stable across retries of the same key.
pub fn transaction_id(csr_der: &[u8]) -> color_eyre::eyre::Result<String> {
    let csr = x509_cert::request::CertReq::from_der(csr_der)
        .wrap_err("failed to parse CSR for transaction ID")?;
    let spki = csr
        .info
        .public_key
        .to_der()
        .wrap_err("failed to encode CSR public key")?;
    Ok(hex_string(&Sha256::digest(&spki)))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn printable_attribute(oid: ObjectIdentifier, value: &str) -> color_eyre::eyre::Result<Attribute> {
    let any = Any::new(Tag::PrintableString, value.as_bytes())
        .wrap_err("failed to encode printable attribute")?;
    let mut values = SetOfVec::new();
    values
        .insert(any)
        .map_err(|e| color_eyre::eyre::eyre!("failed to collect attribute value: {e}"))?;
    Ok(Attribute { oid, values })
}

fn octet_attribute(oid: ObjectIdentifier, value: &[u8]) -> color_eyre::eyre::Result<Attribute> {
    let any = Any::new(Tag::OctetString, value).wrap_err("failed to encode octet attribute")?;
    let mut values = SetOfVec::new();
    values
        .insert(any)
        .map_err(|e| color_eyre::eyre::eyre!("failed to collect attribute value: {e}"))?;
    Ok(Attribute { oid, values })
}

fn issuer_and_serial(cert: &Certificate) -> IssuerAndSerialNumber {
    IssuerAndSerialNumber {
        issuer: cert.tbs_certificate.issuer.clone(),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    }
}

fn sha256_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: const_oid::db::rfc5912::ID_SHA_256,
        parameters: None,
    }
}

/// Build a PKCSReq PKI message: the CSR enveloped to the recipient
/// certificates, signed by the throwaway signer identity with the SCEP
/// authenticated attributes attached.
pub fn build_pkcs_req(
    csr_der: &[u8],
    recipients: &[Certificate],
    signer_cert: &Certificate,
    signer_key: &rsa::RsaPrivateKey,
) -> color_eyre::eyre::Result<Vec<u8>> {
    if recipients.is_empty() {
        color_eyre::eyre::bail!("no recipient certificates for PKCSReq");
    }

    // Envelope the CSR to every recipient.
    let mut envelope_builder = EnvelopedDataBuilder::new(
        None,
        csr_der,
        ContentEncryptionAlgorithm::Aes256Cbc,
        None,
    )
    .map_err(|e| color_eyre::eyre::eyre!("failed to create envelope builder: {e}"))?;

    for recipient in recipients {
        let spki_der = recipient
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .wrap_err("failed to encode recipient public key")?;
        let public_key = rsa::RsaPublicKey::from_public_key_der(&spki_der)
            .wrap_err("recipient certificate does not carry an RSA key")?;

        let rid = RecipientIdentifier::IssuerAndSerialNumber(issuer_and_serial(recipient));
        let recipient_rng: &mut OsRng = Box::leak(Box::new(OsRng));
        let recipient_builder = KeyTransRecipientInfoBuilder::new(
            rid,
            cms::builder::KeyEncryptionInfo::Rsa(public_key),
            recipient_rng,
        )
        .map_err(|e| color_eyre::eyre::eyre!("failed to create recipient info: {e}"))?;

        envelope_builder
            .add_recipient_info(recipient_builder)
            .map_err(|e| color_eyre::eyre::eyre!("failed to add recipient: {e}"))?;
    }

    let enveloped: EnvelopedData = envelope_builder
        .build_with_rng(&mut OsRng)
        .map_err(|e| color_eyre::eyre::eyre!("failed to build enveloped data: {e}"))?;

    let enveloped_ci = ContentInfo {
        content_type: const_oid::db::rfc5911::ID_ENVELOPED_DATA,
        content: Any::encode_from(&enveloped).wrap_err("failed to wrap enveloped data")?,
    };
    let enveloped_der = enveloped_ci
        .to_der()
        .wrap_err("failed to encode enveloped data")?;

    // Sign the envelope with the SCEP attributes as authenticated attributes.
    let encap = EncapsulatedContentInfo {
        econtent_type: const_oid::db::rfc5911::ID_DATA,
        econtent: Some(
            Any::new(Tag::OctetString, enveloped_der)
                .wrap_err("failed to encapsulate enveloped data")?,
        ),
    };

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(signer_key.clone());
    let sid = SignerIdentifier::IssuerAndSerialNumber(issuer_and_serial(signer_cert));

    let mut signer_info =
        SignerInfoBuilder::new(&signing_key, sid, sha256_algorithm(), &encap, None)
            .map_err(|e| color_eyre::eyre::eyre!("failed to create signer info: {e}"))?;

    let mut sender_nonce = [0u8; 16];
    rand::RngCore::fill_bytes(&mut OsRng, &mut sender_nonce);

    for attribute in [
        printable_attribute(oid::TRANSACTION_ID, &transaction_id(csr_der)?)?,
        printable_attribute(oid::MESSAGE_TYPE, MESSAGE_TYPE_PKCS_REQ)?,
        octet_attribute(oid::SENDER_NONCE, &sender_nonce)?,
    ] {
        signer_info
            .add_signed_attribute(attribute)
            .map_err(|e| color_eyre::eyre::eyre!("failed to add signed attribute: {e}"))?;
    }

    let mut builder = SignedDataBuilder::new(&encap);
    let signed = builder
        .add_digest_algorithm(sha256_algorithm())
        .map_err(|e| color_eyre::eyre::eyre!("failed to add digest algorithm: {e}"))?
        .add_certificate(CertificateChoices::Certificate(signer_cert.clone()))
        .map_err(|e| color_eyre::eyre::eyre!("failed to add signer certificate: {e}"))?
        .add_signer_info::<rsa::pkcs1v15::SigningKey<Sha256>, rsa::pkcs1v15::Signature>(
            signer_info,
        )
        .map_err(|e| color_eyre::eyre::eyre!("failed to add signer info: {e}"))?
        .build()
        .map_err(|e| color_eyre::eyre::eyre!("failed to sign PKCSReq: {e}"))?;

    signed.to_der().wrap_err("failed to encode PKCSReq")
}

/// Parse a CertRep PKI message and pull out the status attributes.
pub fn parse_cert_rep(body: &[u8]) -> color_eyre::eyre::Result<CertRep> {
    let ci = ContentInfo::from_der(body).wrap_err("failed to parse PKI message")?;
    if ci.content_type != const_oid::db::rfc5911::ID_SIGNED_DATA {
        color_eyre::eyre::bail!("PKI message is not signed data: {}", ci.content_type);
    }
    let signed = ci
        .content
        .decode_as::<SignedData>()
        .wrap_err("failed to decode signed data")?;

    let signer_info = signed
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| color_eyre::eyre::eyre!("PKI message carries no signer info"))?;

    let mut status = None;
    let mut fail_info = None;
    if let Some(attrs) = &signer_info.signed_attrs {
        for attr in attrs.iter() {
            if attr.oid == oid::PKI_STATUS {
                status = attr_string(attr)?;
            } else if attr.oid == oid::FAIL_INFO {
                fail_info = attr_string(attr)?;
            }
        }
    }

    let status = PkiStatus::parse(
        status
            .as_deref()
            .ok_or_else(|| color_eyre::eyre::eyre!("PKI message carries no pkiStatus"))?,
    )?;

    let enveloped = match &signed.encap_content_info.econtent {
        Some(any) if status == PkiStatus::Success => Some(
            any.decode_as::<OctetString>()
                .wrap_err("failed to decode encapsulated content")?
                .as_bytes()
                .to_vec(),
        ),
        _ => None,
    };

    Ok(CertRep {
        status,
        fail_info,
        enveloped,
    })
}

fn attr_string(attr: &Attribute) -> color_eyre::eyre::Result<Option<String>> {
    let Some(any) = attr.values.iter().next() else {
        return Ok(None);
    };
    let s = any
        .decode_as::<PrintableStringRef<'_>>()
        .wrap_err("attribute value is not a printable string")?;
    Ok(Some(s.to_string()))
}

impl CertRep {
    /// Decrypt the enveloped response with the throwaway signer identity
    /// and return the issued leaf certificate.
    pub fn decrypt_certificate(
        &self,
        signer_cert: &Certificate,
        signer_key: &rsa::RsaPrivateKey,
    ) -> color_eyre::eyre::Result<Certificate> {
        let enveloped_der = self
            .enveloped
            .as_deref()
            .ok_or_else(|| color_eyre::eyre::eyre!("CertRep has no enveloped content"))?;

        let ci = ContentInfo::from_der(enveloped_der)
            .wrap_err("failed to parse enveloped content info")?;
        if ci.content_type != const_oid::db::rfc5911::ID_ENVELOPED_DATA {
            color_eyre::eyre::bail!("response content is not enveloped data");
        }
        let enveloped = ci
            .content
            .decode_as::<EnvelopedData>()
            .wrap_err("failed to decode enveloped data")?;

        // Find the recipient info addressed to our signer identity.
        let our_id = issuer_and_serial(signer_cert);
        let mut cek = None;
        for ri in enveloped.recip_infos.0.iter() {
            let RecipientInfo::Ktri(ktri) = ri else {
                continue;
            };
            if let RecipientIdentifier::IssuerAndSerialNumber(ias) = &ktri.rid {
                if ias != &our_id {
                    continue;
                }
            }
            cek = Some(
                signer_key
                    .decrypt(Pkcs1v15Encrypt, ktri.enc_key.as_bytes())
                    .wrap_err("failed to unwrap content encryption key")?,
            );
            break;
        }
        let cek = cek.ok_or_else(|| {
            color_eyre::eyre::eyre!("no recipient info addressed to the signer identity")
        })?;

        let eci = &enveloped.encrypted_content;
        let ciphertext = eci
            .encrypted_content
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("enveloped data has no encrypted content"))?
            .as_bytes();
        let iv = eci
            .content_enc_alg
            .parameters
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("content encryption has no IV parameter"))?
            .decode_as::<OctetString>()
            .wrap_err("failed to decode content encryption IV")?;

        let plaintext = match eci.content_enc_alg.oid {
            OID_AES_256_CBC => cbc::Decryptor::<aes::Aes256>::new_from_slices(&cek, iv.as_bytes())
                .map_err(|e| color_eyre::eyre::eyre!("bad AES-256 key or IV: {e}"))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| color_eyre::eyre::eyre!("failed to decrypt content: {e}"))?,
            OID_AES_128_CBC => cbc::Decryptor::<aes::Aes128>::new_from_slices(&cek, iv.as_bytes())
                .map_err(|e| color_eyre::eyre::eyre!("bad AES-128 key or IV: {e}"))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| color_eyre::eyre::eyre!("failed to decrypt content: {e}"))?,
            other => color_eyre::eyre::bail!("unsupported content encryption algorithm: {other}"),
        };

        // The plaintext is a degenerate certs-only signed data carrying the
        // issued certificate.
        extract_first_certificate(&plaintext)
    }
}

fn extract_first_certificate(degenerate_der: &[u8]) -> color_eyre::eyre::Result<Certificate> {
    let ci = ContentInfo::from_der(degenerate_der)
        .wrap_err("failed to parse degenerate certificate bundle")?;
    let signed = ci
        .content
        .decode_as::<SignedData>()
        .wrap_err("failed to decode degenerate signed data")?;

    let certs = signed
        .certificates
        .as_ref()
        .ok_or_else(|| color_eyre::eyre::eyre!("degenerate bundle carries no certificates"))?;

    for choice in certs.0.iter() {
        if let CertificateChoices::Certificate(cert) = choice {
            return Ok(cert.clone());
        }
    }
    color_eyre::eyre::bail!("degenerate bundle carries no certificates")
}

/// Parse a degenerate PKCS#7 certs-only bundle into its certificates.
pub fn parse_degenerate_certs(body: &[u8]) -> color_eyre::eyre::Result<Vec<Certificate>> {
    let ci = ContentInfo::from_der(body).wrap_err("failed to parse certificate bundle")?;
    let signed = ci
        .content
        .decode_as::<SignedData>()
        .wrap_err("failed to decode certificate bundle")?;

    let mut certs = Vec::new();
    if let Some(set) = &signed.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certs.push(cert.clone());
            }
        }
    }
    Ok(certs)
}

/// Base64url-encode a PKI message for GET transport.
pub fn encode_for_get(message: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pki_status_parse() {
        assert_eq!(PkiStatus::parse("0").unwrap(), PkiStatus::Success);
        assert_eq!(PkiStatus::parse("2").unwrap(), PkiStatus::Failure);
        assert_eq!(PkiStatus::parse("3").unwrap(), PkiStatus::Pending);
        assert!(PkiStatus::parse("1").is_err());
    }

    #[test]
    fn test_printable_attribute() {
        let attr = printable_attribute(oid::MESSAGE_TYPE, "19").unwrap();
        assert_eq!(attr.oid, oid::MESSAGE_TYPE);
        assert_eq!(attr_string(&attr).unwrap().as_deref(), Some("19"));
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x00, 0xab, 0x0f]), "00ab0f");
    }
}
