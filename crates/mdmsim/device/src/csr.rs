//! Certificate request construction shared by the SCEP and ACME flows.

use color_eyre::eyre::WrapErr as _;
use const_oid::ObjectIdentifier;
use der::asn1::{BitString, OctetString, SetOfVec};
use der::{Any, Decode as _, Encode as _, Tag};
use sha2::Sha256;
use signature::SignatureEncoding as _;
use signature::Signer as _;
use spki::{AlgorithmIdentifierOwned, EncodePublicKey as _};
use x509_cert::attr::{Attribute, AttributeTypeAndValue};
use x509_cert::ext::pkix::name::{GeneralName, OtherName};
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::request::{CertReq, CertReqInfo, Version};
use x509_cert::spki::SubjectPublicKeyInfoOwned;

use crate::device::Device;
use crate::keychain::DeviceKey;

/// X.509 key usage bits in their conventional (LSB-first) form.
pub const KEY_USAGE_DIGITAL_SIGNATURE: u16 = 1;

const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
const OID_CHALLENGE_PASSWORD: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.7");
const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_PERMANENT_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.8.3");

const OID_AT_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_AT_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_AT_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_AT_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_AT_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const OID_AT_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const OID_ECDSA_WITH_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

fn asn1_bit_length(bits: &[u8]) -> usize {
    let mut bit_len = bits.len() * 8;
    for i in 0..bits.len() {
        let b = bits[bits.len() - i - 1];
        for bit in 0..8 {
            if (b >> bit) & 1 == 1 {
                return bit_len;
            }
            bit_len -= 1;
        }
    }
    0
}

/// Build the key-usage extension the way Apple clients encode it: the
/// 16-bit usage bitmap is written bit-reversed within each byte as a
/// minimal BIT STRING whose length runs to the highest set bit.
pub fn key_usage_extension(key_usage: u16) -> color_eyre::eyre::Result<Extension> {
    let a = [
        (key_usage as u8).reverse_bits(),
        ((key_usage >> 8) as u8).reverse_bits(),
    ];
    let len = if a[1] != 0 { 2 } else { 1 };
    let bits = &a[..len];

    let bit_len = asn1_bit_length(bits);
    let bit_string = if bit_len == 0 {
        BitString::new(0, Vec::new()).wrap_err("failed to build empty bit string")?
    } else {
        let byte_len = bit_len.div_ceil(8);
        let unused = (byte_len * 8 - bit_len) as u8;
        BitString::new(unused, bits[..byte_len].to_vec())
            .wrap_err("failed to build key usage bit string")?
    };

    Ok(Extension {
        extn_id: OID_KEY_USAGE,
        critical: true,
        extn_value: OctetString::new(
            bit_string.to_der().wrap_err("failed to encode key usage")?,
        )
        .wrap_err("failed to wrap key usage")?,
    })
}

/// Build the extended-key-usage extension from dotted OID strings. The
/// OIDs are not validated against any registry.
pub fn ext_key_usage_extension(oids: &[String]) -> color_eyre::eyre::Result<Extension> {
    let mut parsed = Vec::with_capacity(oids.len());
    for oid in oids {
        parsed.push(
            ObjectIdentifier::new(oid)
                .map_err(|e| color_eyre::eyre::eyre!("failed parsing {oid:?} as OID: {e}"))?,
        );
    }
    Ok(Extension {
        extn_id: OID_EXT_KEY_USAGE,
        critical: false,
        extn_value: OctetString::new(
            parsed
                .to_der()
                .wrap_err("failed to encode extended key usage")?,
        )
        .wrap_err("failed to wrap extended key usage")?,
    })
}

/// PermanentIdentifier ::= SEQUENCE { identifierValue UTF8String OPTIONAL }
#[derive(Debug, der::Sequence)]
struct PermanentIdentifier {
    #[asn1(optional = "true")]
    identifier_value: Option<String>,
}

/// Build a SubjectAltName extension whose sole entry is a
/// PermanentIdentifier OtherName carrying the client identifier. The
/// extension is critical exactly when the subject is empty.
pub fn permanent_identifier_san_extension(
    client_identifier: &str,
    subject_is_empty: bool,
) -> color_eyre::eyre::Result<Extension> {
    let perm_id = PermanentIdentifier {
        identifier_value: Some(client_identifier.to_string()),
    }
    .to_der()
    .wrap_err("failed to encode permanent identifier")?;

    let other = OtherName {
        type_id: OID_PERMANENT_IDENTIFIER,
        value: Any::from_der(&perm_id).wrap_err("failed to wrap permanent identifier")?,
    };
    let san = SubjectAltName(vec![GeneralName::OtherName(other)]);

    Ok(Extension {
        extn_id: OID_SUBJECT_ALT_NAME,
        critical: subject_is_empty,
        extn_value: OctetString::new(
            san.to_der()
                .wrap_err("failed to encode subject alt name")?,
        )
        .wrap_err("failed to wrap subject alt name")?,
    })
}

/// Replace the per-device substitution variables a profile may carry.
pub fn replace_device_vars(device: &Device, input: &str) -> String {
    input
        .replace("%ComputerName%", &device.computer_name)
        .replace("%HardwareUUID%", &device.udid)
        .replace("%SerialNumber%", &device.serial)
}

fn rdn(oid: ObjectIdentifier, value: &str) -> color_eyre::eyre::Result<RelativeDistinguishedName> {
    let atv = AttributeTypeAndValue {
        oid,
        value: Any::new(Tag::Utf8String, value.as_bytes())
            .wrap_err("failed to encode subject value")?,
    };
    let mut set = SetOfVec::new();
    set.insert(atv)
        .map_err(|e| color_eyre::eyre::eyre!("failed to collect RDN: {e}"))?;
    Ok(RelativeDistinguishedName(set))
}

/// Build a subject name from the profile's nested OID/value arrays,
/// expanding substitution variables per device. When the arrays name no
/// CN and `default_cn` is set, it is appended.
pub fn subject_name(
    device: &Device,
    subject: &[Vec<Vec<String>>],
    default_cn: Option<&str>,
) -> color_eyre::eyre::Result<Name> {
    let mut rdns = Vec::new();
    let mut has_cn = false;

    for group in subject {
        for onv in group {
            if onv.len() < 2 {
                color_eyre::eyre::bail!("invalid OID in payload subject: {onv:?}");
            }
            let oid = match onv[0].as_str() {
                "C" => OID_AT_COUNTRY,
                "L" => OID_AT_LOCALITY,
                "ST" => OID_AT_STATE,
                "O" => OID_AT_ORGANIZATION,
                "OU" => OID_AT_ORGANIZATIONAL_UNIT,
                "CN" => {
                    has_cn = true;
                    OID_AT_COMMON_NAME
                }
                other => {
                    color_eyre::eyre::bail!("unhandled OID in payload subject: {other:?}")
                }
            };
            for value in &onv[1..] {
                rdns.push(rdn(oid, &replace_device_vars(device, value))?);
                if oid == OID_AT_COMMON_NAME {
                    // CN takes a single value
                    break;
                }
            }
        }
    }

    if !has_cn {
        if let Some(cn) = default_cn {
            rdns.push(rdn(OID_AT_COMMON_NAME, cn)?);
        }
    }

    Ok(RdnSequence(rdns))
}

pub(crate) fn signature_algorithm(key: &DeviceKey) -> AlgorithmIdentifierOwned {
    match key {
        DeviceKey::Rsa(_) => AlgorithmIdentifierOwned {
            oid: OID_SHA256_WITH_RSA,
            parameters: Some(Any::from(der::asn1::Null)),
        },
        DeviceKey::P256(_) => AlgorithmIdentifierOwned {
            oid: OID_ECDSA_WITH_SHA256,
            parameters: None,
        },
        DeviceKey::P384(_) => AlgorithmIdentifierOwned {
            oid: OID_ECDSA_WITH_SHA384,
            parameters: None,
        },
        DeviceKey::P521(_) => AlgorithmIdentifierOwned {
            oid: OID_ECDSA_WITH_SHA512,
            parameters: None,
        },
    }
}

pub(crate) fn sign_der(key: &DeviceKey, message: &[u8]) -> color_eyre::eyre::Result<Vec<u8>> {
    match key {
        DeviceKey::Rsa(k) => {
            let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(k.clone());
            let sig: rsa::pkcs1v15::Signature = signing_key.sign(message);
            Ok(signature::SignatureEncoding::to_vec(&sig))
        }
        DeviceKey::P256(k) => {
            let signing_key = p256::ecdsa::SigningKey::from(k);
            let sig: p256::ecdsa::DerSignature = signing_key.sign(message);
            Ok(sig.to_vec())
        }
        DeviceKey::P384(k) => {
            let signing_key = p384::ecdsa::SigningKey::from(k);
            let sig: p384::ecdsa::DerSignature = signing_key.sign(message);
            Ok(sig.to_vec())
        }
        DeviceKey::P521(k) => {
            let signing_key = p521::ecdsa::SigningKey::from(k);
            let sig: p521::ecdsa::DerSignature = signing_key.sign(message);
            Ok(sig.to_vec())
        }
    }
}

/// The SubjectPublicKeyInfo for a device key.
pub fn public_key_info(key: &DeviceKey) -> color_eyre::eyre::Result<SubjectPublicKeyInfoOwned> {
    let der = match key {
        DeviceKey::Rsa(k) => rsa::RsaPublicKey::from(k)
            .to_public_key_der()
            .wrap_err("failed to encode RSA public key")?,
        DeviceKey::P256(k) => k
            .public_key()
            .to_public_key_der()
            .wrap_err("failed to encode P-256 public key")?,
        DeviceKey::P384(k) => k
            .public_key()
            .to_public_key_der()
            .wrap_err("failed to encode P-384 public key")?,
        DeviceKey::P521(k) => k
            .public_key()
            .to_public_key_der()
            .wrap_err("failed to encode P-521 public key")?,
    };
    SubjectPublicKeyInfoOwned::try_from(der.as_bytes())
        .wrap_err("failed to decode subject public key info")
}

/// Parameters for a certificate request.
pub struct CsrParams<'a> {
    /// Subject name.
    pub subject: Name,
    /// Challenge password attribute, when non-empty.
    pub challenge: Option<&'a str>,
    /// Requested extensions.
    pub extensions: Vec<Extension>,
}

/// Build and sign a PKCS#10 certificate request.
pub fn build_csr(key: &DeviceKey, params: CsrParams<'_>) -> color_eyre::eyre::Result<Vec<u8>> {
    let mut attributes = SetOfVec::new();

    if let Some(challenge) = params.challenge.filter(|c| !c.is_empty()) {
        let mut values = SetOfVec::new();
        values
            .insert(
                Any::new(Tag::Utf8String, challenge.as_bytes())
                    .wrap_err("failed to encode challenge password")?,
            )
            .map_err(|e| color_eyre::eyre::eyre!("failed to collect challenge: {e}"))?;
        attributes
            .insert(Attribute {
                oid: OID_CHALLENGE_PASSWORD,
                values,
            })
            .map_err(|e| color_eyre::eyre::eyre!("failed to add challenge attribute: {e}"))?;
    }

    if !params.extensions.is_empty() {
        let extensions_der = params
            .extensions
            .to_der()
            .wrap_err("failed to encode requested extensions")?;
        let mut values = SetOfVec::new();
        values
            .insert(Any::from_der(&extensions_der).wrap_err("failed to wrap extensions")?)
            .map_err(|e| color_eyre::eyre::eyre!("failed to collect extensions: {e}"))?;
        attributes
            .insert(Attribute {
                oid: OID_EXTENSION_REQUEST,
                values,
            })
            .map_err(|e| color_eyre::eyre::eyre!("failed to add extension attribute: {e}"))?;
    }

    let info = CertReqInfo {
        version: Version::V1,
        subject: params.subject,
        public_key: public_key_info(key)?,
        attributes,
    };

    let tbs = info.to_der().wrap_err("failed to encode request info")?;
    let signature = sign_der(key, &tbs)?;

    let req = CertReq {
        info,
        algorithm: signature_algorithm(key),
        signature: BitString::from_bytes(&signature).wrap_err("failed to wrap signature")?,
    };
    req.to_der().wrap_err("failed to encode certificate request")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdmsim_store::KvStore;

    fn test_device() -> (tempfile::TempDir, Device) {
        let dir = tempfile::tempdir().unwrap();
        let db = KvStore::open(&dir.path().join("test.db")).unwrap();
        let mut device = Device::new("Test Mac", db);
        device.udid = "7E1A3C2B-0000-1111-2222-333344445555".into();
        device.serial = "C02ABCDEFGHJ".into();
        (dir, device)
    }

    #[test]
    fn test_key_usage_bit_reversal() {
        // 0x00A0 reversed within the byte is 0x05: digitalSignature and
        // keyEncipherment in the conventional bit order. Minimal encoding
        // runs the bit length to the last set bit, so no bits are unused.
        let ext = key_usage_extension(0x00A0).unwrap();
        assert!(ext.critical);
        assert_eq!(ext.extn_value.as_bytes(), &[0x03, 0x02, 0x00, 0x05]);
    }

    #[test]
    fn test_key_usage_digital_signature_default() {
        // 0x0001 reverses to 0x80 with seven trailing unused bits.
        let ext = key_usage_extension(KEY_USAGE_DIGITAL_SIGNATURE).unwrap();
        assert_eq!(ext.extn_value.as_bytes(), &[0x03, 0x02, 0x07, 0x80]);
    }

    #[test]
    fn test_key_usage_two_bytes() {
        // Bit 8 (decipherOnly in conventional order) forces a second byte.
        let ext = key_usage_extension(0x0100).unwrap();
        assert_eq!(ext.extn_value.as_bytes(), &[0x03, 0x03, 0x07, 0x00, 0x80]);
    }

    #[test]
    fn test_replace_device_vars() {
        let (_dir, device) = test_device();
        assert_eq!(
            replace_device_vars(&device, "%ComputerName% / %SerialNumber% / %HardwareUUID%"),
            "Test Mac / C02ABCDEFGHJ / 7E1A3C2B-0000-1111-2222-333344445555"
        );
    }

    #[test]
    fn test_subject_unknown_oid_rejected() {
        let (_dir, device) = test_device();
        let subject = vec![vec![vec!["UID".to_string(), "x".to_string()]]];
        assert!(subject_name(&device, &subject, None).is_err());
    }

    #[test]
    fn test_subject_short_entry_rejected() {
        let (_dir, device) = test_device();
        let subject = vec![vec![vec!["CN".to_string()]]];
        assert!(subject_name(&device, &subject, None).is_err());
    }

    #[test]
    fn test_subject_default_cn() {
        let (_dir, device) = test_device();
        let subject = vec![vec![vec!["O".to_string(), "Example".to_string()]]];
        let name = subject_name(&device, &subject, Some("com.example.enroll")).unwrap();
        let text = name.to_string();
        assert!(text.contains("CN=com.example.enroll"), "got {text}");
        assert!(text.contains("O=Example"), "got {text}");
    }

    #[test]
    fn test_subject_cn_not_defaulted_when_present() {
        let (_dir, device) = test_device();
        let subject = vec![vec![vec!["CN".to_string(), "%ComputerName%".to_string()]]];
        let name = subject_name(&device, &subject, Some("ignored")).unwrap();
        assert!(name.to_string().contains("CN=Test Mac"));
    }

    #[test]
    fn test_ext_key_usage_bad_oid() {
        assert!(ext_key_usage_extension(&["not an oid".to_string()]).is_err());
        assert!(ext_key_usage_extension(&["1.3.6.1.5.5.7.3.2".to_string()]).is_ok());
    }

    #[test]
    fn test_san_critical_when_subject_empty() {
        let ext = permanent_identifier_san_extension("client-1", true).unwrap();
        assert!(ext.critical);
        let ext = permanent_identifier_san_extension("client-1", false).unwrap();
        assert!(!ext.critical);
    }

    #[test]
    fn test_build_csr_parses_back() {
        let (_dir, device) = test_device();
        let key = DeviceKey::Rsa(rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap());
        let subject = subject_name(&device, &[], Some("com.example.enroll")).unwrap();
        let der = build_csr(
            &key,
            CsrParams {
                subject,
                challenge: Some("secret"),
                extensions: vec![key_usage_extension(KEY_USAGE_DIGITAL_SIGNATURE).unwrap()],
            },
        )
        .unwrap();

        let req = CertReq::from_der(&der).unwrap();
        assert_eq!(req.info.version, Version::V1);
        assert_eq!(req.info.attributes.len(), 2);
        assert!(req.info.subject.to_string().contains("CN=com.example.enroll"));
    }
}
