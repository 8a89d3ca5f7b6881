//! ACME enrollment with a device-attest-01 challenge, backed by the
//! operator's fake attestation CA.

use std::str::FromStr as _;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use color_eyre::eyre::WrapErr as _;
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use der::{Decode as _, Encode as _};
use mdmsim_acme::{AccountKey, Challenge, Identifier, Solver, IDENTIFIER_PERMANENT};
use mdmsim_profiles::AcmeCertificatePayload;
use rand::rngs::OsRng;
use sha2::{Digest as _, Sha256};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

use crate::attest::AttestationCa;
use crate::csr::{
    build_csr, ext_key_usage_extension, key_usage_extension,
    permanent_identifier_san_extension, public_key_info, subject_name, CsrParams,
    KEY_USAGE_DIGITAL_SIGNATURE,
};
use crate::device::Device;
use crate::keychain::DeviceKey;

const OID_APPLE_SERIAL_NUMBER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.8.9.1");
const OID_APPLE_UNIQUE_DEVICE_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.8.9.2");
const OID_APPLE_SEP_OS_VERSION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.8.10.2");
const OID_APPLE_NONCE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113635.100.8.11.1");

/// Generate the leaf key an ACME payload asks for.
pub(crate) fn key_from_acme_payload(
    payload: &AcmeCertificatePayload,
) -> color_eyre::eyre::Result<DeviceKey> {
    match payload.key_type.as_str() {
        "RSA" => {
            let key_size = if payload.key_size > 0 {
                payload.key_size as usize
            } else {
                2048
            };
            Ok(DeviceKey::Rsa(
                rsa::RsaPrivateKey::new(&mut OsRng, key_size)
                    .wrap_err("failed generating ACME RSA key")?,
            ))
        }
        "ECSECPrimeRandom" => match payload.key_size {
            192 => color_eyre::eyre::bail!("P-192 is not supported"),
            256 => Ok(DeviceKey::P256(p256::SecretKey::random(&mut OsRng))),
            384 => Ok(DeviceKey::P384(p384::SecretKey::random(&mut OsRng))),
            521 => Ok(DeviceKey::P521(p521::SecretKey::random(&mut OsRng))),
            other => color_eyre::eyre::bail!("unsupported curve: {other}"),
        },
        "" => color_eyre::eyre::bail!("KeyType is required in ACMECertificate payload"),
        other => color_eyre::eyre::bail!(
            "KeyType {other:?} is not supported in ACMECertificate payload"
        ),
    }
}

fn subject_has_cn(subject: &[Vec<Vec<String>>]) -> bool {
    subject
        .iter()
        .flatten()
        .any(|onv| onv.first().map(String::as_str) == Some("CN"))
}

/// Build the CSR for an ACME payload: key usage (digital signature by
/// default), extended key usage from dotted OIDs, subject RDNs, and a
/// SubjectAltName whose sole entry is a PermanentIdentifier carrying the
/// client identifier.
pub(crate) fn csr_from_acme_payload(
    device: &Device,
    payload: &AcmeCertificatePayload,
    key: &DeviceKey,
) -> color_eyre::eyre::Result<Vec<u8>> {
    let key_usage = if payload.usage_flags != 0 {
        payload.usage_flags
    } else {
        KEY_USAGE_DIGITAL_SIGNATURE
    };

    let mut extensions = vec![
        key_usage_extension(key_usage)?,
        ext_key_usage_extension(&payload.extended_key_usage)?,
    ];

    let subject = subject_name(device, &payload.subject, None)?;
    let subject_is_empty = !subject_has_cn(&payload.subject);
    extensions.push(permanent_identifier_san_extension(
        &payload.client_identifier,
        subject_is_empty,
    )?);

    build_csr(
        key,
        CsrParams {
            subject,
            challenge: None,
            extensions,
        },
    )
}

/// Reject ACME payload configurations the simulator cannot honor.
pub(crate) fn validate_acme_payload(
    payload: &AcmeCertificatePayload,
) -> color_eyre::eyre::Result<()> {
    if !payload.attest {
        // Ownership of the identifier can only be proven through the
        // attestation challenge, so non-attested payloads have no
        // workable flow here.
        color_eyre::eyre::bail!("non-attested ACMECertificate payloads are not supported");
    }
    if !payload.hardware_bound {
        color_eyre::eyre::bail!(r#"if key "Attest" is true, "HardwareBound" must be true"#);
    }
    if payload.client_identifier.is_empty() {
        color_eyre::eyre::bail!(r#""ClientIdentifier" required"#);
    }
    if payload.directory_url.is_empty() {
        color_eyre::eyre::bail!(r#""DirectoryURL" required"#);
    }
    url::Url::parse(&payload.directory_url).wrap_err("failed parsing DirectoryURL")?;
    if payload.subject_alt_name.is_some() {
        // The challenge type is derived from the CSR identifiers;
        // arbitrary SANs would require other challenge types.
        color_eyre::eyre::bail!(r#""SubjectAltName" not yet supported"#);
    }
    Ok(())
}

/// The device-attest-01 solver: mints a fake Apple-style attestation
/// certificate chain on demand.
struct AttestSolver<'a> {
    attestation_ca: &'a AttestationCa,
    device: &'a Device,
    leaf_spki: SubjectPublicKeyInfoOwned,
}

fn raw_extension(oid: ObjectIdentifier, value: &[u8]) -> color_eyre::eyre::Result<Extension> {
    Ok(Extension {
        extn_id: oid,
        critical: false,
        extn_value: OctetString::new(value).wrap_err("failed to wrap extension value")?,
    })
}

impl Solver for AttestSolver<'_> {
    async fn payload(
        &self,
        challenge: &Challenge,
    ) -> color_eyre::eyre::Result<serde_json::Value> {
        tracing::debug!(token = %challenge.token, "solving device-attest-01 challenge");

        // The nonce is the SHA-256 of the challenge token.
        let nonce = Sha256::digest(challenge.token.as_bytes());

        // The attestation leaf carries the same public key as the ACME
        // CSR, plus the Apple device attributes.
        let subject =
            Name::from_str("CN=fake attestation cert").wrap_err("failed to build leaf subject")?;
        let extensions = vec![
            raw_extension(OID_APPLE_SERIAL_NUMBER, self.device.serial.as_bytes())?,
            raw_extension(
                OID_APPLE_UNIQUE_DEVICE_IDENTIFIER,
                self.device.udid.as_bytes(),
            )?,
            raw_extension(OID_APPLE_SEP_OS_VERSION, b"16.0")?,
            raw_extension(OID_APPLE_NONCE, &nonce)?,
        ];

        let chain =
            self.attestation_ca
                .sign_leaf(subject, self.leaf_spki.clone(), extensions)?;

        let mut x5c = Vec::with_capacity(chain.len());
        for cert in &chain {
            x5c.push(ciborium::Value::Bytes(
                cert.to_der().wrap_err("failed to encode attestation cert")?,
            ));
        }

        let attestation_object = ciborium::Value::Map(vec![
            (
                ciborium::Value::Text("fmt".into()),
                ciborium::Value::Text("apple".into()),
            ),
            (
                ciborium::Value::Text("attStmt".into()),
                ciborium::Value::Map(vec![(
                    ciborium::Value::Text("x5c".into()),
                    ciborium::Value::Array(x5c),
                )]),
            ),
        ]);

        let mut encoded = Vec::new();
        ciborium::ser::into_writer(&attestation_object, &mut encoded)
            .wrap_err("failed to encode attestation object")?;

        Ok(serde_json::json!({
            "attObj": URL_SAFE_NO_PAD.encode(encoded),
        }))
    }
}

/// Run the complete ACME exchange for a payload and return the new
/// identity materials.
pub(crate) async fn enroll(
    device: &Device,
    _http: &reqwest::Client,
    attestation_ca: Option<&AttestationCa>,
    payload: &AcmeCertificatePayload,
) -> color_eyre::eyre::Result<(DeviceKey, Certificate)> {
    validate_acme_payload(payload)?;

    let attestation_ca = attestation_ca.ok_or_else(|| {
        color_eyre::eyre::eyre!(
            "ACMECertificate payload processing requires a (fake) attestation CA to be configured"
        )
    })?;

    let key = key_from_acme_payload(payload)
        .wrap_err("failed creating key for ACMECertificate payload")?;
    let csr = csr_from_acme_payload(device, payload, &key).wrap_err("failed creating CSR")?;

    tracing::info!(
        udid = %device.udid,
        directory = %payload.directory_url,
        "starting ACME enrollment"
    );

    // ACME directories in this tool are typically local test CAs with
    // untrusted certificates.
    let acme_http = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .wrap_err("failed building ACME HTTP client")?;
    let mut client =
        mdmsim_acme::Client::discover(acme_http, &payload.directory_url, AccountKey::generate())
            .await?;
    client
        .new_account(vec!["mailto:someone@example.com".into()], true)
        .await?;

    let solver = AttestSolver {
        attestation_ca,
        device,
        leaf_spki: public_key_info(&key)?,
    };
    let identifiers = vec![Identifier {
        kind: IDENTIFIER_PERMANENT.into(),
        value: payload.client_identifier.clone(),
    }];

    let chain = client
        .obtain_certificate(identifiers, &csr, &solver)
        .await
        .wrap_err("failed obtaining certificate")?;

    // first cert in the chain is the new leaf
    let certificate = Certificate::from_der(&chain[0])
        .wrap_err("failed parsing issued certificate")?;

    Ok((key, certificate))
}
