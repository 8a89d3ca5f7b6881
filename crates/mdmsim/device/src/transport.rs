//! Signed MDM transport.
//!
//! Every outbound MDM body is plist-encoded and signed with the device's
//! identity as a detached CMS signature; the base64 of that signature
//! rides in the `Mdm-Signature` header. All requests are PUT.

use base64::Engine as _;
use cms::builder::{SignedDataBuilder, SignerInfoBuilder};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::signed_data::{EncapsulatedContentInfo, SignerIdentifier};
use color_eyre::eyre::WrapErr as _;
use der::Encode as _;
use sha2::{Digest as _, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use crate::keychain::DeviceKey;

/// Content type for check-in messages.
pub(crate) const CHECKIN_CONTENT_TYPE: &str = "application/x-apple-aspen-mdm-checkin";

fn sha256_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: const_oid::db::rfc5912::ID_SHA_256,
        parameters: None,
    }
}

fn build_detached<S, Sig>(
    signer: &S,
    cert: &Certificate,
    digest: &[u8],
) -> color_eyre::eyre::Result<Vec<u8>>
where
    S: signature::Keypair + spki::DynSignatureAlgorithmIdentifier + signature::Signer<Sig>,
    S::VerifyingKey: spki::EncodePublicKey,
    Sig: signature::SignatureEncoding + spki::SignatureBitStringEncoding,
{
    // Detached signature: no encapsulated content, digest supplied
    // externally.
    let encap = EncapsulatedContentInfo {
        econtent_type: const_oid::db::rfc5911::ID_DATA,
        econtent: None,
    };

    let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
        issuer: cert.tbs_certificate.issuer.clone(),
        serial_number: cert.tbs_certificate.serial_number.clone(),
    });

    let signer_info =
        SignerInfoBuilder::new(signer, sid, sha256_algorithm(), &encap, Some(digest))
            .map_err(|e| color_eyre::eyre::eyre!("failed to create signer info: {e}"))?;

    let mut builder = SignedDataBuilder::new(&encap);
    let signed = builder
        .add_digest_algorithm(sha256_algorithm())
        .map_err(|e| color_eyre::eyre::eyre!("failed to add digest algorithm: {e}"))?
        .add_certificate(CertificateChoices::Certificate(cert.clone()))
        .map_err(|e| color_eyre::eyre::eyre!("failed to add identity certificate: {e}"))?
        .add_signer_info::<S, Sig>(signer_info)
        .map_err(|e| color_eyre::eyre::eyre!("failed to add signer info: {e}"))?
        .build()
        .map_err(|e| color_eyre::eyre::eyre!("failed to sign message: {e}"))?;

    signed.to_der().wrap_err("failed to encode signature")
}

/// Produce the `Mdm-Signature` header value for a body: base64 of the
/// detached CMS signature made with the device identity.
pub(crate) fn mdm_signature(
    cert: &Certificate,
    key: &DeviceKey,
    body: &[u8],
) -> color_eyre::eyre::Result<String> {
    let digest = Sha256::digest(body);

    let der = match key {
        DeviceKey::Rsa(k) => {
            let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(k.clone());
            build_detached::<_, rsa::pkcs1v15::Signature>(&signer, cert, &digest)?
        }
        DeviceKey::P256(k) => {
            let signer = p256::ecdsa::SigningKey::from(k);
            build_detached::<_, p256::ecdsa::DerSignature>(&signer, cert, &digest)?
        }
        DeviceKey::P384(k) => {
            let signer = p384::ecdsa::SigningKey::from(k);
            build_detached::<_, p384::ecdsa::DerSignature>(&signer, cert, &digest)?
        }
        DeviceKey::P521(k) => {
            let signer = p521::ecdsa::SigningKey::from(k);
            build_detached::<_, p521::ecdsa::DerSignature>(&signer, cert, &digest)?
        }
    };

    Ok(base64::engine::general_purpose::STANDARD.encode(der))
}

/// PUT a signed body and return the status code and response body.
pub(crate) async fn put_signed(
    http: &reqwest::Client,
    url: &str,
    content_type: Option<&str>,
    cert: &Certificate,
    key: &DeviceKey,
    body: Vec<u8>,
) -> color_eyre::eyre::Result<(u16, Vec<u8>)> {
    let signature = mdm_signature(cert, key, &body)?;

    let mut req = http.put(url).header("Mdm-Signature", signature);
    if let Some(content_type) = content_type {
        req = req.header(reqwest::header::CONTENT_TYPE, content_type);
    }

    let resp = req
        .body(body)
        .send()
        .await
        .wrap_err_with(|| format!("PUT {url}"))?;

    let status = resp.status().as_u16();
    let body = resp
        .bytes()
        .await
        .wrap_err("reading MDM response body")?
        .to_vec();
    Ok((status, body))
}
