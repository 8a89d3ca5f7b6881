//! Throwaway PKCSReq signer identity.

use std::str::FromStr as _;
use std::time::Duration;

use color_eyre::eyre::WrapErr as _;
use rand::rngs::OsRng;
use rand::RngCore as _;
use sha2::Sha256;
use signature::Keypair as _;
use spki::EncodePublicKey as _;
use x509_cert::builder::{Builder as _, CertificateBuilder, Profile};
use x509_cert::ext::pkix::{ExtendedKeyUsage, KeyUsage, KeyUsages};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use x509_cert::Certificate;

/// Generate a fresh self-signed RSA signer identity for a single SCEP
/// exchange. The certificate only needs to live for the duration of the
/// request, so it gets an hour.
pub fn self_signed_signer() -> color_eyre::eyre::Result<(rsa::RsaPrivateKey, Certificate)> {
    let private_key =
        rsa::RsaPrivateKey::new(&mut OsRng, 2048).wrap_err("failed to generate signer key")?;
    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());

    let mut serial_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut serial_bytes);
    serial_bytes[0] &= 0x7f;
    let serial = SerialNumber::new(&serial_bytes).wrap_err("failed to build serial number")?;

    let validity =
        Validity::from_now(Duration::from_secs(3600)).wrap_err("failed to build validity")?;
    let subject = Name::from_str("CN=SCEP SIGNER").wrap_err("failed to build subject")?;

    let spki_der = signing_key
        .verifying_key()
        .to_public_key_der()
        .wrap_err("failed to encode signer public key")?;
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes())
        .wrap_err("failed to decode signer public key")?;

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer: None },
        serial,
        validity,
        subject,
        spki,
        &signing_key,
    )
    .wrap_err("failed to create certificate builder")?;

    builder
        .add_extension(&KeyUsage(
            KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment,
        ))
        .wrap_err("failed to add key usage")?;
    builder
        .add_extension(&ExtendedKeyUsage(vec![
            const_oid::db::rfc5280::ID_KP_SERVER_AUTH,
        ]))
        .wrap_err("failed to add extended key usage")?;

    let cert = builder
        .build::<rsa::pkcs1v15::Signature>()
        .wrap_err("failed to sign signer certificate")?;

    Ok((private_key, cert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_is_self_signed() {
        let (_key, cert) = self_signed_signer().unwrap();
        assert_eq!(cert.tbs_certificate.subject, cert.tbs_certificate.issuer);
        assert_eq!(
            cert.tbs_certificate.subject.to_string(),
            "CN=SCEP SIGNER"
        );
    }
}
