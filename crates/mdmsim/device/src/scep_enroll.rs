//! SCEP enrollment driven by a profile payload.

use color_eyre::eyre::WrapErr as _;
use mdmsim_profiles::ScepPayload;
use mdmsim_scep::CertsSelector;
use rand::rngs::OsRng;
use x509_cert::Certificate;

use crate::csr::{
    build_csr, key_usage_extension, subject_name, CsrParams, KEY_USAGE_DIGITAL_SIGNATURE,
};
use crate::device::Device;
use crate::keychain::DeviceKey;

const DEFAULT_RSA_KEY_SIZE: usize = 1024;

/// Generate the private key a SCEP payload asks for. Only RSA is
/// supported; an empty key type means RSA.
pub(crate) fn key_from_scep_payload(payload: &ScepPayload) -> color_eyre::eyre::Result<DeviceKey> {
    let plc = &payload.content;
    if !plc.key_type.is_empty() && plc.key_type != "RSA" {
        color_eyre::eyre::bail!("only RSA keys supported");
    }
    let key_size = if plc.key_size > 0 {
        plc.key_size as usize
    } else {
        DEFAULT_RSA_KEY_SIZE
    };
    Ok(DeviceKey::Rsa(
        rsa::RsaPrivateKey::new(&mut OsRng, key_size).wrap_err("failed generating SCEP key")?,
    ))
}

/// Build the CSR a SCEP payload describes. Clients appear to default the
/// key usage to digital signature and the CN to the enrollment payload
/// identifier.
pub(crate) fn csr_from_scep_payload(
    payload: &ScepPayload,
    device: &Device,
    key: &DeviceKey,
) -> color_eyre::eyre::Result<Vec<u8>> {
    let plc = &payload.content;

    let key_usage = if plc.key_usage != 0 {
        plc.key_usage
    } else {
        KEY_USAGE_DIGITAL_SIGNATURE
    };

    let subject = subject_name(
        device,
        &plc.subject,
        Some(&payload.common.payload_identifier),
    )?;

    build_csr(
        key,
        CsrParams {
            subject,
            challenge: Some(&plc.challenge),
            extensions: vec![key_usage_extension(key_usage)?],
        },
    )
}

/// Run the complete SCEP exchange for a payload and return the new
/// identity materials.
pub(crate) async fn enroll(
    device: &Device,
    http: &reqwest::Client,
    payload: &ScepPayload,
) -> color_eyre::eyre::Result<(DeviceKey, Certificate)> {
    let key = key_from_scep_payload(payload)?;
    let csr = csr_from_scep_payload(payload, device, &key)?;

    let fingerprint: Vec<u8> = payload
        .content
        .ca_fingerprint
        .clone()
        .map(Into::into)
        .unwrap_or_default();
    let selector = CertsSelector::from_fingerprint(&fingerprint).wrap_err("scep cert selector")?;

    tracing::info!(
        udid = %device.udid,
        url = %payload.content.url,
        "starting SCEP enrollment"
    );

    let mut client = mdmsim_scep::Client::new(&payload.content.url, http.clone());
    let ca_message = (!payload.content.name.is_empty()).then_some(payload.content.name.as_str());
    let cert = client
        .full_sign(&csr, ca_message, &selector)
        .await
        .wrap_err("scep")?;

    Ok((key, cert))
}
