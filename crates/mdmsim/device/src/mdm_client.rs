//! The per-device MDM client: check-in and the command loop.

use color_eyre::eyre::WrapErr as _;
use mdmsim_profiles::MdmPayload;
use x509_cert::Certificate;

use crate::device::Device;
use crate::keychain::{DeviceKey, ItemContent};
use crate::messages::{
    AuthenticateRequest, ConnectRequest, ConnectResponse, ErrorChain, TokenUpdateRequest,
};
use crate::transport;

/// The device identity used to sign MDM traffic.
pub(crate) struct Identity {
    pub key: DeviceKey,
    pub cert: Certificate,
}

/// MDM protocol client for one device. Holds a snapshot of the device
/// record, the MDM payload it enrolled under and the identity materials.
pub struct MdmClient {
    /// The device this client speaks for.
    pub device: Device,

    http: reqwest::Client,
    mdm_payload: Option<MdmPayload>,
    identity: Option<Identity>,
}

/// Load the identity trio referenced by a keychain identity UUID.
pub(crate) fn load_identity(device: &Device, uuid: &str) -> color_eyre::eyre::Result<Identity> {
    let keychain = device.system_keychain();

    let id_item = keychain.load_item(uuid)?;
    let ItemContent::Identity {
        key_uuid,
        cert_uuid,
    } = &id_item.content
    else {
        color_eyre::eyre::bail!("keychain item {uuid} is not an identity");
    };

    let key_item = keychain.load_item(key_uuid)?;
    let ItemContent::Key(key) = key_item.content else {
        color_eyre::eyre::bail!("identity key item {key_uuid} is not a key");
    };

    let cert_item = keychain.load_item(cert_uuid)?;
    let ItemContent::Certificate(cert) = cert_item.content else {
        color_eyre::eyre::bail!("identity cert item {cert_uuid} is not a certificate");
    };

    Ok(Identity { key, cert })
}

impl MdmClient {
    /// Build a client for an enrolled device, loading its identity and
    /// cached MDM payload from storage.
    pub fn new(device: Device, http: reqwest::Client) -> color_eyre::eyre::Result<Self> {
        let identity = if device.mdm_identity_keychain_uuid.is_empty() {
            None
        } else {
            Some(load_identity(&device, &device.mdm_identity_keychain_uuid)?)
        };

        let mdm_payload = if device.mdm_profile_identifier.is_empty() {
            None
        } else {
            let profile = device
                .profile_store()
                .load(&device.mdm_profile_identifier)?;
            let mut mdm_payloads = profile.mdm_payloads()?;
            if mdm_payloads.len() != 1 {
                color_eyre::eyre::bail!("enrollment profile must contain an MDM payload");
            }
            Some(mdm_payloads.remove(0))
        };

        Ok(Self {
            device,
            http,
            mdm_payload,
            identity,
        })
    }

    /// Build a client mid-enrollment from an explicit MDM payload. The
    /// identity must already be persisted and referenced on the device.
    pub(crate) fn from_payload(
        device: Device,
        http: reqwest::Client,
        payload: MdmPayload,
    ) -> color_eyre::eyre::Result<Self> {
        let identity = load_identity(&device, &device.mdm_identity_keychain_uuid)?;
        Ok(Self {
            device,
            http,
            mdm_payload: Some(payload),
            identity: Some(identity),
        })
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// All the state the command loop needs: profile identifier, identity
    /// reference, cached payload, loaded identity materials.
    fn enrolled(&self) -> bool {
        !self.device.mdm_profile_identifier.is_empty()
            && !self.device.mdm_identity_keychain_uuid.is_empty()
            && self.mdm_payload.is_some()
            && self.identity.is_some()
    }

    fn payload(&self) -> color_eyre::eyre::Result<&MdmPayload> {
        self.mdm_payload
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("no MDM payload for device"))
    }

    fn identity(&self) -> color_eyre::eyre::Result<&Identity> {
        self.identity
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("no MDM identity for device"))
    }

    /// The `Mdm-Signature` header value for an arbitrary body.
    pub fn mdm_signature(&self, body: &[u8]) -> color_eyre::eyre::Result<String> {
        let identity = self.identity()?;
        transport::mdm_signature(&identity.cert, &identity.key, body)
    }

    fn to_plist_xml<T: serde::Serialize>(value: &T) -> color_eyre::eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, value).wrap_err("failed to serialize plist body")?;
        Ok(buf)
    }

    async fn check_in_request<T: serde::Serialize>(
        &self,
        message: &T,
    ) -> color_eyre::eyre::Result<()> {
        let identity = self.identity()?;
        let url = self.payload()?.effective_check_in_url().to_string();
        let body = Self::to_plist_xml(message)?;

        let (status, _body) = transport::put_signed(
            &self.http,
            &url,
            Some(transport::CHECKIN_CONTENT_TYPE),
            &identity.cert,
            &identity.key,
            body,
        )
        .await?;

        if status != 200 {
            color_eyre::eyre::bail!("checkin request failed with HTTP status: {status}");
        }
        Ok(())
    }

    /// Send the Authenticate check-in message.
    pub async fn authenticate(&self) -> color_eyre::eyre::Result<()> {
        let message = AuthenticateRequest {
            device_name: self.device.computer_name.clone(),
            message_type: "Authenticate".into(),
            topic: self.payload()?.topic.clone(),
            udid: self.device.udid.clone(),
            serial_number: Some(self.device.serial.clone()),
            ..Default::default()
        };
        tracing::info!(udid = %self.device.udid, "sending Authenticate");
        self.check_in_request(&message).await
    }

    /// Send a TokenUpdate check-in message with synthetic push
    /// credentials, optionally tagged with extra text.
    pub async fn token_update(&self, addl: &str) -> color_eyre::eyre::Result<()> {
        let message = TokenUpdateRequest {
            awaiting_configuration: None,
            message_type: "TokenUpdate".into(),
            push_magic: format!("fakePushMagic{addl}"),
            token: format!("fakeToken{addl}").into_bytes().into(),
            topic: self.payload()?.topic.clone(),
            udid: self.device.udid.clone(),
        };
        tracing::info!(udid = %self.device.udid, "sending TokenUpdate");
        self.check_in_request(&message).await
    }

    /// One full command cycle: poll Idle, execute and acknowledge
    /// commands until the server answers with an empty body.
    pub async fn connect(&mut self) -> color_eyre::eyre::Result<()> {
        let mut request = plist::to_value(&ConnectRequest::idle(&self.device.udid))
            .wrap_err("failed to build idle request")?;

        loop {
            if !self.enrolled() {
                color_eyre::eyre::bail!("device not enrolled");
            }

            let identity = self.identity()?;
            let url = self.payload()?.server_url.clone();
            let mut body = Vec::new();
            plist::to_writer_xml(&mut body, &request)
                .wrap_err("failed to serialize connect request")?;

            let (status, response_body) = transport::put_signed(
                &self.http,
                &url,
                None,
                &identity.cert,
                &identity.key,
                body,
            )
            .await?;

            if status != 200 {
                color_eyre::eyre::bail!("connect request failed with HTTP status: {status}");
            }
            if response_body.is_empty() {
                return Ok(());
            }

            let response: ConnectResponse = plist::from_bytes(&response_body)
                .wrap_err("failed to parse connect response")?;

            let reply = match self
                .handle_mdm_command(
                    &response.command.request_type,
                    &response.command_uuid,
                    &response_body,
                )
                .await
            {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    tracing::warn!(
                        udid = %self.device.udid,
                        command_uuid = %response.command_uuid,
                        "empty response from handling MDM command"
                    );
                    plist::to_value(&ConnectRequest::error(
                        &self.device.udid,
                        &response.command_uuid,
                        &response.command.request_type,
                        ErrorChain {
                            error_code: 99999,
                            error_domain: "mdmb-handle-mdm-command".into(),
                            localized_description: "Empty response from handling MDM command"
                                .into(),
                            us_english_description: None,
                        },
                    ))
                    .wrap_err("failed to build error reply")?
                }
                Err(e) => {
                    tracing::error!(
                        udid = %self.device.udid,
                        command_uuid = %response.command_uuid,
                        error = %e,
                        "error handling MDM command"
                    );
                    plist::to_value(&ConnectRequest::error(
                        &self.device.udid,
                        &response.command_uuid,
                        &response.command.request_type,
                        ErrorChain {
                            error_code: 99998,
                            error_domain: "mdmb-handle-mdm-command".into(),
                            localized_description: "Error handling MDM command".into(),
                            us_english_description: None,
                        },
                    ))
                    .wrap_err("failed to build error reply")?
                }
            };

            request = reply;
        }
    }

    /// Tear down the MDM enrollment state: forget the identity reference
    /// and profile identifier and persist the device. The keychain items
    /// themselves are removed by the certificate payload removal.
    pub(crate) fn unenroll_device(device: &mut Device) -> color_eyre::eyre::Result<()> {
        device.mdm_identity_keychain_uuid.clear();
        device.mdm_profile_identifier.clear();
        device.save()
    }
}
