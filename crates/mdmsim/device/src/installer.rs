//! Profile installation and removal.
//!
//! Payloads are classified, given prerequisite flags and installed in
//! dependency order: identity-producing payloads run before the MDM
//! payload that references their result. Removal reverses that order.

use color_eyre::eyre::WrapErr as _;
use mdmsim_profiles::{CommonPayload, Payload, Profile};
use x509_cert::Certificate;

use crate::attest::AttestationCa;
use crate::device::Device;
use crate::keychain::{DeviceKey, ItemContent, KeychainItem};
use crate::mdm_client::MdmClient;
use crate::profile_store::REF_KEYCHAIN_IDENTITY;
use crate::{acme_enroll, scep_enroll};

const PAYLOAD_REQUIRES_NETWORK: u8 = 1 << 0;
const PAYLOAD_REQUIRES_IDENTITIES: u8 = 1 << 1;

/// A payload wrapped with its prerequisite flags and (after install) the
/// string result its installation produced.
struct PayloadAndResult {
    payload: Payload,
    flags: u8,
    result: Option<String>,
}

fn classify_payloads(profile: &Profile) -> color_eyre::eyre::Result<Vec<PayloadAndResult>> {
    Ok(profile
        .payloads()?
        .into_iter()
        .map(|payload| {
            let flags = match &payload {
                Payload::Scep(_) | Payload::Acme(_) => PAYLOAD_REQUIRES_NETWORK,
                Payload::Mdm(_) => PAYLOAD_REQUIRES_NETWORK | PAYLOAD_REQUIRES_IDENTITIES,
                Payload::Other(_) => 0,
            };
            PayloadAndResult {
                payload,
                flags,
                result: None,
            }
        })
        .collect())
}

/// Stable sort into installation order: payloads with fewer
/// prerequisites first, so identity producers run before the MDM payload
/// that consumes them.
fn sort_for_install(payloads: &mut [PayloadAndResult]) {
    payloads.sort_by_key(|p| p.flags);
}

/// Stable sort into removal order: the reverse of installation, MDM
/// first.
fn sort_for_remove(payloads: &mut [PayloadAndResult]) {
    payloads.sort_by_key(|p| std::cmp::Reverse(p.flags));
}

impl Device {
    /// Reject profile installs that would violate the enrollment state:
    /// multiple MDM payloads, double enrollment, or rebinding an
    /// MDM-delivered profile to a different server URL.
    pub fn validate_profile_install(
        &self,
        profile: &Profile,
        from_mdm: bool,
    ) -> color_eyre::eyre::Result<()> {
        let mdm_payloads = profile.mdm_payloads()?;
        if mdm_payloads.is_empty() {
            return Ok(());
        }
        if mdm_payloads.len() > 1 {
            color_eyre::eyre::bail!("profile may only contain one MDM payload");
        }
        let mdm_payload = &mdm_payloads[0];

        if !from_mdm && !self.mdm_profile_identifier.is_empty() {
            color_eyre::eyre::bail!("device already enrolled, please unenroll first");
        }
        if from_mdm {
            let existing = self
                .profile_store()
                .load(&self.mdm_profile_identifier)
                .wrap_err("loading existing MDM profile")?;
            let existing_mdm = existing.mdm_payloads()?;
            if existing_mdm.len() != 1 {
                color_eyre::eyre::bail!("invalid existing MDM profile");
            }
            if mdm_payload.server_url != existing_mdm[0].server_url {
                color_eyre::eyre::bail!("MDM payload must contain same ServerURL");
            }
        }
        Ok(())
    }

    /// Install a configuration profile onto the device, running its
    /// enrollment payloads. A colliding `PayloadIdentifier` removes the
    /// existing profile first.
    pub async fn install_profile(
        &mut self,
        http: &reqwest::Client,
        attestation_ca: Option<&AttestationCa>,
        blob: &[u8],
        from_mdm: bool,
    ) -> color_eyre::eyre::Result<()> {
        if blob.is_empty() {
            color_eyre::eyre::bail!("empty profile");
        }
        let profile = Profile::from_bytes(blob)?;
        self.validate_profile_install(&profile, from_mdm)?;

        let installed = self.profile_store().list_uuids()?;
        if installed.contains(&profile.payload_identifier) {
            tracing::info!(
                udid = %self.udid,
                profile_id = %profile.payload_identifier,
                "removing existing profile before reinstall"
            );
            if let Err(e) = self.remove_profile(&profile.payload_identifier) {
                tracing::error!(error = %e, "error removing existing profile");
            }
        }

        let mut ordered = classify_payloads(&profile)?;
        sort_for_install(&mut ordered);

        for index in 0..ordered.len() {
            match ordered[index].payload.clone() {
                Payload::Scep(scep) => {
                    let (key, cert) = scep_enroll::enroll(self, http, &scep).await?;
                    let identity_uuid = self.save_identity_items(key, cert)?;
                    self.profile_store().save_payload_ref(
                        &profile.payload_identifier,
                        &scep.common,
                        REF_KEYCHAIN_IDENTITY,
                        &identity_uuid,
                    )?;
                    if identity_uuid.is_empty() {
                        color_eyre::eyre::bail!("no result from scep payload install");
                    }
                    ordered[index].result = Some(identity_uuid);
                }
                Payload::Acme(acme) => {
                    let (key, cert) =
                        acme_enroll::enroll(self, http, attestation_ca, &acme).await?;
                    let identity_uuid = self.save_identity_items(key, cert)?;
                    self.profile_store().save_payload_ref(
                        &profile.payload_identifier,
                        &acme.common,
                        REF_KEYCHAIN_IDENTITY,
                        &identity_uuid,
                    )?;
                    if identity_uuid.is_empty() {
                        color_eyre::eyre::bail!("no result from acme payload install");
                    }
                    ordered[index].result = Some(identity_uuid);
                }
                Payload::Mdm(mdm) => {
                    let sibling = ordered
                        .iter()
                        .find(|p| {
                            p.payload.common().payload_uuid == mdm.identity_certificate_uuid
                        })
                        .ok_or_else(|| {
                            color_eyre::eyre::eyre!(
                                "could not find payload UUID {}",
                                mdm.identity_certificate_uuid
                            )
                        })?;
                    let identity_uuid = sibling.result.clone().filter(|r| !r.is_empty());
                    let Some(identity_uuid) = identity_uuid else {
                        color_eyre::eyre::bail!(
                            "referenced identity payload has no result keychain ID"
                        );
                    };

                    self.mdm_identity_keychain_uuid = identity_uuid;
                    self.save()?;

                    self.install_mdm_payload(http, &mdm, &profile.payload_identifier)
                        .await?;
                }
                Payload::Other(common) => {
                    tracing::warn!(
                        payload_type = %common.payload_type,
                        payload_uuid = %common.payload_uuid,
                        "unknown payload type not processed"
                    );
                }
            }
        }

        self.profile_store()
            .persist(blob, &profile.payload_identifier)
    }

    /// Persist a freshly minted identity as its three keychain items and
    /// return the identity item's UUID.
    fn save_identity_items(
        &self,
        key: DeviceKey,
        cert: Certificate,
    ) -> color_eyre::eyre::Result<String> {
        let keychain = self.system_keychain();

        let key_item = KeychainItem::new(ItemContent::Key(key));
        keychain.save(&key_item)?;

        let cert_item = KeychainItem::new(ItemContent::Certificate(cert));
        keychain.save(&cert_item)?;

        let identity_item = KeychainItem::new(ItemContent::Identity {
            key_uuid: key_item.uuid.clone(),
            cert_uuid: cert_item.uuid.clone(),
        });
        keychain.save(&identity_item)?;

        Ok(identity_item.uuid)
    }

    async fn install_mdm_payload(
        &mut self,
        http: &reqwest::Client,
        payload: &mdmsim_profiles::MdmPayload,
        profile_id: &str,
    ) -> color_eyre::eyre::Result<()> {
        if !payload.sign_message {
            color_eyre::eyre::bail!("non-SignMessage (mTLS) enrollment not supported");
        }

        let client = MdmClient::from_payload(self.clone(), http.clone(), payload.clone())?;
        client.authenticate().await?;
        client.token_update("").await?;

        self.mdm_profile_identifier = profile_id.to_string();
        self.save()?;
        Ok(())
    }

    /// Remove an installed profile, reversing its payload actions in
    /// reverse installation order. Per-payload failures are logged but do
    /// not stop the removal.
    pub fn remove_profile(&mut self, profile_id: &str) -> color_eyre::eyre::Result<()> {
        let profile = self.profile_store().load(profile_id)?;

        let mut ordered = classify_payloads(&profile)?;
        sort_for_remove(&mut ordered);

        for entry in &ordered {
            let result = match &entry.payload {
                Payload::Scep(scep) => {
                    self.remove_identity_payload(&profile.payload_identifier, &scep.common)
                }
                Payload::Acme(acme) => {
                    self.remove_identity_payload(&profile.payload_identifier, &acme.common)
                }
                Payload::Mdm(_) => self.unenroll(),
                Payload::Other(common) => {
                    tracing::warn!(
                        payload_type = %common.payload_type,
                        payload_uuid = %common.payload_uuid,
                        "unknown payload type not processed"
                    );
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::error!(
                    udid = %self.udid,
                    profile_id = %profile.payload_identifier,
                    error = %e,
                    "error removing payload"
                );
            }
        }

        self.profile_store().remove(&profile.payload_identifier)
    }

    /// Delete the identity trio a certificate payload created, plus its
    /// payload reference.
    fn remove_identity_payload(
        &self,
        profile_id: &str,
        common: &CommonPayload,
    ) -> color_eyre::eyre::Result<()> {
        let store = self.profile_store();
        let identity_uuid = store.load_payload_ref(profile_id, common, REF_KEYCHAIN_IDENTITY)?;

        let keychain = self.system_keychain();
        let identity_item = keychain.load_item(&identity_uuid)?;
        let ItemContent::Identity {
            key_uuid,
            cert_uuid,
        } = &identity_item.content
        else {
            color_eyre::eyre::bail!("payload ref {identity_uuid} is not an identity item");
        };

        let key_item = keychain.load_item(key_uuid)?;
        let cert_item = keychain.load_item(cert_uuid)?;

        keychain.delete(&cert_item.uuid)?;
        keychain.delete(&key_item.uuid)?;
        keychain.delete(&identity_item.uuid)?;

        store.remove_payload_ref(profile_id, common, REF_KEYCHAIN_IDENTITY)
    }

    /// Clear the MDM enrollment state from the device record.
    fn unenroll(&mut self) -> color_eyre::eyre::Result<()> {
        MdmClient::unenroll_device(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdmsim_store::KvStore;

    fn test_device() -> (tempfile::TempDir, Device) {
        let dir = tempfile::tempdir().unwrap();
        let db = KvStore::open(&dir.path().join("test.db")).unwrap();
        let device = Device::new("", db);
        (dir, device)
    }

    fn profile_with_payloads(payloads_xml: &str) -> Profile {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>PayloadIdentifier</key><string>com.example.test</string>
<key>PayloadUUID</key><string>00000000-0000-0000-0000-000000000000</string>
<key>PayloadType</key><string>Configuration</string>
<key>PayloadVersion</key><integer>1</integer>
<key>PayloadContent</key><array>{payloads_xml}</array>
</dict></plist>"#
        );
        Profile::from_bytes(xml.as_bytes()).unwrap()
    }

    fn mdm_payload_xml(server_url: &str) -> String {
        format!(
            r#"<dict>
<key>PayloadIdentifier</key><string>com.example.test.mdm</string>
<key>PayloadUUID</key><string>MDM-UUID</string>
<key>PayloadType</key><string>com.apple.mdm</string>
<key>ServerURL</key><string>{server_url}</string>
<key>Topic</key><string>com.apple.mgmt.External.x</string>
<key>IdentityCertificateUUID</key><string>SCEP-UUID</string>
<key>SignMessage</key><true/>
</dict>"#
        )
    }

    const SCEP_PAYLOAD_XML: &str = r#"<dict>
<key>PayloadIdentifier</key><string>com.example.test.scep</string>
<key>PayloadUUID</key><string>SCEP-UUID</string>
<key>PayloadType</key><string>com.apple.security.scep</string>
<key>PayloadContent</key><dict>
  <key>URL</key><string>https://scep.example.com/scep</string>
</dict>
</dict>"#;

    const OTHER_PAYLOAD_XML: &str = r#"<dict>
<key>PayloadIdentifier</key><string>com.example.test.other</string>
<key>PayloadUUID</key><string>OTHER-UUID</string>
<key>PayloadType</key><string>com.example.custom</string>
</dict>"#;

    #[test]
    fn test_classify_flags() {
        let profile = profile_with_payloads(&format!(
            "{}{}{}",
            mdm_payload_xml("https://mdm.example.com"),
            SCEP_PAYLOAD_XML,
            OTHER_PAYLOAD_XML
        ));
        let classified = classify_payloads(&profile).unwrap();

        assert_eq!(
            classified[0].flags,
            PAYLOAD_REQUIRES_NETWORK | PAYLOAD_REQUIRES_IDENTITIES
        );
        assert_eq!(classified[1].flags, PAYLOAD_REQUIRES_NETWORK);
        assert_eq!(classified[2].flags, 0);
    }

    #[test]
    fn test_install_order_identities_before_mdm() {
        let profile = profile_with_payloads(&format!(
            "{}{}{}",
            mdm_payload_xml("https://mdm.example.com"),
            SCEP_PAYLOAD_XML,
            OTHER_PAYLOAD_XML
        ));
        let mut classified = classify_payloads(&profile).unwrap();
        sort_for_install(&mut classified);

        assert!(matches!(classified[0].payload, Payload::Other(_)));
        assert!(matches!(classified[1].payload, Payload::Scep(_)));
        assert!(matches!(classified[2].payload, Payload::Mdm(_)));
    }

    #[test]
    fn test_remove_order_mdm_first() {
        let profile = profile_with_payloads(&format!(
            "{}{}",
            SCEP_PAYLOAD_XML,
            mdm_payload_xml("https://mdm.example.com")
        ));
        let mut classified = classify_payloads(&profile).unwrap();
        sort_for_remove(&mut classified);

        assert!(matches!(classified[0].payload, Payload::Mdm(_)));
        assert!(matches!(classified[1].payload, Payload::Scep(_)));
    }

    #[test]
    fn test_sort_is_stable_for_equal_flags() {
        let profile = profile_with_payloads(&format!(
            "{}{}",
            SCEP_PAYLOAD_XML,
            SCEP_PAYLOAD_XML.replace("SCEP-UUID", "SCEP-UUID-2")
        ));
        let mut classified = classify_payloads(&profile).unwrap();
        sort_for_install(&mut classified);

        assert_eq!(classified[0].payload.common().payload_uuid, "SCEP-UUID");
        assert_eq!(classified[1].payload.common().payload_uuid, "SCEP-UUID-2");
    }

    #[test]
    fn test_validate_two_mdm_payloads() {
        let (_dir, device) = test_device();
        let profile = profile_with_payloads(&format!(
            "{}{}",
            mdm_payload_xml("https://mdm.example.com"),
            mdm_payload_xml("https://mdm.example.com").replace("MDM-UUID", "MDM-UUID-2")
        ));
        assert!(device.validate_profile_install(&profile, false).is_err());
    }

    #[test]
    fn test_validate_already_enrolled() {
        let (_dir, mut device) = test_device();
        device.mdm_profile_identifier = "com.example.other".into();

        let profile = profile_with_payloads(&mdm_payload_xml("https://mdm.example.com"));
        assert!(device.validate_profile_install(&profile, false).is_err());
    }

    #[test]
    fn test_validate_server_url_rebinding_forbidden() {
        let (_dir, mut device) = test_device();

        // persist an installed enrollment profile with one server URL
        let old = profile_with_payloads(&mdm_payload_xml("https://mdm.example.com/old"));
        device
            .profile_store()
            .persist(&old.to_xml().unwrap(), &old.payload_identifier)
            .unwrap();
        device.mdm_profile_identifier = old.payload_identifier.clone();

        let same = profile_with_payloads(&mdm_payload_xml("https://mdm.example.com/old"));
        assert!(device.validate_profile_install(&same, true).is_ok());

        let rebound = profile_with_payloads(&mdm_payload_xml("https://mdm.example.com/new"));
        assert!(device.validate_profile_install(&rebound, true).is_err());
    }

    #[test]
    fn test_validate_no_mdm_payload_is_fine() {
        let (_dir, device) = test_device();
        let profile = profile_with_payloads(OTHER_PAYLOAD_XML);
        assert!(device.validate_profile_install(&profile, false).is_ok());
    }

    #[tokio::test]
    async fn test_install_empty_profile_rejected() {
        let (_dir, mut device) = test_device();
        let http = reqwest::Client::new();
        assert!(device.install_profile(&http, None, &[], false).await.is_err());
    }

    #[test]
    fn test_remove_profile_clears_enrollment_state() {
        let (_dir, mut device) = test_device();

        let profile = profile_with_payloads(&format!(
            "{}{}",
            SCEP_PAYLOAD_XML,
            mdm_payload_xml("https://mdm.example.com")
        ));
        let blob = profile.to_xml().unwrap();
        device
            .profile_store()
            .persist(&blob, &profile.payload_identifier)
            .unwrap();

        // identity trio as a SCEP install would have left it
        let keychain = device.system_keychain();
        let key_item = KeychainItem::new(ItemContent::Key(DeviceKey::P256(
            p256::SecretKey::random(&mut rand::rngs::OsRng),
        )));
        keychain.save(&key_item).unwrap();
        let cert_slot = KeychainItem::new(ItemContent::Key(DeviceKey::P256(
            p256::SecretKey::random(&mut rand::rngs::OsRng),
        )));
        keychain.save(&cert_slot).unwrap();
        let identity_item = KeychainItem::new(ItemContent::Identity {
            key_uuid: key_item.uuid.clone(),
            cert_uuid: cert_slot.uuid.clone(),
        });
        keychain.save(&identity_item).unwrap();

        let scep_common = profile.scep_payloads().unwrap()[0].common.clone();
        device
            .profile_store()
            .save_payload_ref(
                &profile.payload_identifier,
                &scep_common,
                REF_KEYCHAIN_IDENTITY,
                &identity_item.uuid,
            )
            .unwrap();

        device.mdm_identity_keychain_uuid = identity_item.uuid.clone();
        device.mdm_profile_identifier = profile.payload_identifier.clone();
        device.save().unwrap();

        device.remove_profile(&profile.payload_identifier).unwrap();

        assert!(device.mdm_identity_keychain_uuid.is_empty());
        assert!(device.mdm_profile_identifier.is_empty());
        assert!(keychain.load_item(&identity_item.uuid).is_err());
        assert!(keychain.load_item(&key_item.uuid).is_err());
        assert!(keychain.load_item(&cert_slot.uuid).is_err());
        assert!(device.profile_store().list_uuids().unwrap().is_empty());
        assert_eq!(
            device
                .profile_store()
                .load_payload_ref(
                    &profile.payload_identifier,
                    &scep_common,
                    REF_KEYCHAIN_IDENTITY
                )
                .unwrap(),
            ""
        );

    }

    #[test]
    fn test_save_and_remove_identity_items() {
        let (_dir, device) = test_device();

        let key = DeviceKey::P256(p256::SecretKey::random(&mut rand::rngs::OsRng));
        let keychain = device.system_keychain();

        let key_item = KeychainItem::new(ItemContent::Key(key));
        keychain.save(&key_item).unwrap();
        let identity_item = KeychainItem::new(ItemContent::Identity {
            key_uuid: key_item.uuid.clone(),
            cert_uuid: key_item.uuid.clone(),
        });
        keychain.save(&identity_item).unwrap();

        // loading back through the identity works
        let loaded = keychain.load_item(&identity_item.uuid).unwrap();
        assert!(matches!(loaded.content, ItemContent::Identity { .. }));
    }
}
