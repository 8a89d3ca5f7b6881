//! Per-device repository of installed configuration profiles.

use color_eyre::eyre::WrapErr as _;
use mdmsim_profiles::{CommonPayload, Profile};
use mdmsim_store::{buckets, KvStore};

/// Role key for the keychain identity produced by a cert-minting payload.
pub const REF_KEYCHAIN_IDENTITY: &str = "keychain_identity";

/// A view over the KV store holding one device's installed profiles and
/// their per-payload side effects.
#[derive(Clone)]
pub struct ProfileStore {
    /// Owning device UDID.
    pub id: String,

    db: KvStore,
}

impl ProfileStore {
    /// Open a profile store view for a device.
    pub fn new(id: impl Into<String>, db: KvStore) -> Self {
        Self { id: id.into(), db }
    }

    fn profile_key(&self, profile_id: &str) -> String {
        format!("{}_{}", self.id, profile_id)
    }

    fn ref_key(common: &CommonPayload, profile_id: &str, role: &str) -> String {
        format!(
            "{}_{}_{}_{}",
            profile_id, common.payload_identifier, common.payload_uuid, role
        )
    }

    /// Store a raw profile blob under its identifier.
    pub fn persist(&self, blob: &[u8], profile_id: &str) -> color_eyre::eyre::Result<()> {
        if blob.is_empty() {
            color_eyre::eyre::bail!("empty profile");
        }
        self.db
            .put_or_delete(buckets::PROFILES, &self.profile_key(profile_id), blob)?;
        Ok(())
    }

    /// Load and parse an installed profile.
    pub fn load(&self, profile_id: &str) -> color_eyre::eyre::Result<Profile> {
        let blob = self
            .db
            .get(buckets::PROFILES, &self.profile_key(profile_id))?
            .unwrap_or_default();
        if blob.is_empty() {
            color_eyre::eyre::bail!("missing or zero-length profile: {profile_id}");
        }
        Profile::from_bytes(&blob).wrap_err_with(|| format!("parsing profile {profile_id}"))
    }

    /// Remove an installed profile blob.
    pub fn remove(&self, profile_id: &str) -> color_eyre::eyre::Result<()> {
        self.db
            .put_or_delete(buckets::PROFILES, &self.profile_key(profile_id), &[])?;
        Ok(())
    }

    /// Save a per-payload reference string under a role key.
    pub fn save_payload_ref(
        &self,
        profile_id: &str,
        common: &CommonPayload,
        role: &str,
        value: &str,
    ) -> color_eyre::eyre::Result<()> {
        if value.is_empty() {
            color_eyre::eyre::bail!("no payload ref value to save");
        }
        self.db.put_or_delete_str(
            buckets::PROFILE_PAYLOAD_REFS,
            &Self::ref_key(common, profile_id, role),
            value,
        )?;
        Ok(())
    }

    /// Load a per-payload reference string, empty when absent.
    pub fn load_payload_ref(
        &self,
        profile_id: &str,
        common: &CommonPayload,
        role: &str,
    ) -> color_eyre::eyre::Result<String> {
        Ok(self.db.get_string(
            buckets::PROFILE_PAYLOAD_REFS,
            &Self::ref_key(common, profile_id, role),
        )?)
    }

    /// Remove a per-payload reference string.
    pub fn remove_payload_ref(
        &self,
        profile_id: &str,
        common: &CommonPayload,
        role: &str,
    ) -> color_eyre::eyre::Result<()> {
        self.db.put_or_delete_str(
            buckets::PROFILE_PAYLOAD_REFS,
            &Self::ref_key(common, profile_id, role),
            "",
        )?;
        Ok(())
    }

    /// List installed profile identifiers for this device.
    pub fn list_uuids(&self) -> color_eyre::eyre::Result<Vec<String>> {
        Ok(self
            .db
            .keys_with_prefix(buckets::PROFILES, &format!("{}_", self.id), true)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn sample_profile_xml(id: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>PayloadIdentifier</key><string>{id}</string>
<key>PayloadUUID</key><string>11111111-2222-3333-4444-555555555555</string>
<key>PayloadType</key><string>Configuration</string>
<key>PayloadVersion</key><integer>1</integer>
<key>PayloadContent</key><array/>
</dict></plist>"#
        )
        .into_bytes()
    }

    #[test]
    fn test_persist_and_load() {
        let (_dir, db) = open_temp();
        let ps = ProfileStore::new("UDID", db);

        let blob = sample_profile_xml("com.example.test");
        ps.persist(&blob, "com.example.test").unwrap();

        let profile = ps.load("com.example.test").unwrap();
        assert_eq!(profile.payload_identifier, "com.example.test");
    }

    #[test]
    fn test_empty_blob_rejected() {
        let (_dir, db) = open_temp();
        let ps = ProfileStore::new("UDID", db);
        assert!(ps.persist(&[], "com.example.test").is_err());
    }

    #[test]
    fn test_load_missing_fails() {
        let (_dir, db) = open_temp();
        let ps = ProfileStore::new("UDID", db);
        assert!(ps.load("com.example.missing").is_err());
    }

    #[test]
    fn test_remove() {
        let (_dir, db) = open_temp();
        let ps = ProfileStore::new("UDID", db);

        ps.persist(&sample_profile_xml("com.example.test"), "com.example.test")
            .unwrap();
        ps.remove("com.example.test").unwrap();
        assert!(ps.load("com.example.test").is_err());
    }

    #[test]
    fn test_list_uuids_scoped_to_device() {
        let (_dir, db) = open_temp();
        let ps1 = ProfileStore::new("DEV1", db.clone());
        let ps2 = ProfileStore::new("DEV2", db);

        ps1.persist(&sample_profile_xml("com.example.a"), "com.example.a")
            .unwrap();
        ps2.persist(&sample_profile_xml("com.example.b"), "com.example.b")
            .unwrap();

        assert_eq!(ps1.list_uuids().unwrap(), vec!["com.example.a".to_string()]);
        assert_eq!(ps2.list_uuids().unwrap(), vec!["com.example.b".to_string()]);
    }

    #[test]
    fn test_payload_refs() {
        let (_dir, db) = open_temp();
        let ps = ProfileStore::new("UDID", db);

        let common = CommonPayload {
            payload_identifier: "com.example.test.scep".into(),
            payload_uuid: "AAAA".into(),
            payload_type: "com.apple.security.scep".into(),
            ..Default::default()
        };

        assert!(ps
            .save_payload_ref("com.example.test", &common, REF_KEYCHAIN_IDENTITY, "")
            .is_err());

        ps.save_payload_ref("com.example.test", &common, REF_KEYCHAIN_IDENTITY, "ID-1")
            .unwrap();
        assert_eq!(
            ps.load_payload_ref("com.example.test", &common, REF_KEYCHAIN_IDENTITY)
                .unwrap(),
            "ID-1"
        );

        ps.remove_payload_ref("com.example.test", &common, REF_KEYCHAIN_IDENTITY)
            .unwrap();
        assert_eq!(
            ps.load_payload_ref("com.example.test", &common, REF_KEYCHAIN_IDENTITY)
                .unwrap(),
            ""
        );
    }
}
