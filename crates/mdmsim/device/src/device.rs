//! The simulated device record.

use mdmsim_store::{buckets, KvStore};
use rand::Rng as _;

use crate::keychain::{Keychain, KEYCHAIN_SYSTEM};
use crate::profile_store::ProfileStore;

/// Serial number alphabet: digits and uppercase letters minus the
/// ambiguous I, L and O.
const SERIAL_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTUVWXYZ";
const SERIAL_LEN: usize = 12;

/// A pseudo Apple device for MDM interactions.
#[derive(Debug, Clone)]
pub struct Device {
    /// Uppercase UUID, the primary key for all persisted device state.
    pub udid: String,
    /// 12-character serial number.
    pub serial: String,
    /// Device name reported to the MDM server.
    pub computer_name: String,
    /// UUID of the keychain identity backing the current MDM enrollment.
    pub mdm_identity_keychain_uuid: String,
    /// Identifier of the installed profile that established MDM.
    pub mdm_profile_identifier: String,

    db: KvStore,
}

fn random_serial() -> String {
    let mut rng = rand::thread_rng();
    (0..SERIAL_LEN)
        .map(|_| SERIAL_ALPHABET[rng.gen_range(0..SERIAL_ALPHABET.len())] as char)
        .collect()
}

impl Device {
    /// Create a new device with a fresh UDID and serial. An empty name
    /// defaults to `<serial>'s Computer`.
    pub fn new(name: &str, db: KvStore) -> Self {
        let serial = random_serial();
        let computer_name = if name.is_empty() {
            format!("{serial}'s Computer")
        } else {
            name.to_string()
        };
        Self {
            udid: uuid::Uuid::new_v4().to_string().to_uppercase(),
            serial,
            computer_name,
            mdm_identity_keychain_uuid: String::new(),
            mdm_profile_identifier: String::new(),
            db,
        }
    }

    fn valid(&self) -> bool {
        !self.udid.is_empty()
    }

    /// Persist the device. Blank fields delete their rows.
    pub fn save(&self) -> color_eyre::eyre::Result<()> {
        if !self.valid() {
            color_eyre::eyre::bail!("invalid device");
        }
        self.db.update(|tx| {
            tx.put_or_delete_str(buckets::DEVICE_SERIAL, &self.udid, &self.serial)?;
            tx.put_or_delete_str(
                buckets::DEVICE_COMPUTER_NAME,
                &self.udid,
                &self.computer_name,
            )?;
            tx.put_or_delete_str(
                buckets::DEVICE_MDM_IDENTITY_KEYCHAIN_UUID,
                &self.udid,
                &self.mdm_identity_keychain_uuid,
            )?;
            tx.put_or_delete_str(
                buckets::DEVICE_MDM_PROFILE_ID,
                &self.udid,
                &self.mdm_profile_identifier,
            )
        })?;
        Ok(())
    }

    /// Load a device by UDID. A device with no stored serial is unknown.
    pub fn load(udid: &str, db: KvStore) -> color_eyre::eyre::Result<Self> {
        let serial = db.get_string(buckets::DEVICE_SERIAL, udid)?;
        if serial.is_empty() {
            color_eyre::eyre::bail!("device not found: {udid}");
        }
        Ok(Self {
            udid: udid.to_string(),
            serial,
            computer_name: db.get_string(buckets::DEVICE_COMPUTER_NAME, udid)?,
            mdm_identity_keychain_uuid: db
                .get_string(buckets::DEVICE_MDM_IDENTITY_KEYCHAIN_UUID, udid)?,
            mdm_profile_identifier: db.get_string(buckets::DEVICE_MDM_PROFILE_ID, udid)?,
            db,
        })
    }

    /// Enumerate all device UDIDs.
    pub fn list(db: &KvStore) -> color_eyre::eyre::Result<Vec<String>> {
        let udids = db.keys_with_prefix(buckets::DEVICE_SERIAL, "", false)?;
        if udids.is_empty() {
            color_eyre::eyre::bail!("no devices found");
        }
        Ok(udids)
    }

    /// The device's system keychain.
    pub fn system_keychain(&self) -> Keychain {
        Keychain::new(&self.udid, KEYCHAIN_SYSTEM, self.db.clone())
    }

    /// The device's profile store.
    pub fn profile_store(&self) -> ProfileStore {
        ProfileStore::new(&self.udid, self.db.clone())
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

    #[test]
    fn test_serial_alphabet() {
        for _ in 0..32 {
            let serial = random_serial();
            assert_eq!(serial.len(), 12);
            for c in serial.bytes() {
                assert!(SERIAL_ALPHABET.contains(&c), "bad serial char: {}", c as char);
                assert!(![b'I', b'L', b'O'].contains(&c));
            }
        }
    }

    #[test]
    fn test_default_computer_name() {
        let (_dir, db) = open_temp();
        let device = Device::new("", db);
        assert_eq!(device.computer_name, format!("{}'s Computer", device.serial));
    }

    #[test]
    fn test_explicit_name() {
        let (_dir, db) = open_temp();
        let device = Device::new("test box", db);
        assert_eq!(device.computer_name, "test box");
    }

    #[test]
    fn test_udid_is_uppercase() {
        let (_dir, db) = open_temp();
        let device = Device::new("", db);
        assert_eq!(device.udid, device.udid.to_uppercase());
        assert!(!device.udid.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, db) = open_temp();
        let mut device = Device::new("roundtrip", db.clone());
        device.mdm_identity_keychain_uuid = "IDENTITY-UUID".into();
        device.mdm_profile_identifier = "com.example.profile".into();
        device.save().unwrap();

        let loaded = Device::load(&device.udid, db).unwrap();
        assert_eq!(loaded.serial, device.serial);
        assert_eq!(loaded.computer_name, "roundtrip");
        assert_eq!(loaded.mdm_identity_keychain_uuid, "IDENTITY-UUID");
        assert_eq!(loaded.mdm_profile_identifier, "com.example.profile");
    }

    #[test]
    fn test_blank_fields_delete_rows() {
        let (_dir, db) = open_temp();
        let mut device = Device::new("", db.clone());
        device.mdm_profile_identifier = "com.example.profile".into();
        device.save().unwrap();

        device.mdm_profile_identifier = String::new();
        device.save().unwrap();

        assert!(db
            .get(buckets::DEVICE_MDM_PROFILE_ID, &device.udid)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_load_unknown_device_fails() {
        let (_dir, db) = open_temp();
        assert!(Device::load("NOT-A-DEVICE", db).is_err());
    }

    #[test]
    fn test_list() {
        let (_dir, db) = open_temp();
        assert!(Device::list(&db).is_err());

        let a = Device::new("", db.clone());
        a.save().unwrap();
        let b = Device::new("", db.clone());
        b.save().unwrap();

        let mut udids = Device::list(&db).unwrap();
        udids.sort();
        let mut expected = vec![a.udid, b.udid];
        expected.sort();
        assert_eq!(udids, expected);
    }
}
