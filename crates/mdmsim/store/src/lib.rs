//! Storage Primitives
//!
//! Bucketed key-value storage for simulated device state. Keys and values
//! are byte strings; an empty value deletes its key, which gives every
//! caller idempotent put-or-delete semantics.

mod error;
mod kv;

pub use error::StoreError;
pub use kv::{KvStore, KvTxn};

/// Bucket names for all persisted simulator state.
pub mod buckets {
    /// Device serial number, keyed by UDID.
    pub const DEVICE_SERIAL: &str = "device_serial";
    /// Device computer name, keyed by UDID.
    pub const DEVICE_COMPUTER_NAME: &str = "device_computer_name";
    /// UUID of the keychain identity backing the MDM enrollment, keyed by UDID.
    pub const DEVICE_MDM_IDENTITY_KEYCHAIN_UUID: &str = "device_mdm_identity_keychain_uuid";
    /// Identifier of the profile that established MDM, keyed by UDID.
    pub const DEVICE_MDM_PROFILE_ID: &str = "device_mdm_profile_id";
    /// Raw keychain item payload, keyed by `ID_Type_UUID`.
    pub const KEYCHAIN_ITEMS_ITEM: &str = "keychain_items_item";
    /// Keychain item class tag, keyed by `ID_Type_UUID`.
    pub const KEYCHAIN_ITEM_CLASS: &str = "keychain_item_class";
    /// Installed profile plists, keyed by `deviceUDID_profileID`.
    pub const PROFILES: &str = "profiles";
    /// Per-payload reference strings, keyed by `profileID_subID_subUUID_role`.
    pub const PROFILE_PAYLOAD_REFS: &str = "profile_payload_refs";
}
