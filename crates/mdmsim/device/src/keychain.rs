//! Per-device keychain and its items.

use color_eyre::eyre::WrapErr as _;
use der::{Decode as _, Encode as _};
use mdmsim_store::{buckets, KvStore};
use rsa::pkcs1::{DecodeRsaPrivateKey as _, EncodeRsaPrivateKey as _};
use x509_cert::Certificate;

/// The only keychain type currently modeled.
pub const KEYCHAIN_SYSTEM: &str = "System";

const CLASS_CERTIFICATE: i64 = 1;
const CLASS_KEY: i64 = 2;
const CLASS_IDENTITY: i64 = 3;

/// A private key held by a keychain item. RSA keys come from SCEP and
/// RSA ACME payloads; EC keys only from ACME.
#[derive(Clone)]
pub enum DeviceKey {
    /// RSA private key, persisted in PKCS#1 form.
    Rsa(rsa::RsaPrivateKey),
    /// NIST P-256 private key, persisted in SEC1 form.
    P256(p256::SecretKey),
    /// NIST P-384 private key, persisted in SEC1 form.
    P384(p384::SecretKey),
    /// NIST P-521 private key, persisted in SEC1 form.
    P521(p521::SecretKey),
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(_) => write!(f, "DeviceKey::Rsa"),
            Self::P256(_) => write!(f, "DeviceKey::P256"),
            Self::P384(_) => write!(f, "DeviceKey::P384"),
            Self::P521(_) => write!(f, "DeviceKey::P521"),
        }
    }
}

impl DeviceKey {
    /// Serialize the key for keychain storage: PKCS#1 DER for RSA, SEC1
    /// DER for EC keys.
    pub fn encode(&self) -> color_eyre::eyre::Result<Vec<u8>> {
        match self {
            Self::Rsa(key) => Ok(key
                .to_pkcs1_der()
                .wrap_err("failed to encode RSA key")?
                .as_bytes()
                .to_vec()),
            Self::P256(key) => Ok(key
                .to_sec1_der()
                .wrap_err("failed to encode P-256 key")?
                .to_vec()),
            Self::P384(key) => Ok(key
                .to_sec1_der()
                .wrap_err("failed to encode P-384 key")?
                .to_vec()),
            Self::P521(key) => Ok(key
                .to_sec1_der()
                .wrap_err("failed to encode P-521 key")?
                .to_vec()),
        }
    }

    /// Deserialize a stored key. RSA is tried first, then each EC curve.
    pub fn decode(der: &[u8]) -> color_eyre::eyre::Result<Self> {
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs1_der(der) {
            return Ok(Self::Rsa(key));
        }
        if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
            return Ok(Self::P256(key));
        }
        if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
            return Ok(Self::P384(key));
        }
        if let Ok(key) = p521::SecretKey::from_sec1_der(der) {
            return Ok(Self::P521(key));
        }
        color_eyre::eyre::bail!("stored key is neither PKCS#1 RSA nor SEC1 EC")
    }
}

/// Content of a keychain item, one variant per item class.
#[derive(Debug, Clone)]
pub enum ItemContent {
    /// A DER-encoded X.509 certificate.
    Certificate(Certificate),
    /// A private key.
    Key(DeviceKey),
    /// A pairing of a key item and a certificate item by UUID.
    Identity {
        /// UUID of the key item.
        key_uuid: String,
        /// UUID of the certificate item.
        cert_uuid: String,
    },
}

impl ItemContent {
    fn class(&self) -> i64 {
        match self {
            Self::Certificate(_) => CLASS_CERTIFICATE,
            Self::Key(_) => CLASS_KEY,
            Self::Identity { .. } => CLASS_IDENTITY,
        }
    }

    fn encode(&self) -> color_eyre::eyre::Result<Vec<u8>> {
        match self {
            Self::Certificate(cert) => {
                cert.to_der().wrap_err("failed to encode certificate item")
            }
            Self::Key(key) => key.encode(),
            Self::Identity {
                key_uuid,
                cert_uuid,
            } => {
                if key_uuid.is_empty() || cert_uuid.is_empty() {
                    color_eyre::eyre::bail!(
                        "must provide UUIDs for key and cert for identity keychain item"
                    );
                }
                Ok(format!("{key_uuid},{cert_uuid}").into_bytes())
            }
        }
    }

    fn decode(class: i64, item: &[u8]) -> color_eyre::eyre::Result<Self> {
        match class {
            CLASS_CERTIFICATE => Ok(Self::Certificate(
                Certificate::from_der(item).wrap_err("failed to parse certificate item")?,
            )),
            CLASS_KEY => Ok(Self::Key(DeviceKey::decode(item)?)),
            CLASS_IDENTITY => {
                let s = std::str::from_utf8(item).wrap_err("identity item is not UTF-8")?;
                let Some((key_uuid, cert_uuid)) = s.split_once(',') else {
                    color_eyre::eyre::bail!("invalid identity keychain item");
                };
                if key_uuid.is_empty() || cert_uuid.is_empty() || cert_uuid.contains(',') {
                    color_eyre::eyre::bail!("invalid identity keychain item");
                }
                Ok(Self::Identity {
                    key_uuid: key_uuid.to_string(),
                    cert_uuid: cert_uuid.to_string(),
                })
            }
            other => color_eyre::eyre::bail!("invalid keychain item class {other}"),
        }
    }
}

/// A single keychain item.
#[derive(Debug, Clone)]
pub struct KeychainItem {
    /// Item UUID (uppercase).
    pub uuid: String,
    /// Decoded item content.
    pub content: ItemContent,
}

impl KeychainItem {
    /// Create a new item with a fresh uppercase UUID.
    pub fn new(content: ItemContent) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string().to_uppercase(),
            content,
        }
    }
}

/// A view over the KV store scoped to one device's keychain.
#[derive(Clone)]
pub struct Keychain {
    /// Owning device UDID.
    pub id: String,
    /// Keychain type, currently always [`KEYCHAIN_SYSTEM`].
    pub kc_type: String,

    db: KvStore,
}

impl Keychain {
    /// Open a keychain view for a device.
    pub fn new(id: impl Into<String>, kc_type: impl Into<String>, db: KvStore) -> Self {
        Self {
            id: id.into(),
            kc_type: kc_type.into(),
            db,
        }
    }

    fn item_key(&self, uuid: &str) -> String {
        format!("{}_{}_{}", self.id, self.kc_type, uuid)
    }

    /// Persist an item. Payload and class move in one transaction.
    pub fn save(&self, item: &KeychainItem) -> color_eyre::eyre::Result<()> {
        let encoded = item.content.encode()?;
        let key = self.item_key(&item.uuid);
        let class = item.content.class();
        self.db.update(|tx| {
            tx.put_or_delete(buckets::KEYCHAIN_ITEMS_ITEM, &key, &encoded)?;
            tx.put_or_delete_int(buckets::KEYCHAIN_ITEM_CLASS, &key, class)
        })?;
        Ok(())
    }

    /// Load an item by UUID. Empty payload or class zero is an error.
    pub fn load_item(&self, uuid: &str) -> color_eyre::eyre::Result<KeychainItem> {
        let key = self.item_key(uuid);
        let item = self
            .db
            .get(buckets::KEYCHAIN_ITEMS_ITEM, &key)?
            .unwrap_or_default();
        if item.is_empty() {
            color_eyre::eyre::bail!("empty keychain item");
        }
        let class = self.db.get_int(buckets::KEYCHAIN_ITEM_CLASS, &key)?;
        if class == 0 {
            color_eyre::eyre::bail!("invalid keychain item class 0");
        }
        Ok(KeychainItem {
            uuid: uuid.to_string(),
            content: ItemContent::decode(class, &item)?,
        })
    }

    /// Delete an item by UUID, clearing both buckets together.
    pub fn delete(&self, uuid: &str) -> color_eyre::eyre::Result<()> {
        let key = self.item_key(uuid);
        self.db.update(|tx| {
            tx.put_or_delete(buckets::KEYCHAIN_ITEMS_ITEM, &key, &[])?;
            tx.put_or_delete_int(buckets::KEYCHAIN_ITEM_CLASS, &key, 0)
        })?;
        Ok(())
    }
}
