//! Payload variants carried inside a configuration profile.

/// PayloadType value for SCEP payloads.
pub const SCEP_PAYLOAD_TYPE: &str = "com.apple.security.scep";

/// PayloadType value for ACME certificate payloads.
pub const ACME_PAYLOAD_TYPE: &str = "com.apple.security.acme";

/// PayloadType value for MDM payloads.
pub const MDM_PAYLOAD_TYPE: &str = "com.apple.mdm";

/// Keys common to every payload dictionary.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonPayload {
    /// Reverse-DNS payload identifier.
    pub payload_identifier: String,

    /// Payload instance UUID.
    #[serde(rename = "PayloadUUID")]
    pub payload_uuid: String,

    /// Payload type string.
    pub payload_type: String,

    /// Payload format version.
    #[serde(default)]
    pub payload_version: i64,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_display_name: Option<String>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_description: Option<String>,

    /// Organization name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_organization: Option<String>,
}

/// A classified profile payload.
#[derive(Debug, Clone)]
pub enum Payload {
    /// SCEP certificate enrollment payload.
    Scep(ScepPayload),
    /// ACME certificate enrollment payload.
    Acme(AcmeCertificatePayload),
    /// MDM enrollment payload.
    Mdm(MdmPayload),
    /// Any other payload type, common metadata only.
    Other(CommonPayload),
}

impl Payload {
    /// The common payload metadata, regardless of variant.
    pub fn common(&self) -> &CommonPayload {
        match self {
            Self::Scep(p) => &p.common,
            Self::Acme(p) => &p.common,
            Self::Mdm(p) => &p.common,
            Self::Other(c) => c,
        }
    }
}

/// SCEP payload wrapper. The protocol settings live in the nested
/// `PayloadContent` dictionary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScepPayload {
    /// Common payload metadata.
    #[serde(flatten)]
    pub common: CommonPayload,

    /// SCEP protocol settings.
    #[serde(rename = "PayloadContent")]
    pub content: ScepContent,
}

/// Nested SCEP protocol settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScepContent {
    /// SCEP server URL.
    #[serde(rename = "URL")]
    pub url: String,

    /// CA identity name, sent as the GetCACert message.
    #[serde(rename = "Name", default)]
    pub name: String,

    /// Challenge password for the CSR.
    #[serde(rename = "Challenge", default)]
    pub challenge: String,

    /// RSA key size in bits.
    #[serde(rename = "Keysize", default)]
    pub key_size: u32,

    /// Key type; empty or "RSA".
    #[serde(rename = "Key Type", default)]
    pub key_type: String,

    /// X.509 key usage bits for the CSR.
    #[serde(rename = "Key Usage", default)]
    pub key_usage: u16,

    /// Subject RDNs as nested OID/value arrays.
    #[serde(rename = "Subject", default)]
    pub subject: Vec<Vec<Vec<String>>>,

    /// Expected CA certificate fingerprint; hash inferred from length.
    #[serde(rename = "CAFingerprint", default, skip_serializing_if = "Option::is_none")]
    pub ca_fingerprint: Option<plist::Data>,
}

/// ACME certificate payload.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AcmeCertificatePayload {
    /// Common payload metadata.
    #[serde(flatten)]
    pub common: CommonPayload,

    /// Whether the device must attest to the key.
    #[serde(default)]
    pub attest: bool,

    /// Whether the key must be hardware bound.
    #[serde(default)]
    pub hardware_bound: bool,

    /// Opaque identifier the ACME server validates ownership of.
    #[serde(default)]
    pub client_identifier: String,

    /// ACME directory URL.
    #[serde(rename = "DirectoryURL", default)]
    pub directory_url: String,

    /// Key type: "RSA" or "ECSECPrimeRandom".
    #[serde(default)]
    pub key_type: String,

    /// Key size in bits (RSA) or curve size (EC).
    #[serde(default)]
    pub key_size: u32,

    /// X.509 key usage bits for the CSR; defaults to digital signature.
    #[serde(default)]
    pub usage_flags: u16,

    /// Extended key usage OIDs in dotted form.
    #[serde(default)]
    pub extended_key_usage: Vec<String>,

    /// Subject RDNs as nested OID/value arrays.
    #[serde(default)]
    pub subject: Vec<Vec<Vec<String>>>,

    /// Requested subject alternative names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_alt_name: Option<AcmeSubjectAltName>,

    /// Whether the private key may leave the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_is_extractable: Option<bool>,
}

/// SubjectAltName contents of an ACME payload.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AcmeSubjectAltName {
    /// DNS names.
    #[serde(rename = "dNSName", default)]
    pub dns_names: Vec<String>,

    /// RFC 822 email addresses.
    #[serde(rename = "rfc822Name", default)]
    pub rfc822_names: Vec<String>,

    /// URIs.
    #[serde(rename = "uniformResourceIdentifier", default)]
    pub uris: Vec<String>,

    /// Microsoft user principal names.
    #[serde(rename = "ntPrincipalName", default)]
    pub nt_principal_names: Vec<String>,
}

/// MDM enrollment payload.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MdmPayload {
    /// Common payload metadata.
    #[serde(flatten)]
    pub common: CommonPayload,

    /// Command (Connect) endpoint URL.
    #[serde(rename = "ServerURL")]
    pub server_url: String,

    /// Check-in endpoint URL; the server URL is used when empty.
    #[serde(rename = "CheckInURL", default)]
    pub check_in_url: String,

    /// APNs topic for the enrollment.
    #[serde(default)]
    pub topic: String,

    /// PayloadUUID of the sibling payload providing the client identity.
    #[serde(rename = "IdentityCertificateUUID")]
    pub identity_certificate_uuid: String,

    /// Whether requests carry a detached CMS signature header.
    #[serde(default)]
    pub sign_message: bool,

    /// Granted MDM access rights bitmask.
    #[serde(default)]
    pub access_rights: i64,

    /// Advertised server capabilities.
    #[serde(default)]
    pub server_capabilities: Vec<String>,

    /// Whether the device checks out when the profile is removed.
    #[serde(default)]
    pub check_out_when_removed: bool,
}

impl MdmPayload {
    /// The effective check-in URL: `CheckInURL` when present, else the
    /// server URL.
    pub fn effective_check_in_url(&self) -> &str {
        if self.check_in_url.is_empty() {
            &self.server_url
        } else {
            &self.check_in_url
        }
    }
}
