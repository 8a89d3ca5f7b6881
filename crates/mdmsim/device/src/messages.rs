//! MDM check-in and command message types.

use std::collections::BTreeMap;

/// Authenticate check-in message.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticateRequest {
    /// Build version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,

    /// Device name.
    pub device_name: String,

    /// IMEI for cellular devices.
    #[serde(rename = "IMEI", skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,

    /// MEID for cellular devices.
    #[serde(rename = "MEID", skip_serializing_if = "Option::is_none")]
    pub meid: Option<String>,

    /// Always "Authenticate".
    pub message_type: String,

    /// Device model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Device model name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    /// OS version.
    #[serde(rename = "OSVersion", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Product name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,

    /// Serial number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// APNs topic from the MDM payload.
    pub topic: String,

    /// Device UDID.
    #[serde(rename = "UDID")]
    pub udid: String,

    /// Enrollment ID for user enrollments.
    #[serde(rename = "EnrollmentID", skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<String>,
}

/// TokenUpdate check-in message.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenUpdateRequest {
    /// Whether the device awaits DEP configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_configuration: Option<bool>,

    /// Always "TokenUpdate".
    pub message_type: String,

    /// Push magic string the server echoes in push notifications.
    pub push_magic: String,

    /// APNs push token.
    pub token: plist::Data,

    /// APNs topic from the MDM payload.
    pub topic: String,

    /// Device UDID.
    #[serde(rename = "UDID")]
    pub udid: String,
}

/// One entry of an error chain reported to the server.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorChain {
    /// Error code.
    pub error_code: i64,

    /// Error domain.
    pub error_domain: String,

    /// Localized description.
    pub localized_description: String,

    /// US English description.
    #[serde(
        rename = "USEnglishDescription",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub us_english_description: Option<String>,
}

/// A request to the command (Connect) endpoint: either an Idle poll or
/// the result of the previous command.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectRequest {
    /// Device UDID.
    #[serde(rename = "UDID")]
    pub udid: String,

    /// UUID of the command being acknowledged.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command_uuid: Option<String>,

    /// "Idle", "Acknowledged" or "Error".
    pub status: String,

    /// Error details when status is "Error".
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_chain: Option<Vec<ErrorChain>>,

    /// Request type being acknowledged.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_type: Option<String>,
}

impl ConnectRequest {
    /// The Idle poll that opens every command cycle.
    pub fn idle(udid: &str) -> Self {
        Self {
            udid: udid.to_string(),
            status: "Idle".into(),
            ..Default::default()
        }
    }

    /// An error reply for a command.
    pub fn error(udid: &str, command_uuid: &str, request_type: &str, chain: ErrorChain) -> Self {
        Self {
            udid: udid.to_string(),
            command_uuid: Some(command_uuid.to_string()),
            request_type: Some(request_type.to_string()),
            status: "Error".into(),
            error_chain: Some(vec![chain]),
        }
    }

    /// An acknowledgement header for a command.
    pub fn acknowledged(udid: &str, command_uuid: &str, request_type: &str) -> Self {
        Self {
            udid: udid.to_string(),
            command_uuid: Some(command_uuid.to_string()),
            request_type: Some(request_type.to_string()),
            status: "Acknowledged".into(),
            error_chain: None,
        }
    }
}

/// The command header common to every Connect response.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectResponseCommand {
    /// Command request type.
    #[serde(default)]
    pub request_type: String,
}

/// A Connect response carrying the next command.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectResponse {
    /// The command to execute.
    #[serde(default)]
    pub command: ConnectResponseCommand,

    /// UUID identifying the command.
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: String,
}

/// DeviceInformation command body.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfoCommand {
    /// Common command header.
    #[serde(flatten)]
    pub header: ConnectResponseCommand,

    /// Requested query keys.
    #[serde(default)]
    pub queries: Vec<String>,
}

/// A parsed DeviceInformation command message.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    /// The command.
    pub command: DeviceInfoCommand,

    /// UUID identifying the command.
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: String,
}

/// Reply to a DeviceInformation command.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfoResponse {
    /// Common reply fields.
    #[serde(flatten)]
    pub reply: ConnectRequest,

    /// Answered queries.
    pub query_responses: BTreeMap<String, String>,
}

/// Reply to a ProfileList command.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProfileListResponse {
    /// Common reply fields.
    #[serde(flatten)]
    pub reply: ConnectRequest,

    /// Installed profiles, payload-common metadata only.
    pub profile_list: Vec<plist::Value>,
}

/// InstallProfile command body.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstallProfileCommand {
    /// Common command header.
    #[serde(flatten)]
    pub header: ConnectResponseCommand,

    /// The profile to install.
    pub payload: plist::Data,
}

/// A parsed InstallProfile command message.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstallProfile {
    /// The command.
    pub command: InstallProfileCommand,

    /// UUID identifying the command.
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_xml<T: serde::Serialize>(value: &T) -> String {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, value).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_authenticate_omits_empty_fields() {
        let req = AuthenticateRequest {
            device_name: "Test".into(),
            message_type: "Authenticate".into(),
            topic: "com.apple.mgmt.External.x".into(),
            udid: "UDID-1".into(),
            serial_number: Some("C02XYZ".into()),
            ..Default::default()
        };
        let xml = to_xml(&req);
        assert!(xml.contains("<key>DeviceName</key>"));
        assert!(xml.contains("<key>SerialNumber</key>"));
        assert!(!xml.contains("IMEI"));
        assert!(!xml.contains("Model"));
    }

    #[test]
    fn test_idle_request_shape() {
        let xml = to_xml(&ConnectRequest::idle("UDID-1"));
        assert!(xml.contains("<key>Status</key>"));
        assert!(xml.contains("<string>Idle</string>"));
        assert!(!xml.contains("CommandUUID"));
        assert!(!xml.contains("ErrorChain"));
    }

    #[test]
    fn test_connect_response_parse() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>Command</key><dict>
  <key>RequestType</key><string>DeviceInformation</string>
  <key>Queries</key><array><string>UDID</string></array>
</dict>
<key>CommandUUID</key><string>CMD-1</string>
</dict></plist>"#;

        let resp: ConnectResponse = plist::from_bytes(xml.as_bytes()).unwrap();
        assert_eq!(resp.command.request_type, "DeviceInformation");
        assert_eq!(resp.command_uuid, "CMD-1");

        let info: DeviceInfo = plist::from_bytes(xml.as_bytes()).unwrap();
        assert_eq!(info.command.queries, vec!["UDID".to_string()]);
    }

    #[test]
    fn test_error_reply_chain() {
        let reply = ConnectRequest::error(
            "UDID-1",
            "CMD-2",
            "NotARealCommand",
            ErrorChain {
                error_code: 12021,
                error_domain: "MCMDMErrorDomain".into(),
                localized_description: "Unknown command: NotARealCommand <MDMClientError:91>"
                    .into(),
                us_english_description: None,
            },
        );
        let xml = to_xml(&reply);
        assert!(xml.contains("<integer>12021</integer>"));
        assert!(xml.contains("MCMDMErrorDomain"));
        assert!(xml.contains("<string>Error</string>"));
    }
}
