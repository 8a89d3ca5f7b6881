//! The top-level configuration profile.

use color_eyre::eyre::WrapErr as _;

use crate::{
    AcmeCertificatePayload, CommonPayload, MdmPayload, Payload, ScepPayload, ACME_PAYLOAD_TYPE,
    MDM_PAYLOAD_TYPE, SCEP_PAYLOAD_TYPE,
};

/// A configuration profile: common metadata plus a list of payload
/// dictionaries. Payloads are kept as raw plist values so unknown types
/// survive a load/store round trip untouched.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Profile {
    /// Reverse-DNS profile identifier; primary key in the profile store.
    pub payload_identifier: String,

    /// Profile instance UUID.
    #[serde(rename = "PayloadUUID")]
    pub payload_uuid: String,

    /// Always "Configuration" for profiles.
    pub payload_type: String,

    /// Profile format version.
    #[serde(default)]
    pub payload_version: i64,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_display_name: Option<String>,

    /// The contained payload dictionaries.
    #[serde(default)]
    pub payload_content: Vec<plist::Value>,
}

impl Profile {
    /// Parse a profile from plist bytes (XML or binary).
    pub fn from_bytes(data: &[u8]) -> color_eyre::eyre::Result<Self> {
        plist::from_bytes(data).wrap_err("failed to parse configuration profile")
    }

    /// Serialize the profile to XML plist bytes.
    pub fn to_xml(&self) -> color_eyre::eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, self).wrap_err("failed to serialize profile")?;
        Ok(buf)
    }

    /// Classify every payload dictionary into a typed [`Payload`].
    pub fn payloads(&self) -> color_eyre::eyre::Result<Vec<Payload>> {
        self.payload_content.iter().map(classify_payload).collect()
    }

    /// All MDM payloads in the profile.
    pub fn mdm_payloads(&self) -> color_eyre::eyre::Result<Vec<MdmPayload>> {
        Ok(self
            .payloads()?
            .into_iter()
            .filter_map(|p| match p {
                Payload::Mdm(m) => Some(m),
                _ => None,
            })
            .collect())
    }

    /// All SCEP payloads in the profile.
    pub fn scep_payloads(&self) -> color_eyre::eyre::Result<Vec<ScepPayload>> {
        Ok(self
            .payloads()?
            .into_iter()
            .filter_map(|p| match p {
                Payload::Scep(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// All ACME certificate payloads in the profile.
    pub fn acme_payloads(&self) -> color_eyre::eyre::Result<Vec<AcmeCertificatePayload>> {
        Ok(self
            .payloads()?
            .into_iter()
            .filter_map(|p| match p {
                Payload::Acme(a) => Some(a),
                _ => None,
            })
            .collect())
    }

    /// A clone of the profile with every payload reduced to its common
    /// metadata. This is the shape reported in ProfileList replies.
    pub fn common_only(&self) -> color_eyre::eyre::Result<Self> {
        let mut stripped = self.clone();
        stripped.payload_content = self
            .payloads()?
            .iter()
            .map(|p| {
                plist::to_value(p.common()).wrap_err("failed to re-encode common payload")
            })
            .collect::<color_eyre::eyre::Result<Vec<_>>>()?;
        Ok(stripped)
    }
}

fn classify_payload(value: &plist::Value) -> color_eyre::eyre::Result<Payload> {
    let dict = value
        .as_dictionary()
        .ok_or_else(|| color_eyre::eyre::eyre!("payload is not a dictionary"))?;

    let payload_type = dict
        .get("PayloadType")
        .and_then(plist::Value::as_string)
        .unwrap_or_default();

    let payload = match payload_type {
        SCEP_PAYLOAD_TYPE => Payload::Scep(
            plist::from_value(value).wrap_err("failed to decode SCEP payload")?,
        ),
        ACME_PAYLOAD_TYPE => Payload::Acme(
            plist::from_value(value).wrap_err("failed to decode ACME payload")?,
        ),
        MDM_PAYLOAD_TYPE => Payload::Mdm(
            plist::from_value(value).wrap_err("failed to decode MDM payload")?,
        ),
        _ => Payload::Other(
            plist::from_value::<CommonPayload>(value)
                .wrap_err("failed to decode payload metadata")?,
        ),
    };

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENROLL_PROFILE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>PayloadIdentifier</key>
	<string>com.example.enroll</string>
	<key>PayloadUUID</key>
	<string>1E2F54F2-61A9-452E-B8C5-0B1E4C1B4C19</string>
	<key>PayloadType</key>
	<string>Configuration</string>
	<key>PayloadVersion</key>
	<integer>1</integer>
	<key>PayloadContent</key>
	<array>
		<dict>
			<key>PayloadIdentifier</key>
			<string>com.example.enroll.scep</string>
			<key>PayloadUUID</key>
			<string>8A7BCF54-1D44-4A50-8D93-A14B0A30134C</string>
			<key>PayloadType</key>
			<string>com.apple.security.scep</string>
			<key>PayloadVersion</key>
			<integer>1</integer>
			<key>PayloadContent</key>
			<dict>
				<key>URL</key>
				<string>https://scep.example.com/scep</string>
				<key>Challenge</key>
				<string>secret</string>
				<key>Key Type</key>
				<string>RSA</string>
				<key>Keysize</key>
				<integer>2048</integer>
				<key>Subject</key>
				<array>
					<array>
						<array>
							<string>CN</string>
							<string>%ComputerName%</string>
						</array>
					</array>
				</array>
			</dict>
		</dict>
		<dict>
			<key>PayloadIdentifier</key>
			<string>com.example.enroll.mdm</string>
			<key>PayloadUUID</key>
			<string>BD63B2B4-F26C-44C6-A9B4-394F9E9A2E42</string>
			<key>PayloadType</key>
			<string>com.apple.mdm</string>
			<key>PayloadVersion</key>
			<integer>1</integer>
			<key>ServerURL</key>
			<string>https://mdm.example.com/mdm</string>
			<key>CheckInURL</key>
			<string>https://mdm.example.com/checkin</string>
			<key>Topic</key>
			<string>com.apple.mgmt.External.abc</string>
			<key>IdentityCertificateUUID</key>
			<string>8A7BCF54-1D44-4A50-8D93-A14B0A30134C</string>
			<key>SignMessage</key>
			<true/>
		</dict>
		<dict>
			<key>PayloadIdentifier</key>
			<string>com.example.enroll.misc</string>
			<key>PayloadUUID</key>
			<string>00000000-AAAA-BBBB-CCCC-DDDDEEEEFFFF</string>
			<key>PayloadType</key>
			<string>com.example.something.else</string>
			<key>PayloadVersion</key>
			<integer>1</integer>
			<key>SomeCustomKey</key>
			<string>whatever</string>
		</dict>
	</array>
</dict>
</plist>"#;

    #[test]
    fn test_parse_and_classify() {
        let profile = Profile::from_bytes(ENROLL_PROFILE.as_bytes()).unwrap();
        assert_eq!(profile.payload_identifier, "com.example.enroll");

        let payloads = profile.payloads().unwrap();
        assert_eq!(payloads.len(), 3);
        assert!(matches!(payloads[0], Payload::Scep(_)));
        assert!(matches!(payloads[1], Payload::Mdm(_)));
        assert!(matches!(payloads[2], Payload::Other(_)));
    }

    #[test]
    fn test_scep_content() {
        let profile = Profile::from_bytes(ENROLL_PROFILE.as_bytes()).unwrap();
        let scep = &profile.scep_payloads().unwrap()[0];

        assert_eq!(scep.content.url, "https://scep.example.com/scep");
        assert_eq!(scep.content.challenge, "secret");
        assert_eq!(scep.content.key_type, "RSA");
        assert_eq!(scep.content.key_size, 2048);
        assert_eq!(scep.content.subject[0][0], vec!["CN", "%ComputerName%"]);
    }

    #[test]
    fn test_mdm_payload() {
        let profile = Profile::from_bytes(ENROLL_PROFILE.as_bytes()).unwrap();
        let mdm = &profile.mdm_payloads().unwrap()[0];

        assert_eq!(mdm.server_url, "https://mdm.example.com/mdm");
        assert_eq!(mdm.effective_check_in_url(), "https://mdm.example.com/checkin");
        assert!(mdm.sign_message);
        assert_eq!(
            mdm.identity_certificate_uuid,
            "8A7BCF54-1D44-4A50-8D93-A14B0A30134C"
        );
    }

    #[test]
    fn test_check_in_url_falls_back_to_server_url() {
        let mdm = MdmPayload {
            server_url: "https://mdm.example.com/mdm".into(),
            ..Default::default()
        };
        assert_eq!(mdm.effective_check_in_url(), "https://mdm.example.com/mdm");
    }

    #[test]
    fn test_common_only_strips_payloads() {
        let profile = Profile::from_bytes(ENROLL_PROFILE.as_bytes()).unwrap();
        let stripped = profile.common_only().unwrap();

        assert_eq!(stripped.payload_content.len(), 3);
        for value in &stripped.payload_content {
            let dict = value.as_dictionary().unwrap();
            assert!(dict.get("ServerURL").is_none());
            assert!(dict.get("PayloadContent").is_none());
            assert!(dict.get("PayloadIdentifier").is_some());
        }
    }

    #[test]
    fn test_round_trip() {
        let profile = Profile::from_bytes(ENROLL_PROFILE.as_bytes()).unwrap();
        let xml = profile.to_xml().unwrap();
        let again = Profile::from_bytes(&xml).unwrap();

        assert_eq!(again.payload_identifier, profile.payload_identifier);
        assert_eq!(again.payload_content.len(), profile.payload_content.len());
    }
}
