//! Per-command handlers for the MDM command loop.
//!
//! Each handler builds the body of the *next* Connect request: the
//! acknowledgement or error for the command just received.

use color_eyre::eyre::WrapErr as _;

use crate::mdm_client::MdmClient;
use crate::messages::{
    ConnectRequest, DeviceInfo, DeviceInfoResponse, ErrorChain, InstallProfile,
    ProfileListResponse,
};

const DEFAULT_DEVICE_INFO_QUERIES: &[&str] = &["DeviceName", "SerialNumber", "UDID"];

impl MdmClient {
    /// Dispatch a command to its handler. `Ok(None)` means a handler
    /// produced no reply, which the caller maps to an error reply.
    pub(crate) async fn handle_mdm_command(
        &mut self,
        request_type: &str,
        command_uuid: &str,
        raw: &[u8],
    ) -> color_eyre::eyre::Result<Option<plist::Value>> {
        match request_type {
            "DeviceInformation" => self.handle_device_info(raw).map(Some),
            "ProfileList" => self
                .handle_profile_list(request_type, command_uuid)
                .map(Some),
            "InstallProfile" => self.handle_install_profile(raw).await.map(Some),
            _ => {
                tracing::warn!(
                    request_type,
                    command_uuid,
                    "MDM command not handled"
                );
                let reply = ConnectRequest::error(
                    &self.device.udid,
                    command_uuid,
                    request_type,
                    ErrorChain {
                        error_code: 12021,
                        error_domain: "MCMDMErrorDomain".into(),
                        localized_description: format!(
                            "Unknown command: {request_type} <MDMClientError:91>"
                        ),
                        us_english_description: None,
                    },
                );
                Ok(Some(
                    plist::to_value(&reply).wrap_err("failed to build error reply")?,
                ))
            }
        }
    }

    fn handle_device_info(&self, raw: &[u8]) -> color_eyre::eyre::Result<plist::Value> {
        let command: DeviceInfo =
            plist::from_bytes(raw).wrap_err("failed to parse DeviceInformation command")?;

        let queries: Vec<String> = if command.command.queries.is_empty() {
            DEFAULT_DEVICE_INFO_QUERIES
                .iter()
                .map(|q| q.to_string())
                .collect()
        } else {
            command.command.queries.clone()
        };

        let mut response = DeviceInfoResponse {
            reply: ConnectRequest::acknowledged(
                &self.device.udid,
                &command.command_uuid,
                &command.command.header.request_type,
            ),
            query_responses: Default::default(),
        };

        let mut unknown = Vec::new();
        for query in queries {
            match query.as_str() {
                "DeviceName" => {
                    response
                        .query_responses
                        .insert(query, self.device.computer_name.clone());
                }
                "SerialNumber" => {
                    response
                        .query_responses
                        .insert(query, self.device.serial.clone());
                }
                "UDID" => {
                    response
                        .query_responses
                        .insert(query, self.device.udid.clone());
                }
                _ => unknown.push(query),
            }
        }
        if !unknown.is_empty() {
            tracing::warn!(queries = %unknown.join(", "), "unknown DeviceInformation queries");
        }

        plist::to_value(&response).wrap_err("failed to build DeviceInformation reply")
    }

    fn handle_profile_list(
        &self,
        request_type: &str,
        command_uuid: &str,
    ) -> color_eyre::eyre::Result<plist::Value> {
        let store = self.device.profile_store();

        let mut profile_list = Vec::new();
        for profile_id in store.list_uuids()? {
            let profile = match store.load(&profile_id) {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::error!(profile_id = %profile_id, error = %e, "error loading profile");
                    continue;
                }
            };
            // report payload-common metadata only, no payload content
            let stripped = profile.common_only()?;
            profile_list.push(
                plist::to_value(&stripped).wrap_err("failed to encode profile for list")?,
            );
        }

        let response = ProfileListResponse {
            reply: ConnectRequest::acknowledged(&self.device.udid, command_uuid, request_type),
            profile_list,
        };
        plist::to_value(&response).wrap_err("failed to build ProfileList reply")
    }

    async fn handle_install_profile(
        &mut self,
        raw: &[u8],
    ) -> color_eyre::eyre::Result<plist::Value> {
        let command: InstallProfile =
            plist::from_bytes(raw).wrap_err("failed to parse InstallProfile command")?;

        let blob: Vec<u8> = command.command.payload.into();
        let http = self.http().clone();
        // No attestation CA flows through the command loop; ACME payloads
        // arriving over MDM will fail their install.
        self.device
            .install_profile(&http, None, &blob, true)
            .await?;

        let reply = ConnectRequest::acknowledged(
            &self.device.udid,
            &command.command_uuid,
            &command.command.header.request_type,
        );
        plist::to_value(&reply).wrap_err("failed to build InstallProfile reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use mdmsim_store::KvStore;

    fn test_client() -> (tempfile::TempDir, MdmClient) {
        let dir = tempfile::tempdir().unwrap();
        let db = KvStore::open(&dir.path().join("test.db")).unwrap();
        let mut device = Device::new("Command Test", db);
        device.udid = "11111111-2222-3333-4444-555555555555".into();
        device.serial = "C02TESTSERIA".into();
        let client = MdmClient::new(device, reqwest::Client::new()).unwrap();
        (dir, client)
    }

    fn device_info_xml(queries: &[&str]) -> String {
        let queries_xml: String = queries
            .iter()
            .map(|q| format!("<string>{q}</string>"))
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>Command</key><dict>
  <key>RequestType</key><string>DeviceInformation</string>
  <key>Queries</key><array>{queries_xml}</array>
</dict>
<key>CommandUUID</key><string>CMD-1</string>
</dict></plist>"#
        )
    }

    fn as_dict(value: &plist::Value) -> &plist::Dictionary {
        value.as_dictionary().unwrap()
    }

    #[tokio::test]
    async fn test_device_info_explicit_query() {
        let (_dir, mut client) = test_client();
        let reply = client
            .handle_mdm_command("DeviceInformation", "CMD-1", device_info_xml(&["UDID"]).as_bytes())
            .await
            .unwrap()
            .unwrap();

        let dict = as_dict(&reply);
        assert_eq!(dict.get("Status").unwrap().as_string(), Some("Acknowledged"));
        assert_eq!(dict.get("CommandUUID").unwrap().as_string(), Some("CMD-1"));

        let responses = dict.get("QueryResponses").unwrap().as_dictionary().unwrap();
        assert_eq!(
            responses.get("UDID").unwrap().as_string(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        assert!(responses.get("SerialNumber").is_none());
    }

    #[tokio::test]
    async fn test_device_info_default_queries() {
        let (_dir, mut client) = test_client();
        let reply = client
            .handle_mdm_command("DeviceInformation", "CMD-1", device_info_xml(&[]).as_bytes())
            .await
            .unwrap()
            .unwrap();

        let responses = as_dict(&reply)
            .get("QueryResponses")
            .unwrap()
            .as_dictionary()
            .unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(
            responses.get("DeviceName").unwrap().as_string(),
            Some("Command Test")
        );
        assert_eq!(
            responses.get("SerialNumber").unwrap().as_string(),
            Some("C02TESTSERIA")
        );
    }

    #[tokio::test]
    async fn test_device_info_unknown_query_skipped() {
        let (_dir, mut client) = test_client();
        let reply = client
            .handle_mdm_command(
                "DeviceInformation",
                "CMD-1",
                device_info_xml(&["UDID", "BatteryLevel"]).as_bytes(),
            )
            .await
            .unwrap()
            .unwrap();

        let responses = as_dict(&reply)
            .get("QueryResponses")
            .unwrap()
            .as_dictionary()
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert!(responses.get("BatteryLevel").is_none());
    }

    #[tokio::test]
    async fn test_unknown_command_error_chain() {
        let (_dir, mut client) = test_client();
        let reply = client
            .handle_mdm_command("NotARealCommand", "CMD-9", b"")
            .await
            .unwrap()
            .unwrap();

        let dict = as_dict(&reply);
        assert_eq!(dict.get("Status").unwrap().as_string(), Some("Error"));

        let chain = dict.get("ErrorChain").unwrap().as_array().unwrap();
        let first = chain[0].as_dictionary().unwrap();
        assert_eq!(
            first.get("ErrorCode").unwrap().as_signed_integer(),
            Some(12021)
        );
        assert_eq!(
            first.get("ErrorDomain").unwrap().as_string(),
            Some("MCMDMErrorDomain")
        );
        assert_eq!(
            first.get("LocalizedDescription").unwrap().as_string(),
            Some("Unknown command: NotARealCommand <MDMClientError:91>")
        );
    }

    #[tokio::test]
    async fn test_profile_list_empty() {
        let (_dir, mut client) = test_client();
        let reply = client
            .handle_mdm_command("ProfileList", "CMD-2", b"")
            .await
            .unwrap()
            .unwrap();

        let dict = as_dict(&reply);
        assert_eq!(dict.get("Status").unwrap().as_string(), Some("Acknowledged"));
        assert!(dict
            .get("ProfileList")
            .unwrap()
            .as_array()
            .unwrap()
            .is_empty());
    }
}
