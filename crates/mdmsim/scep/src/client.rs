//! SCEP HTTP client.

use color_eyre::eyre::WrapErr as _;
use der::Decode as _;
use x509_cert::Certificate;

use crate::message;
use crate::selector::CertsSelector;
use crate::signer::self_signed_signer;

const OP_GET_CA_CAPS: &str = "GetCACaps";
const OP_GET_CA_CERT: &str = "GetCACert";
const OP_PKI_OPERATION: &str = "PKIOperation";

const CONTENT_TYPE_CA_CERT: &str = "application/x-x509-ca-cert";
const CONTENT_TYPE_CA_RA_CERT: &str = "application/x-x509-ca-ra-cert";

/// SCEP protocol client for a single CA endpoint.
pub struct Client {
    scep_url: String,
    http: reqwest::Client,

    caps: Vec<u8>,
    certs: Vec<Certificate>,
}

impl Client {
    /// Create a client for the given SCEP URL sharing the given HTTP
    /// client.
    pub fn new(scep_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            scep_url: scep_url.into(),
            http,
            caps: Vec::new(),
            certs: Vec::new(),
        }
    }

    fn supports_cap(&self, cap: &str) -> bool {
        self.caps
            .windows(cap.len())
            .any(|window| window == cap.as_bytes())
    }

    /// Whether PKIOperation goes over POST for this server.
    fn use_post(&self) -> bool {
        self.supports_cap("POSTPKIOperation") || self.supports_cap("SCEPStandard")
    }

    async fn do_get(
        &self,
        op: &str,
        message: Option<&str>,
    ) -> color_eyre::eyre::Result<reqwest::Response> {
        let mut query: Vec<(&str, &str)> = vec![("operation", op)];
        if let Some(message) = message {
            query.push(("message", message));
        }
        self.http
            .get(&self.scep_url)
            .query(&query)
            .send()
            .await
            .wrap_err_with(|| format!("executing {op}"))
    }

    /// Fetch and cache the CA capabilities.
    pub async fn get_ca_caps(&mut self) -> color_eyre::eyre::Result<&[u8]> {
        let resp = self.do_get(OP_GET_CA_CAPS, None).await?;
        self.caps = resp
            .bytes()
            .await
            .wrap_err("reading GetCACaps response")?
            .to_vec();
        tracing::debug!(caps = %String::from_utf8_lossy(&self.caps), "CA capabilities");
        Ok(&self.caps)
    }

    /// Fetch and cache the CA/RA certificates. The optional message is
    /// passed through as the CA identity hint.
    pub async fn get_ca_cert(
        &mut self,
        message: Option<&str>,
    ) -> color_eyre::eyre::Result<&[Certificate]> {
        let resp = self
            .do_get(OP_GET_CA_CERT, message.filter(|m| !m.is_empty()))
            .await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp
            .bytes()
            .await
            .wrap_err("reading GetCACert response")?;

        match content_type.as_str() {
            CONTENT_TYPE_CA_CERT => {
                let cert =
                    Certificate::from_der(&body).wrap_err("parsing CA certificate")?;
                self.certs = vec![cert];
            }
            CONTENT_TYPE_CA_RA_CERT => {
                self.certs = message::parse_degenerate_certs(&body)
                    .wrap_err("parsing degenerate CA certificate bundle")?;
            }
            other => color_eyre::eyre::bail!("unknown content-type: {other}"),
        }

        Ok(&self.certs)
    }

    /// Run the PKCSReq exchange for the CSR and return the issued
    /// certificate. Terminal server states (FAILURE, PENDING) are errors.
    pub async fn sign(
        &self,
        csr_der: &[u8],
        selector: &CertsSelector,
    ) -> color_eyre::eyre::Result<Certificate> {
        let recipients = selector.select(&self.certs)?;
        let (signer_key, signer_cert) = self_signed_signer()?;

        let pki_message = message::build_pkcs_req(csr_der, &recipients, &signer_cert, &signer_key)
            .wrap_err("creating csr request")?;

        let resp = if self.use_post() {
            self.http
                .post(&self.scep_url)
                .query(&[("operation", OP_PKI_OPERATION)])
                // some servers/proxies have problems without a content-type
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(pki_message)
                .send()
                .await
                .wrap_err("executing PKIOperation")?
        } else {
            let encoded = message::encode_for_get(&pki_message);
            self.do_get(OP_PKI_OPERATION, Some(&encoded)).await?
        };

        let body = resp
            .bytes()
            .await
            .wrap_err("reading PKIOperation response")?;

        let cert_rep = message::parse_cert_rep(&body).wrap_err("parsing response pki message")?;
        match cert_rep.status {
            crate::PkiStatus::Failure => color_eyre::eyre::bail!(
                "scep failure: fail info: {}",
                cert_rep.fail_info.as_deref().unwrap_or("unknown")
            ),
            crate::PkiStatus::Pending => {
                color_eyre::eyre::bail!("pending response not supported")
            }
            crate::PkiStatus::Success => {}
        }

        cert_rep
            .decrypt_certificate(&signer_cert, &signer_key)
            .wrap_err("decrypting response pki message")
    }

    /// The whole exchange: capabilities, CA certificates, PKCSReq.
    pub async fn full_sign(
        &mut self,
        csr_der: &[u8],
        ca_message: Option<&str>,
        selector: &CertsSelector,
    ) -> color_eyre::eyre::Result<Certificate> {
        self.get_ca_caps().await.wrap_err("error GetCACaps")?;
        self.get_ca_cert(ca_message).await.wrap_err("error GetCACert")?;
        self.sign(csr_der, selector).await.wrap_err("error PKIOperation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_cap() {
        let mut client = Client::new("https://scep.example.com/scep", reqwest::Client::new());
        client.caps = b"AES\nPOSTPKIOperation\nSHA-256".to_vec();

        assert!(client.supports_cap("POSTPKIOperation"));
        assert!(client.supports_cap("SHA-256"));
        assert!(!client.supports_cap("SCEPStandard"));
        assert!(client.use_post());
    }

    #[test]
    fn test_get_when_no_post_caps() {
        let mut client = Client::new("https://scep.example.com/scep", reqwest::Client::new());
        client.caps = b"SHA-1".to_vec();
        assert!(!client.use_post());
    }
}
