//! ACME protocol client.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use color_eyre::eyre::WrapErr as _;
use serde::de::DeserializeOwned;

use crate::jws::AccountKey;
use crate::types::{
    Authorization, Directory, FinalizeRequest, Identifier, NewAccount, NewOrder, Order, Problem,
    Status,
};
use crate::{Solver, CHALLENGE_DEVICE_ATTEST_01};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_ATTEMPTS: usize = 30;

/// ACME client bound to one directory and one account key.
pub struct Client {
    http: reqwest::Client,
    directory: Directory,
    account_key: AccountKey,
    kid: Option<String>,
    nonce: Option<String>,
}

impl Client {
    /// Discover the directory and prepare a client using the given
    /// account key.
    pub async fn discover(
        http: reqwest::Client,
        directory_url: &str,
        account_key: AccountKey,
    ) -> color_eyre::eyre::Result<Self> {
        let directory: Directory = http
            .get(directory_url)
            .send()
            .await
            .wrap_err("failed to fetch ACME directory")?
            .error_for_status()
            .wrap_err("ACME directory request rejected")?
            .json()
            .await
            .wrap_err("failed to parse ACME directory")?;

        Ok(Self {
            http,
            directory,
            account_key,
            kid: None,
            nonce: None,
        })
    }

    async fn fresh_nonce(&mut self) -> color_eyre::eyre::Result<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let resp = self
            .http
            .head(&self.directory.new_nonce)
            .send()
            .await
            .wrap_err("failed to fetch nonce")?;
        nonce_from(&resp).ok_or_else(|| color_eyre::eyre::eyre!("nonce endpoint returned no nonce"))
    }

    /// Signed POST (or POST-as-GET when `payload` is `None`), with a single
    /// retry on a badNonce rejection.
    async fn post(
        &mut self,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> color_eyre::eyre::Result<reqwest::Response> {
        for attempt in 0..2 {
            let nonce = self.fresh_nonce().await?;
            let jws = self
                .account_key
                .sign(self.kid.as_deref(), &nonce, url, payload)?;

            let resp = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
                .json(&jws)
                .send()
                .await
                .wrap_err_with(|| format!("ACME request to {url} failed"))?;

            self.nonce = nonce_from(&resp);

            if resp.status().is_success() {
                return Ok(resp);
            }

            let status = resp.status();
            let problem: Problem = resp.json().await.unwrap_or_default();
            if problem.is_bad_nonce() && attempt == 0 {
                tracing::debug!(url, "retrying after badNonce");
                continue;
            }
            color_eyre::eyre::bail!(
                "ACME request to {url} failed with {status}: {} {}",
                problem.kind,
                problem.detail
            );
        }
        unreachable!("badNonce retry loop")
    }

    async fn post_json<T: DeserializeOwned>(
        &mut self,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> color_eyre::eyre::Result<(T, Option<String>)> {
        let resp = self.post(url, payload).await?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .json()
            .await
            .wrap_err_with(|| format!("failed to parse response from {url}"))?;
        Ok((body, location))
    }

    /// Register a new account; subsequent requests sign with its kid.
    pub async fn new_account(
        &mut self,
        contact: Vec<String>,
        terms_of_service_agreed: bool,
    ) -> color_eyre::eyre::Result<()> {
        let payload = serde_json::to_value(NewAccount {
            contact,
            terms_of_service_agreed,
        })
        .wrap_err("failed to encode account request")?;

        let url = self.directory.new_account.clone();
        let (_body, location) = self
            .post_json::<serde_json::Value>(&url, Some(&payload))
            .await
            .wrap_err("failed creating new account")?;

        self.kid = Some(
            location.ok_or_else(|| color_eyre::eyre::eyre!("account response had no location"))?,
        );
        Ok(())
    }

    /// Place an order for the identifiers, solve its device-attest-01
    /// challenges, finalize with the CSR and download the issued chain as
    /// DER certificates.
    pub async fn obtain_certificate<S: Solver>(
        &mut self,
        identifiers: Vec<Identifier>,
        csr_der: &[u8],
        solver: &S,
    ) -> color_eyre::eyre::Result<Vec<Vec<u8>>> {
        if self.kid.is_none() {
            color_eyre::eyre::bail!("an account is required before ordering");
        }

        let payload = serde_json::to_value(NewOrder { identifiers })
            .wrap_err("failed to encode order request")?;
        let url = self.directory.new_order.clone();
        let (order, order_url) = self
            .post_json::<Order>(&url, Some(&payload))
            .await
            .wrap_err("failed creating new order")?;
        let order_url =
            order_url.ok_or_else(|| color_eyre::eyre::eyre!("order response had no location"))?;

        for authz_url in &order.authorizations {
            self.solve_authorization(authz_url, solver).await?;
        }

        // Finalize with the CSR and wait for issuance.
        let finalize_payload = serde_json::to_value(FinalizeRequest {
            csr: URL_SAFE_NO_PAD.encode(csr_der),
        })
        .wrap_err("failed to encode finalize request")?;
        let (mut order, _) = self
            .post_json::<Order>(&order.finalize, Some(&finalize_payload))
            .await
            .wrap_err("failed finalizing order")?;

        for _ in 0..POLL_ATTEMPTS {
            match order.status {
                Status::Valid => break,
                Status::Invalid => color_eyre::eyre::bail!("order failed"),
                _ => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    (order, _) = self.post_json::<Order>(&order_url, None).await?;
                }
            }
        }
        let certificate_url = order
            .certificate
            .ok_or_else(|| color_eyre::eyre::eyre!("order never became valid"))?;

        // Download the PEM chain.
        let chain_pem = self
            .post(&certificate_url, None)
            .await
            .wrap_err("failed downloading certificate")?
            .text()
            .await
            .wrap_err("failed reading certificate chain")?;

        let chain: Vec<Vec<u8>> = pem::parse_many(chain_pem.as_bytes())
            .wrap_err("failed parsing certificate bundle")?
            .into_iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| p.into_contents())
            .collect();

        if chain.is_empty() {
            color_eyre::eyre::bail!("no certificates obtained");
        }
        Ok(chain)
    }

    async fn solve_authorization<S: Solver>(
        &mut self,
        authz_url: &str,
        solver: &S,
    ) -> color_eyre::eyre::Result<()> {
        let (authz, _) = self
            .post_json::<Authorization>(authz_url, None)
            .await
            .wrap_err("failed fetching authorization")?;

        if authz.status == Status::Valid {
            return Ok(());
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.kind == CHALLENGE_DEVICE_ATTEST_01)
            .ok_or_else(|| {
                color_eyre::eyre::eyre!("authorization offers no device-attest-01 challenge")
            })?;

        let response = solver.payload(challenge).await.wrap_err("solver failed")?;
        self.post_json::<serde_json::Value>(&challenge.url, Some(&response))
            .await
            .wrap_err("failed responding to challenge")?;

        for _ in 0..POLL_ATTEMPTS {
            let (authz, _) = self.post_json::<Authorization>(authz_url, None).await?;
            match authz.status {
                Status::Valid => return Ok(()),
                Status::Invalid => color_eyre::eyre::bail!("authorization failed"),
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        color_eyre::eyre::bail!("authorization never became valid")
    }
}

fn nonce_from(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get("Replay-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
