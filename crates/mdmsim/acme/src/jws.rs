//! JWS signing with an ES256 account key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use color_eyre::eyre::WrapErr as _;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::rngs::OsRng;
use serde_json::json;

/// The ES256 account key used to sign every ACME request.
pub struct AccountKey {
    signing_key: SigningKey,
}

impl AccountKey {
    /// Generate a fresh P-256 account key.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// The public key as a JWK object.
    pub fn jwk(&self) -> serde_json::Value {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point has x")),
            "y": URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point has y")),
        })
    }

    /// Sign a request body into the flattened JWS JSON serialization.
    ///
    /// `kid` is used for the protected header when set; otherwise the full
    /// JWK is embedded (only correct for newAccount). An empty payload
    /// produces a POST-as-GET.
    pub fn sign(
        &self,
        kid: Option<&str>,
        nonce: &str,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> color_eyre::eyre::Result<serde_json::Value> {
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => {
                protected["kid"] = json!(kid);
            }
            None => {
                protected["jwk"] = self.jwk();
            }
        }

        let protected_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&protected).wrap_err("failed to encode protected header")?,
        );
        let payload_b64 = match payload {
            Some(payload) => URL_SAFE_NO_PAD
                .encode(serde_json::to_vec(payload).wrap_err("failed to encode payload")?),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());

        Ok(json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        }))
    }
}
