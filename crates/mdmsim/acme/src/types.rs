//! ACME wire types.

use serde::{Deserialize, Serialize};

/// The directory document: the endpoints everything else hangs off.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// Nonce endpoint.
    pub new_nonce: String,
    /// Account creation endpoint.
    pub new_account: String,
    /// Order creation endpoint.
    pub new_order: String,
}

/// Object status shared by orders, authorizations and challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting on the client.
    Pending,
    /// Order ready to finalize.
    Ready,
    /// Server-side work in flight.
    Processing,
    /// Done.
    Valid,
    /// Failed.
    Invalid,
    /// Authorization no longer usable.
    Revoked,
    /// Authorization expired before completion.
    Expired,
    /// Client gave up.
    Deactivated,
}

/// An order identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    /// Identifier type, e.g. `permanent-identifier`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Identifier value.
    pub value: String,
}

/// New-account request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    /// Contact URLs.
    pub contact: Vec<String>,
    /// Whether the client agreed to the terms of service.
    pub terms_of_service_agreed: bool,
}

/// New-order request body.
#[derive(Debug, Serialize)]
pub struct NewOrder {
    /// Requested identifiers.
    pub identifiers: Vec<Identifier>,
}

/// An order object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order status.
    pub status: Status,
    /// Authorization URLs to satisfy.
    #[serde(default)]
    pub authorizations: Vec<String>,
    /// Finalization URL.
    pub finalize: String,
    /// Certificate URL, present once the order is valid.
    #[serde(default)]
    pub certificate: Option<String>,
}

/// An authorization object.
#[derive(Debug, Clone, Deserialize)]
pub struct Authorization {
    /// Authorization status.
    pub status: Status,
    /// Offered challenges.
    #[serde(default)]
    pub challenges: Vec<Challenge>,
}

/// A challenge object.
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    /// Challenge type, e.g. `device-attest-01`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Challenge URL.
    pub url: String,
    /// Challenge token.
    #[serde(default)]
    pub token: String,
    /// Challenge status.
    pub status: Status,
}

/// Finalize request body.
#[derive(Debug, Serialize)]
pub struct FinalizeRequest {
    /// Base64url DER CSR.
    pub csr: String,
}

/// An RFC 7807 problem document returned on error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Problem {
    /// Problem type URN.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Human-readable detail.
    #[serde(default)]
    pub detail: String,
}

impl Problem {
    /// Whether this is a badNonce rejection, which is retriable.
    pub fn is_bad_nonce(&self) -> bool {
        self.kind == "urn:ietf:params:acme:error:badNonce"
    }
}
