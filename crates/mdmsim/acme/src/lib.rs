//! ACME Client
//!
//! A minimal RFC 8555 client: enough protocol to create an account, place
//! an order over `permanent-identifier` identifiers, answer its
//! `device-attest-01` challenge through a pluggable solver, finalize with
//! a CSR, and download the issued chain. No other challenge types are
//! supported.

mod client;
mod jws;
mod types;

pub use client::Client;
pub use jws::AccountKey;
pub use types::{Challenge, Directory, Identifier, Problem, Status};

/// The device-attest-01 challenge type.
pub const CHALLENGE_DEVICE_ATTEST_01: &str = "device-attest-01";

/// Identifier type carrying an opaque client identifier.
pub const IDENTIFIER_PERMANENT: &str = "permanent-identifier";

/// Solves an ACME challenge by producing its response payload.
#[trait_variant::make(Send)]
pub trait Solver: Send + Sync {
    /// Produce the JSON body POSTed to the challenge URL.
    async fn payload(&self, challenge: &Challenge) -> color_eyre::eyre::Result<serde_json::Value>;
}
