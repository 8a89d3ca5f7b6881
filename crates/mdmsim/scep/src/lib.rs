//! SCEP Client
//!
//! Client side of the Simple Certificate Enrollment Protocol (RFC 8894):
//! capability discovery, CA certificate retrieval, and the PKCSReq
//! exchange that turns a CSR into an issued certificate.
//!
//! The PKI message layer wraps the CSR in CMS EnvelopedData addressed to
//! the CA/RA certificates, signs the envelope with a throwaway signer
//! identity, and decrypts the CertRep response with that same identity.

mod client;
mod message;
mod selector;
mod signer;

pub use client::Client;
pub use message::{CertRep, PkiStatus};
pub use selector::CertsSelector;
pub use signer::self_signed_signer;
