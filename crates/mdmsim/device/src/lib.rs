//! Device Lifecycle and Protocol Engine
//!
//! A simulated Apple device: its persisted record, keychain and profile
//! store, the enrollment sub-protocols that mint its identity (SCEP, ACME
//! with device attestation), and the MDM check-in/command client that
//! speaks to the target server the way a real device would.

mod acme_enroll;
mod attest;
mod commands;
mod csr;
mod device;
mod installer;
mod keychain;
mod mdm_client;
mod messages;
mod profile_store;
mod scep_enroll;
mod transport;

pub use attest::AttestationCa;
pub use device::Device;
pub use keychain::{DeviceKey, ItemContent, Keychain, KeychainItem, KEYCHAIN_SYSTEM};
pub use mdm_client::MdmClient;
pub use messages::{ConnectRequest, ConnectResponse, ErrorChain};
pub use profile_store::ProfileStore;
