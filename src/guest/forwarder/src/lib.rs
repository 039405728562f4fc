//! Secure Comms Guest - Peer-Pod Side
//!
//! The peer-pod half of secure communications: the two-phase SSH server,
//! the secret fetcher that retrieves the kubernetes-phase keys, and the
//! namespace-aware client of the in-pod resource endpoint.

pub mod apic;
pub mod secrets;
pub mod server;

pub use apic::ApiClient;
pub use secrets::{GetSecret, PpSecrets};
pub use server::{singleton, SshServer};
