//! Secure Comms Adaptor - Worker-Node Side
//!
//! The worker-node half of secure communications: the SSH client that
//! connects to peer-pods, the KBS client publishing their keys, and the
//! Kubernetes secret store holding every keypair.

pub mod kbs;
pub mod kubemgr;
pub mod wnssh;

pub use kbs::KbsClient;
pub use kubemgr::{KubeSecretStore, MemorySecretStore, SecretStore};
pub use wnssh::{SshClient, SshClientInstance};
