//! Secure Comms Core - Shared Types for Peer-Pod Tunnelling
//!
//! This crate provides the types shared by the worker-node and peer-pod
//! sides: endpoint tags and phases, the control-channel frame codec, SSH key
//! helpers, retry backoff, configuration and the error type.

pub mod backoff;
pub mod config;
pub mod error;
pub mod frame;
pub mod keys;
pub mod tag;

// Re-export commonly used types
pub use backoff::Backoff;
pub use config::{AdaptorConfig, ForwarderConfig};
pub use error::{CommsError, Result};
pub use keys::KeyPairBlobs;
pub use tag::{parse_tags, Phase, Role, Tag};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
