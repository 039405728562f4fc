use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::keys::{ATTESTATION_RSA_BITS, DEFAULT_RSA_BITS};

/// SSH port the peer-pod listens on.
pub const DEFAULT_SSH_PORT: u16 = 2222;

/// Port of the in-pod resource endpoint reached by the API client.
pub const DEFAULT_API_PORT: u16 = 8006;

/// Sentinel file guarding against a second server per boot.
pub const SINGLETON_PATH: &str = "/run/sshSingleton";

/// Optional client key accepted during attestation.
pub const UNPROVEN_WN_PUBLIC_KEY_PATH: &str = "/run/unprovenWnPublicKey";

/// Directory holding named network namespaces.
pub const NETNS_DIR: &str = "/run/netns";

/// Kubernetes namespace holding every secret.
pub const SECRETS_NAMESPACE: &str = "confidential-containers-system";

/// Secret holding the worker-node (adaptor) keypair.
pub const ADAPTOR_SECRET_NAME: &str = "sshclient";

/// Secret holding the Ed25519 KBS signing key.
pub const KBS_CLIENT_SECRET_NAME: &str = "kbs-client";

/// Secret data key for the private half.
pub const PRIVATE_KEY_FIELD: &str = "privateKey";

/// Secret data key for the public half.
pub const PUBLIC_KEY_FIELD: &str = "publicKey";

/// Outbound name served by the KBS reverse proxy.
pub const KBS_OUTBOUND: &str = "KBS";

/// Placeholder the peer-pod uses for its own private key.
pub const PP_PRIVATE_KEY_RESOURCE: &str = "pp-sid/privateKey";

/// Resource holding the worker-node public key.
pub const WN_PUBLIC_KEY_RESOURCE: &str = "sshclient/publicKey";

/// KBS path the adaptor publishes its public key to.
pub const KBS_WN_PUBLIC_KEY_PATH: &str = "default/sshclient/publicKey";

/// SSH handshake deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Dial attempts before a session start gives up.
pub const DIAL_ATTEMPTS: u32 = 100;

/// Pause between kubernetes-phase sessions.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Version of the secure communications protocol.
pub const PP_SECURE_COMMS_VERSION: &str = "v0.2";

/// Secret name of the keypair for session `sid`.
pub fn pp_secret_name(sid: &str) -> String {
    format!("pp-{}", sid)
}

/// KBS path the adaptor publishes the peer-pod private key to.
pub fn kbs_pp_private_key_path(sid: &str) -> String {
    format!("default/pp-{}/privateKey", sid)
}

/// Worker-node (adaptor) side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptorConfig {
    /// Tags of services listened for on the worker node
    pub inbounds: Vec<String>,

    /// Tags of services dialed on the worker node
    pub outbounds: Vec<String>,

    /// Publish keys to KBS
    pub secure_comms_trustee: bool,

    /// KBS `host:port`
    pub kbs_address: String,

    /// SSH port of the peer-pod
    pub ssh_port: u16,

    /// RSA size for generated keypairs
    pub key_bits: usize,
}

impl Default for AdaptorConfig {
    fn default() -> Self {
        Self {
            inbounds: vec!["KUBERNETES_PHASE:KATAAGENT:0".to_string()],
            outbounds: vec!["BOTH_PHASES:KBS:8080".to_string()],
            secure_comms_trustee: false,
            kbs_address: "127.0.0.1:8080".to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            key_bits: DEFAULT_RSA_BITS,
        }
    }
}

/// Peer-pod (forwarder) side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Tags of services listened for on the peer-pod
    pub inbounds: Vec<String>,

    /// Tags of services dialed on the peer-pod
    pub outbounds: Vec<String>,

    /// SSH listen port
    pub ssh_port: u16,

    /// Resource endpoint port used to fetch secrets
    pub api_port: u16,

    /// Network namespace of the pod (empty = current)
    pub pod_namespace: String,

    /// Singleton sentinel
    pub singleton_path: PathBuf,

    /// Optional attestation-phase client key
    pub unproven_key_path: PathBuf,

    /// RSA size for the ephemeral attestation host key
    pub host_key_bits: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            inbounds: vec!["BOTH_PHASES:KBS:8080".to_string()],
            outbounds: vec!["KUBERNETES_PHASE:KATAAGENT:127.0.0.1:15150".to_string()],
            ssh_port: DEFAULT_SSH_PORT,
            api_port: DEFAULT_API_PORT,
            pod_namespace: String::new(),
            singleton_path: PathBuf::from(SINGLETON_PATH),
            unproven_key_path: PathBuf::from(UNPROVEN_WN_PUBLIC_KEY_PATH),
            host_key_bits: ATTESTATION_RSA_BITS,
        }
    }
}

impl ForwarderConfig {
    /// Namespace path for the pod, if one is configured.
    pub fn pod_namespace_path(&self) -> Option<PathBuf> {
        if self.pod_namespace.is_empty() {
            None
        } else {
            Some(PathBuf::from(NETNS_DIR).join(&self.pod_namespace))
        }
    }
}
