//! Keypair storage in Kubernetes secrets.
//!
//! Every keypair is one `Opaque` secret in the confidential-containers
//! namespace with a `privateKey` and a `publicKey` field.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Api, Client, Config};
use parking_lot::Mutex;
use securecomms_core::config::{PRIVATE_KEY_FIELD, PUBLIC_KEY_FIELD, SECRETS_NAMESPACE};
use securecomms_core::keys::generate_keypair_blobs;
use securecomms_core::{CommsError, KeyPairBlobs, Result};
use std::collections::{BTreeMap, HashMap};

/// Named keypair storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `None` when no secret with this name exists.
    async fn read_secret(&self, name: &str) -> Result<Option<KeyPairBlobs>>;

    async fn store_secret(&self, name: &str, keys: &KeyPairBlobs) -> Result<()>;

    async fn delete_secret(&self, name: &str) -> Result<()>;

    /// Generate an RSA keypair of `bits` and store it under `name`.
    async fn create_secret(&self, name: &str, bits: usize) -> Result<KeyPairBlobs> {
        let keys = tokio::task::spawn_blocking(move || generate_keypair_blobs(bits))
            .await
            .map_err(|e| CommsError::KeyError(format!("key generation failed: {}", e)))??;
        self.store_secret(name, &keys).await?;
        tracing::info!(name, "Created secret");
        Ok(keys)
    }
}

fn store_error(action: &str, name: &str, err: kube::Error) -> CommsError {
    CommsError::SecretStoreError(format!("{} secret '{}': {}", action, name, err))
}

/// Secrets in a Kubernetes namespace.
pub struct KubeSecretStore {
    api: Api<Secret>,
    namespace: String,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// In-cluster service account only.
    pub async fn in_cluster() -> Result<Self> {
        let config = Config::incluster().map_err(|e| {
            CommsError::SecretStoreError(format!("no in-cluster config to access the KubeApi: {}", e))
        })?;
        Self::from_config(config)
    }

    /// In-cluster config when available, otherwise the local kubeconfig
    /// (`KUBECONFIG` or `~/.kube/config`). `skip_verify` disables server
    /// certificate checks.
    pub async fn from_kubeconfig(skip_verify: bool) -> Result<Self> {
        let mut config = match Config::incluster() {
            Ok(config) => config,
            Err(_) => Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    CommsError::SecretStoreError(format!(
                        "no config found to access the KubeApi, use KUBECONFIG or ~/.kube/config: {}",
                        e
                    ))
                })?,
        };
        if skip_verify {
            tracing::warn!("Skipping KubeApi certificate verification");
            config.accept_invalid_certs = true;
            config.root_cert = None;
        }
        Self::from_config(config)
    }

    fn from_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config).map_err(|e| {
            CommsError::SecretStoreError(format!("failed to configure KubeApi client: {}", e))
        })?;
        Ok(Self::new(client, SECRETS_NAMESPACE))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn read_secret(&self, name: &str) -> Result<Option<KeyPairBlobs>> {
        let secret = match self.api.get(name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(None),
            Err(e) => return Err(store_error("read", name, e)),
        };
        let mut data = secret.data.unwrap_or_default();
        let mut field = |key: &str| data.remove(key).map(|v| v.0).unwrap_or_default();
        Ok(Some(KeyPairBlobs {
            private_key: field(PRIVATE_KEY_FIELD),
            public_key: field(PUBLIC_KEY_FIELD),
        }))
    }

    async fn store_secret(&self, name: &str, keys: &KeyPairBlobs) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (PRIVATE_KEY_FIELD.to_string(), ByteString(keys.private_key.clone())),
                (PUBLIC_KEY_FIELD.to_string(), ByteString(keys.public_key.clone())),
            ])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| store_error("create", name, e))?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| store_error("delete", name, e))?;
        tracing::info!(name, "Deleted secret");
        Ok(())
    }
}

/// In-process store; a stand-in for a cluster.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, KeyPairBlobs>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.secrets.lock().contains_key(name)
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn read_secret(&self, name: &str) -> Result<Option<KeyPairBlobs>> {
        Ok(self.secrets.lock().get(name).cloned())
    }

    async fn store_secret(&self, name: &str, keys: &KeyPairBlobs) -> Result<()> {
        let mut secrets = self.secrets.lock();
        if secrets.contains_key(name) {
            return Err(CommsError::SecretStoreError(format!(
                "create secret '{}': already exists",
                name
            )));
        }
        secrets.insert(name.to_string(), keys.clone());
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        match self.secrets.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(CommsError::SecretStoreError(format!(
                "delete secret '{}': not found",
                name
            ))),
        }
    }
}
