//! End-to-end tests: worker-node adaptor against the peer-pod forwarder.
//!
//! Every test runs both sides in-process over loopback, with a stub KBS
//! and an in-memory secret store.

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use ring::rand::SystemRandom;
use ring::signature::Ed25519KeyPair;
use securecomms_adaptor::{MemorySecretStore, SecretStore, SshClient};
use securecomms_core::config::KBS_CLIENT_SECRET_NAME;
use securecomms_core::keys::generate_rsa;
use securecomms_core::{AdaptorConfig, CommsError, ForwarderConfig, KeyPairBlobs, Result};
use securecomms_guest::{ApiClient, GetSecret, SshServer};
use securecomms_runtime::{accept, ClientAuth, ServerSettings};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

const WEBSITE: &str = "port 7020 - this is my website!\n";
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// KBS stand-in: stores POSTed resources and serves them back on both the
/// KBS and the CDH resource paths.
#[derive(Clone, Default)]
struct StubKbs {
    resources: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl StubKbs {
    fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.resources.lock().get(path).cloned()
    }

    async fn handle(self, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
        let path = req.uri().path().to_string();
        let resource = path
            .strip_prefix("/kbs/v0/resource/")
            .or_else(|| path.strip_prefix("/cdh/resource/"))
            .map(str::to_string);
        let Some(resource) = resource else {
            return Ok(status(StatusCode::NOT_FOUND, "unknown path"));
        };

        let resp = match *req.method() {
            Method::POST => {
                let authorized = req
                    .headers()
                    .get(hyper::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.starts_with("Bearer ") && v.matches('.').count() == 2);
                if !authorized {
                    return Ok(status(StatusCode::UNAUTHORIZED, "missing token"));
                }
                let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                self.resources.lock().insert(resource, body.to_vec());
                Response::new(Body::empty())
            }
            Method::GET => match self.get(&resource) {
                Some(data) => Response::new(Body::from(data)),
                None => status(StatusCode::NOT_FOUND, "no such resource"),
            },
            _ => status(StatusCode::METHOD_NOT_ALLOWED, "unsupported method"),
        };
        Ok(resp)
    }

    async fn serve(&self) -> SocketAddr {
        let kbs = self.clone();
        let make = make_service_fn(move |_| {
            let kbs = kbs.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| kbs.clone().handle(req))) }
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }
}

fn status(code: StatusCode, message: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(message.to_string()));
    *resp.status_mut() = code;
    resp
}

async fn website() -> SocketAddr {
    let make = make_service_fn(|_| async {
        Ok::<_, Infallible>(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from(WEBSITE)))
        }))
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

async fn http_get(port: u16) -> hyper::Result<(StatusCode, Bytes)> {
    let uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
    let resp = Client::new().get(uri).await?;
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body()).await?;
    Ok((status, body))
}

fn ed25519_pem() -> Vec<u8> {
    let doc = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
    pem::encode(&pem::Pem::new("PRIVATE KEY", doc.as_ref().to_vec())).into_bytes()
}

/// Resource client bound once the forwarder's KBS inbound port is known.
#[derive(Default)]
struct LateApi(OnceCell<ApiClient>);

#[async_trait]
impl GetSecret for LateApi {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        match self.0.get() {
            Some(api) => api.get_key(name).await,
            None => Err(CommsError::ConfigError("resource client not ready".to_string())),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_phase_handshake_with_upgrade() {
    let kbs = StubKbs::default();
    let kbs_addr = kbs.serve().await;
    let web_addr = website().await;
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    // Peer-pod side.
    let api = Arc::new(LateApi::default());
    let forwarder = ForwarderConfig {
        inbounds: vec!["BOTH_PHASES:KBS:0".to_string()],
        outbounds: vec![format!("KUBERNETES_PHASE:WEB:127.0.0.1:{}", web_addr.port())],
        ssh_port: 0,
        singleton_path: dir.path().join("singleton"),
        unproven_key_path: dir.path().join("unproven"),
        host_key_bits: 2048,
        ..Default::default()
    };
    let server = Arc::new(SshServer::new(forwarder, api.clone()).await.unwrap());
    let kbs_inbound = server.inbound_port("KBS").unwrap();
    assert!(api.0.set(ApiClient::new(kbs_inbound, None)).is_ok());
    let pp_addr = server.start(&cancel).await.unwrap();

    // Worker-node side.
    let store = Arc::new(MemorySecretStore::new());
    store
        .store_secret(
            KBS_CLIENT_SECRET_NAME,
            &KeyPairBlobs {
                private_key: ed25519_pem(),
                public_key: Vec::new(),
            },
        )
        .await
        .unwrap();
    let config = AdaptorConfig {
        inbounds: vec!["KUBERNETES_PHASE:WEB:0".to_string()],
        outbounds: vec![format!("BOTH_PHASES:KBS:{}", kbs_addr)],
        secure_comms_trustee: true,
        kbs_address: kbs_addr.to_string(),
        ssh_port: pp_addr.port(),
        key_bits: 2048,
    };
    let client = SshClient::init(store.clone(), config).await.unwrap();
    assert_eq!(
        kbs.get("default/sshclient/publicKey").as_deref(),
        Some(client.wn_public_key())
    );

    let (instance, pp_private_key) = client.init_pp(&cancel, "xyz").await.unwrap();
    assert!(!instance.is_kubernetes_phase());
    assert_eq!(kbs.get("default/pp-xyz/privateKey"), Some(pp_private_key));
    let web_port = instance.get_port("WEB").unwrap();

    // Nothing serves the kubernetes-phase inbound yet.
    let before = timeout(Duration::from_millis(500), http_get(web_port)).await;
    assert!(!matches!(before, Ok(Ok(_))));

    timeout(Duration::from_secs(60), instance.start(&[LOCALHOST]))
        .await
        .expect("attestation phase timed out")
        .unwrap();
    assert!(instance.is_kubernetes_phase());

    let deadline = Instant::now() + Duration::from_secs(30);
    let body = loop {
        match timeout(Duration::from_secs(5), http_get(web_port)).await {
            Ok(Ok((StatusCode::OK, body))) => break body,
            other if Instant::now() < deadline => {
                tracing::debug!(?other, "kubernetes phase not serving yet");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            other => panic!("no response through the kubernetes phase: {:?}", other),
        }
    };
    assert_eq!(body, WEBSITE);

    instance.disconnect_pp("xyz").await.unwrap();
    assert!(!store.contains("pp-xyz"));
    cancel.cancel();
    server.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_key_mismatch_in_kubernetes_phase() {
    // A peer-pod presenting a host key nobody pinned.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let settings = ServerSettings::new(generate_rsa(2048).unwrap(), ClientAuth::Any);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let settings = settings.clone();
            tokio::spawn(async move {
                let _ = accept(stream, &settings).await;
            });
        }
    });

    // An existing pod secret selects the kubernetes phase directly.
    let store = Arc::new(MemorySecretStore::new());
    store.create_secret("pp-stale", 2048).await.unwrap();
    let config = AdaptorConfig {
        inbounds: Vec::new(),
        outbounds: Vec::new(),
        ssh_port: port,
        key_bits: 2048,
        ..Default::default()
    };
    let client = SshClient::init(store, config).await.unwrap();
    let cancel = CancellationToken::new();
    let (instance, _) = client.init_pp(&cancel, "stale").await.unwrap();
    assert!(instance.is_kubernetes_phase());
    instance.set_pp_addrs(&[LOCALHOST]);

    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        deadline.cancel();
    });
    let result = timeout(Duration::from_secs(30), instance.start_kubernetes())
        .await
        .expect("dial loop ignored cancellation");
    assert!(matches!(result, Err(CommsError::Cancelled(_))), "{:?}", result.err());
    assert!(attempts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_pod_secret_created_reused_and_deleted() {
    let store = Arc::new(MemorySecretStore::new());
    let config = AdaptorConfig {
        inbounds: Vec::new(),
        outbounds: Vec::new(),
        key_bits: 2048,
        ..Default::default()
    };
    let client = SshClient::init(store.clone(), config).await.unwrap();
    let cancel = CancellationToken::new();

    let (first, private_key) = client.init_pp(&cancel, "sid-1").await.unwrap();
    let stored = store.read_secret("pp-sid-1").await.unwrap().unwrap();
    assert!(!stored.private_key.is_empty());
    assert!(!stored.public_key.is_empty());
    assert_eq!(stored.private_key, private_key);

    let (second, again) = client.init_pp(&cancel, "sid-1").await.unwrap();
    assert_eq!(again, private_key);
    assert!(second.is_kubernetes_phase());

    first.disconnect_pp("sid-1").await.unwrap();
    assert!(store.read_secret("pp-sid-1").await.unwrap().is_none());
}
