//! Client for the in-pod resource endpoint.
//!
//! Secrets are fetched over plain HTTP from `127.0.0.1:<port>` as seen from
//! the pod's network namespace, so the connector dials from inside that
//! namespace when one is configured.

use crate::secrets::GetSecret;
use async_trait::async_trait;
use hyper::client::Client;
use hyper::{Body, StatusCode, Uri};
use securecomms_core::{CommsError, Result};
use securecomms_runtime::netns::connect_in_namespace;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;

/// Dials HTTP targets, optionally from inside a network namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceConnector {
    ns_path: Option<Arc<PathBuf>>,
}

impl NamespaceConnector {
    pub fn new(ns_path: Option<PathBuf>) -> Self {
        Self {
            ns_path: ns_path.map(Arc::new),
        }
    }
}

impl tower::Service<Uri> for NamespaceConnector {
    type Response = TcpStream;
    type Error = CommsError;
    type Future = Pin<Box<dyn Future<Output = Result<TcpStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let ns_path = self.ns_path.clone();
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| CommsError::HttpError(format!("no host in '{}'", uri)))?;
            let ip: IpAddr = host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse()
                .map_err(|_| CommsError::HttpError(format!("host '{}' is not an IP address", host)))?;
            let addr = SocketAddr::new(ip, uri.port_u16().unwrap_or(80));
            connect_in_namespace(ns_path.as_deref().map(PathBuf::as_path), addr).await
        })
    }
}

/// Fetches named resources from the resource endpoint.
pub struct ApiClient {
    base: String,
    client: Client<NamespaceConnector, Body>,
}

impl ApiClient {
    pub fn new(service_port: u16, ns_path: Option<PathBuf>) -> Self {
        Self {
            base: format!("http://127.0.0.1:{}", service_port),
            client: Client::builder().build(NamespaceConnector::new(ns_path)),
        }
    }

    /// GET `/cdh/resource/default/<key>`.
    pub async fn get_key(&self, key: &str) -> Result<Vec<u8>> {
        let url = format!("{}/cdh/resource/default/{}", self.base, key);
        let uri: Uri = url
            .parse()
            .map_err(|e| CommsError::HttpError(format!("bad resource url '{}': {}", url, e)))?;

        let resp = self
            .client
            .get(uri)
            .await
            .map_err(|e| CommsError::HttpError(format!("get {}: {}", key, e)))?;
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| CommsError::HttpError(format!("get {}: reading body: {}", key, e)))?;

        if status != StatusCode::OK {
            return Err(CommsError::HttpError(format!(
                "get {}: status {} - {}",
                key,
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }
        tracing::info!(key, status = status.as_u16(), "Fetched resource");
        Ok(body.to_vec())
    }
}

#[async_trait]
impl GetSecret for ApiClient {
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        self.get_key(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Response, Server};
    use std::convert::Infallible;

    async fn resource_server() -> u16 {
        let make = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                let resp = match req.uri().path() {
                    "/cdh/resource/default/sshclient/publicKey" => {
                        Response::new(Body::from("ssh-rsa AAAA"))
                    }
                    path => {
                        let mut resp = Response::new(Body::from(format!("no resource at {}", path)));
                        *resp.status_mut() = StatusCode::NOT_FOUND;
                        resp
                    }
                };
                Ok::<_, Infallible>(resp)
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let port = server.local_addr().port();
        tokio::spawn(server);
        port
    }

    #[tokio::test]
    async fn test_get_key() {
        let client = ApiClient::new(resource_server().await, None);
        let key = client.get_key("sshclient/publicKey").await.unwrap();
        assert_eq!(key, b"ssh-rsa AAAA");
    }

    #[tokio::test]
    async fn test_get_key_error_carries_body() {
        let client = ApiClient::new(resource_server().await, None);
        let err = client.get_key("pp-sid/privateKey").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("404"), "{message}");
        assert!(message.contains("no resource at /cdh/resource/default/pp-sid/privateKey"), "{message}");
    }

    #[tokio::test]
    async fn test_get_key_unreachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ApiClient::new(port, None);
        assert!(matches!(
            client.get_secret("sshclient/publicKey").await,
            Err(CommsError::HttpError(_))
        ));
    }

    #[tokio::test]
    async fn test_connector_in_missing_namespace() {
        let client = ApiClient::new(1, Some(PathBuf::from("/run/netns/securecomms-no-such-ns")));
        assert!(client.get_key("x").await.is_err());
    }
}
