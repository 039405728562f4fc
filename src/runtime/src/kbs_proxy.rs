//! HTTP reverse proxy served on the `KBS` tunnel.
//!
//! The peer-pod asks for its own private key with the placeholder path
//! `.../pp-sid/privateKey`; the proxy substitutes the session id before
//! forwarding to the real KBS. All other paths pass through untouched.

use crate::transport::TunnelStream;
use hyper::client::HttpConnector;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use securecomms_core::config::PP_PRIVATE_KEY_RESOURCE;
use securecomms_core::{CommsError, Result};

const PLACEHOLDER: &str = "pp-sid/";

/// Substitute the session id into a private-key placeholder path.
///
/// Only paths ending with `pp-sid/privateKey` are rewritten, and only the
/// first `pp-sid/` is replaced.
pub fn rewrite_path(sid: &str, path: &str) -> String {
    if path.ends_with(PP_PRIVATE_KEY_RESOURCE) {
        path.replacen(PLACEHOLDER, &format!("pp-{}/", sid), 1)
    } else {
        path.to_string()
    }
}

fn target_uri(backend: &str, sid: &str, uri: &Uri) -> Result<Uri> {
    let path = rewrite_path(sid, uri.path());
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };
    Uri::builder()
        .scheme("http")
        .authority(backend)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| CommsError::HttpError(format!("bad proxy target: {}", e)))
}

async fn forward(
    client: Client<HttpConnector>,
    backend: String,
    sid: String,
    mut req: Request<Body>,
) -> std::result::Result<Response<Body>, hyper::Error> {
    let uri = match target_uri(&backend, &sid, req.uri()) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(error = %e, "KBS proxy cannot build target");
            let mut resp = Response::new(Body::from(e.to_string()));
            *resp.status_mut() = StatusCode::BAD_GATEWAY;
            return Ok(resp);
        }
    };
    tracing::debug!(method = %req.method(), from = %req.uri(), to = %uri, "KBS proxy request");
    *req.uri_mut() = uri;
    client.request(req).await
}

/// Serve HTTP/1.1 on `stream`, forwarding every request to `backend`
/// (`host:port`). Returns when the stream reaches EOF or fails.
pub async fn serve(stream: TunnelStream, backend: String, sid: String) -> Result<()> {
    let client = Client::new();
    let service = service_fn(move |req| forward(client.clone(), backend.clone(), sid.clone(), req));

    Http::new()
        .http1_only(true)
        .http1_keep_alive(true)
        .serve_connection(stream, service)
        .await
        .map_err(|e| CommsError::HttpError(format!("KBS proxy connection failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::make_service_fn;
    use hyper::Server;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rewrite_placeholder() {
        assert_eq!(
            rewrite_path("xyz", "/kbs/v0/resource/default/pp-sid/privateKey"),
            "/kbs/v0/resource/default/pp-xyz/privateKey"
        );
        assert_eq!(
            rewrite_path("xyz", "/default/pp-sid/privateKey"),
            "/default/pp-xyz/privateKey"
        );
    }

    #[test]
    fn test_rewrite_passthrough() {
        for path in [
            "/default/sshclient/publicKey",
            "/default/pp-sid/publicKey",
            "/default/pp-sid/privateKey/extra",
            "/pp-sid/other/thing",
        ] {
            assert_eq!(rewrite_path("xyz", path), path);
        }
    }

    #[test]
    fn test_rewrite_replaces_first_placeholder_only() {
        assert_eq!(
            rewrite_path("s1", "/pp-sid/a/pp-sid/privateKey"),
            "/pp-s1/a/pp-sid/privateKey"
        );
    }

    #[test]
    fn test_target_uri_keeps_query() {
        let uri: Uri = "/default/pp-sid/privateKey?x=1".parse().unwrap();
        let target = target_uri("127.0.0.1:9004", "abc", &uri).unwrap();
        assert_eq!(
            target.to_string(),
            "http://127.0.0.1:9004/default/pp-abc/privateKey?x=1"
        );
    }

    async fn echo_path_backend() -> SocketAddr {
        let make = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                Ok::<_, Infallible>(Response::new(Body::from(req.uri().path().to_string())))
            }))
        });
        let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_serve_rewrites_over_stream() {
        let backend = echo_path_backend().await;
        let (proxy_side, mut client_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(Box::new(proxy_side), backend.to_string(), "xyz".into()));

        client_side
            .write_all(b"GET /default/pp-sid/privateKey HTTP/1.1\r\nHost: kbs\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client_side.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("/default/pp-xyz/privateKey"), "{response}");
    }
}
