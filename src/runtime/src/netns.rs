//! Network-namespace scoped listen and dial.
//!
//! A namespace switch applies to the calling OS thread, so every switch runs
//! on a short-lived dedicated thread: enter, perform the socket call, restore,
//! exit. The socket keeps the namespace it was created in; the tokio runtime
//! threads never change namespace.

use securecomms_core::config::NETNS_DIR;
use securecomms_core::{CommsError, Result};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;

/// Upper bound for a dial performed inside a namespace.
const NAMESPACE_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Path of a named network namespace.
pub fn namespace_path(name: &str) -> PathBuf {
    Path::new(NETNS_DIR).join(name)
}

fn namespace_error(path: &Path, message: impl Into<String>) -> CommsError {
    CommsError::NamespaceError {
        namespace: path.display().to_string(),
        message: message.into(),
    }
}

#[cfg(target_os = "linux")]
fn enter_and_run<T, F>(target: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T>,
{
    use nix::sched::{setns, CloneFlags};
    use std::fs::File;

    struct Restore(File);

    impl Drop for Restore {
        fn drop(&mut self) {
            if let Err(e) = setns(&self.0, CloneFlags::CLONE_NEWNET) {
                tracing::error!(error = %e, "Failed to restore network namespace");
            }
        }
    }

    let target_ns = File::open(target).map_err(|e| namespace_error(target, e.to_string()))?;
    let original = File::open("/proc/thread-self/ns/net")
        .map_err(|e| namespace_error(target, format!("cannot open current namespace: {}", e)))?;

    setns(&target_ns, CloneFlags::CLONE_NEWNET)
        .map_err(|e| namespace_error(target, format!("setns failed: {}", e)))?;
    let _restore = Restore(original);

    f().map_err(CommsError::from)
}

#[cfg(not(target_os = "linux"))]
fn enter_and_run<T, F>(target: &Path, _f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T>,
{
    Err(namespace_error(target, "network namespaces require Linux"))
}

/// Run `f` on a dedicated thread attached to the namespace at `ns_path`.
pub async fn run_in_namespace<T, F>(ns_path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    let path = ns_path.to_path_buf();
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("netns".to_string())
        .spawn(move || {
            let _ = tx.send(enter_and_run(&path, f));
        })?;

    rx.await
        .map_err(|_| namespace_error(ns_path, "namespace worker exited without a result"))?
}

/// Bind a TCP listener, inside `ns_path` when given.
pub async fn bind_in_namespace(ns_path: Option<&Path>, addr: SocketAddr) -> Result<TcpListener> {
    let Some(ns_path) = ns_path else {
        return Ok(TcpListener::bind(addr).await?);
    };

    let listener = run_in_namespace(ns_path, move || {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    })
    .await?;

    tracing::debug!(namespace = %ns_path.display(), %addr, "Bound listener in namespace");
    Ok(TcpListener::from_std(listener)?)
}

/// Dial a TCP connection, from inside `ns_path` when given.
pub async fn connect_in_namespace(ns_path: Option<&Path>, addr: SocketAddr) -> Result<TcpStream> {
    let Some(ns_path) = ns_path else {
        return Ok(TcpStream::connect(addr).await?);
    };

    // Only the socket is created inside the namespace; the connect itself
    // runs on tokio and stops when the caller drops it.
    let socket = run_in_namespace(ns_path, move || match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    })
    .await?;

    tokio::time::timeout(NAMESPACE_DIAL_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| CommsError::TimeoutError(format!("dialing {} in {}", addr, ns_path.display())))?
        .map_err(CommsError::from)
}
