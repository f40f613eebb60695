use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::sshtun::endpoint::Endpoint;

/// Read and write halves of one byte stream behind a single object-safe trait,
/// so sockets, SSH channels and in-memory pipes can share `BoxedStream`.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::Key { path, passphrase } => f
                .debug_struct("Key")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostVerification {
    /// Check the server key against a known_hosts file (`~/.ssh/known_hosts` when `None`).
    Strict { known_hosts: Option<PathBuf> },
    /// Accept any server key.
    Insecure,
}

impl fmt::Display for HostVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostVerification::Strict { .. } => f.write_str("strict"),
            HostVerification::Insecure => f.write_str("insecure"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub user: String,
    pub method: AuthMethod,
    pub host_verification: HostVerification,
}

/// A stream handed back by a [`TransportListener`], with the originator's address.
pub struct Accepted {
    pub stream: BoxedStream,
    pub peer: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish an authenticated connection to `server`.
    async fn dial(
        &self,
        server: &Endpoint,
        auth: &AuthConfig,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open a stream to `target` as seen from the server's network.
    async fn dial(&self, target: &Endpoint) -> anyhow::Result<BoxedStream>;

    /// Ask the server to bind `bind` on its side and forward connections back.
    async fn listen(&self, bind: &Endpoint) -> anyhow::Result<Box<dyn TransportListener>>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Accepted>;

    /// The server-side address actually bound (port resolved when `0` was requested).
    fn bound(&self) -> Endpoint;

    async fn close(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
pub mod mock;
pub mod ssh;
