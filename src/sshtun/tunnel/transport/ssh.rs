use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use russh::{
    Channel, Disconnect,
    client::{self, Msg},
};
use russh_keys::key;
use tokio::sync::{Mutex, mpsc};

use crate::sshtun::{
    endpoint::Endpoint,
    tunnel::transport::{
        Accepted, AuthConfig, AuthMethod, BoxedStream, HostVerification, Transport,
        TransportListener, TransportSession,
    },
};

/// Forwarded connections queued per remote listener before new ones are refused.
const FORWARDED_BACKLOG: usize = 64;

/// Remote listeners keyed by the server-side port they were bound on.
///
/// The connection handler owns the map; everything else holds a `Weak` so that
/// all pending `accept` calls observe the end of the SSH connection.
type ForwardRoutes = DashMap<u32, mpsc::Sender<Accepted>>;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub keepalive_interval: Duration,
}

pub struct SshTransport {
    opts: SshOptions,
}

impl SshTransport {
    pub fn new(opts: SshOptions) -> Self {
        Self { opts }
    }

    fn client_config(&self) -> client::Config {
        let keepalive = (!self.opts.keepalive_interval.is_zero())
            .then_some(self.opts.keepalive_interval);
        client::Config {
            keepalive_interval: keepalive,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn dial(
        &self,
        server: &Endpoint,
        auth: &AuthConfig,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let routes = Arc::new(ForwardRoutes::new());
        let handler = ClientHandler {
            server: server.clone(),
            verification: auth.host_verification.clone(),
            routes: routes.clone(),
        };

        let mut handle = client::connect(Arc::new(self.client_config()), server.to_string(), handler)
            .await
            .with_context(|| format!("ssh: connect {server}"))?;

        let accepted = match &auth.method {
            AuthMethod::Password(secret) => {
                handle
                    .authenticate_password(auth.user.clone(), secret.clone())
                    .await
            }
            AuthMethod::Key { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                    .with_context(|| format!("ssh: load key {}", path.display()))?;
                handle
                    .authenticate_publickey(auth.user.clone(), Arc::new(key))
                    .await
            }
        }
        .with_context(|| format!("ssh: authenticate {}@{server}", auth.user))?;

        if !accepted {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            anyhow::bail!("ssh: authentication rejected for {}@{server}", auth.user);
        }

        tracing::debug!(server = %server, user = %auth.user, "ssh: authenticated");

        Ok(Arc::new(SshSession {
            shared: Arc::new(Shared {
                server: server.clone(),
                handle: Mutex::new(handle),
                routes: Arc::downgrade(&routes),
            }),
        }))
    }
}

struct ClientHandler {
    server: Endpoint,
    verification: HostVerification,
    routes: Arc<ForwardRoutes>,
}

impl ClientHandler {
    /// known_hosts entries are keyed by the bare host.
    fn known_hosts_host(&self) -> &str {
        self.server
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known_hosts = match &self.verification {
            HostVerification::Insecure => {
                tracing::debug!(server = %self.server, "ssh: host key verification disabled");
                return Ok(true);
            }
            HostVerification::Strict { known_hosts } => known_hosts,
        };

        let host = self.known_hosts_host();
        let res = match known_hosts {
            Some(path) => {
                russh_keys::check_known_hosts_path(host, self.server.port, server_public_key, path)
            }
            None => russh_keys::check_known_hosts(host, self.server.port, server_public_key),
        };

        match res {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    server = %self.server,
                    fingerprint = %server_public_key.fingerprint(),
                    "ssh: server key not in known_hosts"
                );
                Ok(false)
            }
            Err(err) => {
                tracing::warn!(
                    server = %self.server,
                    fingerprint = %server_public_key.fingerprint(),
                    err = %err,
                    "ssh: server key rejected"
                );
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let peer = format!("{originator_address}:{originator_port}");
        let Some(tx) = self.routes.get(&connected_port).map(|r| r.value().clone()) else {
            tracing::warn!(
                bound = %format!("{connected_address}:{connected_port}"),
                peer = %peer,
                "ssh: forwarded connection for unknown listener"
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let accepted = Accepted {
            stream: Box::new(channel.into_stream()),
            peer,
        };
        if let Err(err) = tx.try_send(accepted) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "backlog full",
                mpsc::error::TrySendError::Closed(_) => "listener closed",
            };
            tracing::warn!(
                bound = %format!("{connected_address}:{connected_port}"),
                reason,
                "ssh: dropping forwarded connection"
            );
        }
        Ok(())
    }
}

struct Shared {
    server: Endpoint,
    handle: Mutex<client::Handle<ClientHandler>>,
    routes: Weak<ForwardRoutes>,
}

impl Shared {
    fn routes(&self) -> anyhow::Result<Arc<ForwardRoutes>> {
        live_routes(&self.routes, &self.server)
    }
}

fn live_routes(
    routes: &Weak<ForwardRoutes>,
    server: &Endpoint,
) -> anyhow::Result<Arc<ForwardRoutes>> {
    routes
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("ssh: connection to {server} closed"))
}

struct SshSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportSession for SshSession {
    async fn dial(&self, target: &Endpoint) -> anyhow::Result<BoxedStream> {
        let handle = self.shared.handle.lock().await;
        let channel = handle
            .channel_open_direct_tcpip(target.host.clone(), u32::from(target.port), "127.0.0.1", 0)
            .await
            .with_context(|| format!("ssh: open direct-tcpip to {target}"))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn listen(&self, bind: &Endpoint) -> anyhow::Result<Box<dyn TransportListener>> {
        let routes = self.shared.routes()?;
        let port = u32::from(bind.port);
        let (tx, rx) = mpsc::channel(FORWARDED_BACKLOG);

        // Routable before the server confirms; connections may arrive right after the reply.
        routes.insert(port, tx);

        let res = {
            let mut handle = self.shared.handle.lock().await;
            handle.tcpip_forward(bind.host.clone(), port).await
        };
        if let Err(err) = res {
            routes.remove(&port);
            return Err(err).with_context(|| format!("ssh: tcpip-forward {bind}"));
        }

        Ok(Box::new(SshListener {
            shared: self.shared.clone(),
            bound: bind.clone(),
            incoming: Mutex::new(rx),
        }))
    }

    async fn close(&self) {
        let handle = self.shared.handle.lock().await;
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(server = %self.shared.server, err = %err, "ssh: disconnect");
        }
    }
}

struct SshListener {
    shared: Arc<Shared>,
    bound: Endpoint,
    incoming: Mutex<mpsc::Receiver<Accepted>>,
}

#[async_trait]
impl TransportListener for SshListener {
    async fn accept(&self) -> anyhow::Result<Accepted> {
        let mut rx = self.incoming.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("ssh: connection to {} closed", self.shared.server))
    }

    fn bound(&self) -> Endpoint {
        self.bound.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        let port = u32::from(self.bound.port);
        if let Ok(routes) = self.shared.routes() {
            routes.remove(&port);
        }
        let handle = self.shared.handle.lock().await;
        handle
            .cancel_tcpip_forward(self.bound.host.clone(), port)
            .await
            .with_context(|| format!("ssh: cancel tcpip-forward {}", self.bound))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(host: &str) -> ClientHandler {
        ClientHandler {
            server: Endpoint::new(host, 22),
            verification: HostVerification::Insecure,
            routes: Arc::new(ForwardRoutes::new()),
        }
    }

    #[test]
    fn known_hosts_lookup_uses_bare_host() {
        assert_eq!(handler("[::1]").known_hosts_host(), "::1");
        assert_eq!(handler("bastion.example").known_hosts_host(), "bastion.example");
    }

    #[test]
    fn routes_are_gone_once_the_connection_handler_drops() {
        let h = handler("bastion.example");
        let weak = Arc::downgrade(&h.routes);
        let server = h.server.clone();
        assert!(live_routes(&weak, &server).is_ok());

        drop(h);
        let err = live_routes(&weak, &server).unwrap_err();
        assert!(err.to_string().contains("connection to bastion.example:22 closed"));
    }
}
