use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::watch};

use crate::sshtun::{
    config::{ConfigError, TunnelConfig},
    telemetry::SharedSessions,
    tunnel::{
        DriverError,
        session::{SessionContext, forward_session},
        transport::Transport,
    },
};

/// Listens on the local endpoint and tunnels every accepted connection to the
/// remote endpoint through its own transport connection.
pub struct ForwardTunnel {
    ctx: Arc<SessionContext>,
}

impl ForwardTunnel {
    /// Fails on an incomplete configuration without touching the network.
    pub fn new(
        config: Arc<TunnelConfig>,
        transport: Arc<dyn Transport>,
        sessions: SharedSessions,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ctx: Arc::new(SessionContext {
                transport,
                config,
                sessions,
            }),
        })
    }

    pub async fn bind(&self) -> Result<ForwardListener, DriverError> {
        let addr = self.ctx.config.local.to_string();
        let ln = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| DriverError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = ln
            .local_addr()
            .map_err(|source| DriverError::Bind { addr, source })?;

        Ok(ForwardListener {
            ln,
            local_addr,
            ctx: self.ctx.clone(),
        })
    }

    /// Binds, then serves until `shutdown` flips to `true` or accept fails.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), DriverError> {
        let ln = self.bind().await?;
        tracing::info!(
            local = %ln.local_addr(),
            server = %self.ctx.config.server,
            remote = %self.ctx.config.remote,
            transport = self.ctx.transport.name(),
            "forward: listening"
        );
        ln.serve(shutdown).await
    }
}

pub struct ForwardListener {
    ln: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<SessionContext>,
}

impl ForwardListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Sessions run detached and never hold up the next accept;
    /// the listener is released when this returns.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DriverError> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (conn, peer) = res.map_err(|source| DriverError::Accept {
                        addr: self.local_addr.to_string(),
                        source,
                    })?;
                    let _ = conn.set_nodelay(true);
                    let ctx = self.ctx.clone();

                    tokio::spawn(async move {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(peer = %peer, "forward: accepted");
                        }
                        forward_session(ctx, Box::new(conn), peer.to_string()).await;
                    });
                }
            }
        }

        tracing::info!(local = %self.local_addr, "forward: stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sshtun::{
        config::TunnelMode,
        endpoint::Endpoint,
        telemetry::SessionRegistry,
        tunnel::transport::mock::{self, MockBehavior, MockTransport},
    };
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        task::JoinHandle,
        time,
    };

    struct Running {
        addr: SocketAddr,
        sessions: SharedSessions,
        shutdown: watch::Sender<bool>,
        driver: JoinHandle<Result<(), DriverError>>,
    }

    async fn start(transport: Arc<MockTransport>, remote: Endpoint) -> Running {
        let sessions: SharedSessions = Arc::new(SessionRegistry::new());
        // Validation rejects local port 0, so build the driver directly to get an ephemeral port.
        let tunnel = ForwardTunnel {
            ctx: Arc::new(SessionContext {
                transport,
                config: Arc::new(TunnelConfig::for_tests(
                    TunnelMode::Forward,
                    Endpoint::new("127.0.0.1", 0),
                    remote,
                )),
                sessions: sessions.clone(),
            }),
        };

        let ln = tunnel.bind().await.unwrap();
        let addr = ln.local_addr();
        let (shutdown, rx) = watch::channel(false);
        let driver = tokio::spawn(ln.serve(rx));
        Running {
            addr,
            sessions,
            shutdown,
            driver,
        }
    }

    fn payload(i: usize) -> Vec<u8> {
        (0..10 * 1024)
            .map(|j: usize| (j as u8).wrapping_mul(7).wrapping_add(i as u8 * 50))
            .collect()
    }

    /// Sends `data` through the tunnel and reads the echo; `None` if the session was refused.
    async fn round_trip(addr: SocketAddr, data: Vec<u8>) -> Option<Vec<u8>> {
        let mut c = TcpStream::connect(addr).await.unwrap();
        if c.write_all(&data).await.is_err() {
            return None;
        }
        let mut got = vec![0u8; data.len()];
        match c.read_exact(&mut got).await {
            Ok(_) => Some(got),
            Err(_) => None,
        }
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !cond() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn three_concurrent_clients_get_their_own_echo() {
        let echo = mock::spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let t = start(transport.clone(), Endpoint::new("127.0.0.1", echo.port())).await;

        let clients: Vec<_> = (0..3)
            .map(|i| {
                let addr = t.addr;
                tokio::spawn(async move {
                    let data = payload(i);
                    let got = round_trip(addr, data.clone()).await;
                    (data, got)
                })
            })
            .collect();

        for c in clients {
            let (sent, got) = c.await.unwrap();
            let got = got.expect("session served");
            assert!(got == sent, "cross-talk or corruption");
        }

        assert_eq!(transport.server_dials(), 3);
        eventually("sessions to finish", || t.sessions.len() == 0).await;
        eventually("transport connections to close", || transport.closed_sessions() == 3).await;

        t.shutdown.send(true).unwrap();
        let res = time::timeout(Duration::from_secs(2), t.driver)
            .await
            .expect("driver stopped")
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn failed_session_leaves_the_others_running() {
        let echo = mock::spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new(MockBehavior {
            fail_server_dials: vec![1],
            ..MockBehavior::default()
        }));
        let t = start(transport.clone(), Endpoint::new("127.0.0.1", echo.port())).await;

        let clients: Vec<_> = (0..3)
            .map(|i| {
                let addr = t.addr;
                tokio::spawn(async move {
                    let data = payload(i);
                    let got = round_trip(addr, data.clone()).await;
                    (data, got)
                })
            })
            .collect();

        let mut served = 0;
        let mut refused = 0;
        for c in clients {
            match c.await.unwrap() {
                (sent, Some(got)) => {
                    assert!(got == sent);
                    served += 1;
                }
                (_, None) => refused += 1,
            }
        }
        assert_eq!((served, refused), (2, 1));
        assert!(!t.driver.is_finished());
        eventually("sessions to finish", || t.sessions.len() == 0).await;
    }

    #[tokio::test]
    async fn dropping_one_live_session_leaves_the_others_running() {
        let echo = mock::spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let t = start(transport.clone(), Endpoint::new("127.0.0.1", echo.port())).await;

        // Establish all three sessions with a first chunk echoed back.
        let head = 1024;
        let mut clients = Vec::new();
        for i in 0..3 {
            let data = payload(i);
            let mut c = TcpStream::connect(t.addr).await.unwrap();
            c.write_all(&data[..head]).await.unwrap();
            let mut got = vec![0u8; head];
            c.read_exact(&mut got).await.unwrap();
            assert!(got[..] == data[..head]);
            clients.push((c, data));
        }
        assert_eq!(t.sessions.len(), 3);

        // Kill the middle one mid-stream, leaving its echo unread.
        let (mut killed, data) = clients.remove(1);
        killed.write_all(&data[head..head + 4096]).await.unwrap();
        drop(killed);

        for (mut c, data) in clients {
            c.write_all(&data[head..]).await.unwrap();
            let mut got = vec![0u8; data.len() - head];
            time::timeout(Duration::from_secs(5), c.read_exact(&mut got))
                .await
                .expect("surviving session still relays")
                .unwrap();
            assert!(got[..] == data[head..]);
        }

        eventually("sessions to finish", || t.sessions.len() == 0).await;
        assert!(!t.driver.is_finished());
        assert_eq!(transport.server_dials(), 3);
    }

    #[tokio::test]
    async fn dial_failure_does_not_stop_accepting() {
        let echo = mock::spawn_echo_server().await;
        let transport = Arc::new(MockTransport::new(MockBehavior {
            fail_server_dials: vec![0],
            ..MockBehavior::default()
        }));
        let t = start(transport.clone(), Endpoint::new("127.0.0.1", echo.port())).await;

        assert!(round_trip(t.addr, payload(0)).await.is_none());
        let data = payload(1);
        assert_eq!(round_trip(t.addr, data.clone()).await, Some(data));
        assert_eq!(transport.server_dials(), 2);
    }

    #[tokio::test]
    async fn bind_failure_is_fatal_before_any_dial() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let cfg = TunnelConfig::for_tests(
            TunnelMode::Forward,
            Endpoint::new("127.0.0.1", port),
            Endpoint::new("127.0.0.1", 9),
        );
        let tunnel = ForwardTunnel::new(
            Arc::new(cfg),
            transport.clone(),
            Arc::new(SessionRegistry::new()),
        )
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let err = tunnel.run(rx).await.unwrap_err();
        assert!(matches!(err, DriverError::Bind { .. }));
        assert_eq!(transport.server_dials(), 0);
    }

    #[tokio::test]
    async fn incomplete_config_is_rejected_at_construction() {
        let transport = Arc::new(MockTransport::new(MockBehavior::default()));
        let mut cfg = TunnelConfig::for_tests(
            TunnelMode::Forward,
            Endpoint::new("127.0.0.1", 8080),
            Endpoint::new("db", 5432),
        );
        cfg.remote.port = 0;

        let res = ForwardTunnel::new(
            Arc::new(cfg),
            transport.clone(),
            Arc::new(SessionRegistry::new()),
        );
        assert!(matches!(res, Err(ConfigError::Missing("remote_port"))));
        assert_eq!(transport.server_dials(), 0);
    }
}
