use std::sync::Arc;

use tokio::sync::watch;

use crate::sshtun::{
    config::{ConfigError, TunnelConfig},
    endpoint::Endpoint,
    telemetry::SharedSessions,
    tunnel::{
        DriverError,
        session::{SessionContext, reverse_session, with_dial_timeout},
        transport::{Accepted, Transport, TransportListener, TransportSession},
    },
};

/// Holds one transport connection to the server, has the server listen on the
/// remote endpoint, and relays every forwarded connection to the local endpoint.
pub struct ReverseTunnel {
    ctx: Arc<SessionContext>,
}

impl ReverseTunnel {
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

    /// Dials the server and requests the remote listener. Either failure is fatal.
    pub async fn connect(&self) -> Result<ReverseListener, DriverError> {
        let cfg = &self.ctx.config;

        let session = with_dial_timeout(
            cfg.dial_timeout,
            &cfg.server,
            self.ctx.transport.dial(&cfg.server, &cfg.auth),
        )
        .await
        .map_err(|err| DriverError::Connect {
            server: cfg.server.to_string(),
            reason: format!("{err:#}"),
        })?;

        tracing::info!(
            server = %cfg.server,
            user = %cfg.auth.user,
            transport = self.ctx.transport.name(),
            "reverse: connected"
        );

        let listen = with_dial_timeout(cfg.dial_timeout, &cfg.remote, session.listen(&cfg.remote));
        let listener = match listen.await {
            Ok(ln) => ln,
            Err(err) => {
                session.close().await;
                return Err(DriverError::RemoteListen {
                    remote: cfg.remote.to_string(),
                    server: cfg.server.to_string(),
                    reason: format!("{err:#}"),
                });
            }
        };

        Ok(ReverseListener {
            session,
            listener,
            ctx: self.ctx.clone(),
        })
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), DriverError> {
        let ln = self.connect().await?;
        tracing::info!(
            remote = %ln.bound(),
            server = %self.ctx.config.server,
            local = %self.ctx.config.local,
            "reverse: listening"
        );
        ln.serve(shutdown).await
    }
}

pub struct ReverseListener {
    session: Arc<dyn TransportSession>,
    listener: Box<dyn TransportListener>,
    ctx: Arc<SessionContext>,
}

impl ReverseListener {
    /// The server-side address connections arrive on.
    pub fn bound(&self) -> Endpoint {
        self.listener.bound()
    }

    /// Accept loop. The remote listener and the transport connection are
    /// released on every exit path.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DriverError> {
        let res = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                res = self.listener.accept() => {
                    match res {
                        Ok(Accepted { stream, peer }) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if tracing::enabled!(tracing::Level::DEBUG) {
                                    tracing::debug!(peer = %peer, "reverse: accepted");
                                }
                                reverse_session(ctx, stream, peer).await;
                            });
                        }
                        Err(err) => {
                            break Err(DriverError::RemoteAccept {
                                server: self.ctx.config.server.to_string(),
                                reason: format!("{err:#}"),
                            });
                        }
                    }
                }
            }
        };

        if let Err(err) = self.listener.close().await {
            let err = format!("{err:#}");
            tracing::debug!(err = %err, "reverse: close remote listener");
        }
        self.session.close().await;
        tracing::info!(remote = %self.ctx.config.remote, "reverse: stopped");
        res
    }
}
