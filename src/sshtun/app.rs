use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::sshtun::{
    config::{TunnelConfig, TunnelMode},
    logging, telemetry,
    tunnel::{
        DriverError,
        forward::ForwardTunnel,
        reverse::ReverseTunnel,
        transport::ssh::{SshOptions, SshTransport},
    },
};

pub async fn run(cfg: TunnelConfig) -> anyhow::Result<()> {
    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
        tracing::info!(metrics_addr = %addr, "metrics: serving Prometheus exposition");
    }

    tracing::info!(
        mode = %cfg.mode,
        local = %cfg.local,
        server = %cfg.server,
        remote = %cfg.remote,
        user = %cfg.auth.user,
        host_key_check = %cfg.auth.host_verification,
        "sshtun: starting"
    );

    let cfg = Arc::new(cfg);
    let sessions = Arc::new(telemetry::SessionRegistry::new());
    let transport = Arc::new(SshTransport::new(SshOptions {
        keepalive_interval: cfg.keepalive_interval,
    }));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut driver: JoinHandle<Result<(), DriverError>> = match cfg.mode {
        TunnelMode::Forward => {
            let tunnel = ForwardTunnel::new(cfg.clone(), transport, sessions.clone())?;
            tokio::spawn(async move { tunnel.run(shutdown_rx).await })
        }
        TunnelMode::Reverse => {
            let tunnel = ReverseTunnel::new(cfg.clone(), transport, sessions.clone())?;
            tokio::spawn(async move { tunnel.run(shutdown_rx).await })
        }
    };

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or the driver giving up.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!(active_sessions = sessions.len(), "shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = &mut driver => {
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    let err = anyhow::Error::from(err);
                    tracing::error!(err = %format!("{err:#}"), "sshtun: tunnel stopped");
                    Err(err)
                }
                Err(join_err) => Err(join_err.into()),
            };
        }
    }

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    match tokio::time::timeout(drain_timeout, &mut driver).await {
        Ok(Ok(Err(err))) => {
            tracing::warn!(err = %err, "shutdown: tunnel stopped with error");
        }
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(timeout = ?drain_timeout, "shutdown: drain timed out");
            driver.abort();
        }
    }

    for s in sessions.snapshot() {
        tracing::debug!(sid = %s.id, kind = s.kind, peer = %s.peer, target = %s.target, "shutdown: abandoning session");
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
