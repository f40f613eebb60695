use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{io::AsyncWriteExt, net::TcpStream, time};

use crate::sshtun::{
    config::TunnelConfig,
    endpoint::Endpoint,
    relay::{Direction, RelayEnd, relay},
    telemetry::{self, SessionGuard, SessionInfo, SharedSessions},
    tunnel::transport::{BoxedStream, Transport, TransportSession},
};

/// State shared by every session a driver spawns.
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub config: Arc<TunnelConfig>,
    pub sessions: SharedSessions,
}

/// Serves one locally accepted connection: opens a fresh transport connection,
/// dials the remote target through it and relays until either side closes.
///
/// The transport connection lives exactly as long as this session.
pub async fn forward_session(ctx: Arc<SessionContext>, mut inbound: BoxedStream, peer: String) {
    let cfg = &ctx.config;
    let sid = telemetry::new_session_id();

    let (outbound, transport_session) = match open_forward(&ctx).await {
        Ok(v) => v,
        Err((stage, err)) => {
            metrics::counter!("sshtun_session_failures_total", "stage" => stage).increment(1);
            let err = format!("{err:#}");
            tracing::warn!(
                sid = %sid,
                peer = %peer,
                server = %cfg.server,
                target = %cfg.remote,
                stage,
                err = %err,
                "forward: session setup failed"
            );
            let _ = inbound.shutdown().await;
            return;
        }
    };

    relay_session(&ctx, sid, "forward", inbound, outbound, peer, &cfg.remote).await;
    transport_session.close().await;
}

type SetupError = (&'static str, anyhow::Error);

async fn open_forward(
    ctx: &SessionContext,
) -> Result<(BoxedStream, Arc<dyn TransportSession>), SetupError> {
    let cfg = &ctx.config;

    let transport_session = with_dial_timeout(
        cfg.dial_timeout,
        &cfg.server,
        ctx.transport.dial(&cfg.server, &cfg.auth),
    )
    .await
    .map_err(|err| ("server", err))?;

    match with_dial_timeout(cfg.dial_timeout, &cfg.remote, transport_session.dial(&cfg.remote))
        .await
    {
        Ok(outbound) => Ok((outbound, transport_session)),
        Err(err) => {
            transport_session.close().await;
            Err(("target", err))
        }
    }
}

/// Serves one connection forwarded back by the server: dials the local target
/// directly and relays. A failed local dial ends only this session.
pub async fn reverse_session(ctx: Arc<SessionContext>, mut inbound: BoxedStream, peer: String) {
    let cfg = &ctx.config;
    let sid = telemetry::new_session_id();

    let outbound = match dial_tcp_stream(&cfg.local, cfg.dial_timeout).await {
        Ok(s) => s,
        Err(err) => {
            metrics::counter!("sshtun_session_failures_total", "stage" => "local").increment(1);
            let err = format!("{err:#}");
            tracing::warn!(
                sid = %sid,
                peer = %peer,
                target = %cfg.local,
                err = %err,
                "reverse: local dial failed"
            );
            let _ = inbound.shutdown().await;
            return;
        }
    };

    relay_session(&ctx, sid, "reverse", inbound, outbound, peer, &cfg.local).await;
}

async fn relay_session(
    ctx: &SessionContext,
    sid: String,
    kind: &'static str,
    inbound: BoxedStream,
    outbound: BoxedStream,
    peer: String,
    target: &Endpoint,
) {
    let guard = SessionGuard::register(
        &ctx.sessions,
        SessionInfo {
            id: sid,
            kind,
            peer: peer.clone(),
            target: target.to_string(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        },
    );
    let sid = guard.id();
    tracing::debug!(sid = %sid, kind, peer = %peer, target = %target, "session: established");

    let started = Instant::now();
    let report = relay(inbound, outbound, ctx.config.relay).await;
    let elapsed = humantime::format_duration(Duration::from_millis(
        started.elapsed().as_millis() as u64,
    ));

    metrics::counter!("sshtun_bytes_total", "direction" => "inbound_to_outbound")
        .increment(report.a_to_b);
    metrics::counter!("sshtun_bytes_total", "direction" => "outbound_to_inbound")
        .increment(report.b_to_a);

    match &report.end {
        RelayEnd::Eof(dir) => {
            tracing::debug!(
                sid = %sid,
                peer = %peer,
                target = %target,
                closed_by = side(*dir),
                sent = report.a_to_b,
                received = report.b_to_a,
                elapsed = %elapsed,
                "session: closed"
            );
        }
        RelayEnd::IdleTimeout => {
            tracing::info!(
                sid = %sid,
                peer = %peer,
                target = %target,
                sent = report.a_to_b,
                received = report.b_to_a,
                elapsed = %elapsed,
                "session: idle timeout"
            );
        }
        RelayEnd::Failed(dir, err) => {
            metrics::counter!("sshtun_session_failures_total", "stage" => "relay").increment(1);
            tracing::warn!(
                sid = %sid,
                peer = %peer,
                target = %target,
                failed_from = side(*dir),
                sent = report.a_to_b,
                received = report.b_to_a,
                elapsed = %elapsed,
                err = %err,
                "session: relay failed"
            );
        }
    }
}

/// Which connection fed the direction that stopped first.
fn side(dir: Direction) -> &'static str {
    match dir {
        Direction::AToB => "inbound",
        Direction::BToA => "outbound",
    }
}

pub(super) async fn with_dial_timeout<T, F>(
    timeout: Duration,
    addr: impl fmt::Display,
    fut: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    time::timeout(timeout, fut)
        .await
        .with_context(|| format!("dial timeout {addr}"))?
}

async fn dial_tcp_stream(target: &Endpoint, timeout: Duration) -> anyhow::Result<BoxedStream> {
    let addr = target.to_string();
    let c = with_dial_timeout(timeout, &addr, async {
        TcpStream::connect(addr.as_str())
            .await
            .with_context(|| format!("dial {addr}"))
    })
    .await?;
    let _ = c.set_nodelay(true);
    Ok(Box::new(c))
}
