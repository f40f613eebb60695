//! In-process stand-in for the SSH transport.
//!
//! Server dials always "succeed" unless told otherwise, streams opened through
//! a session go straight to loopback targets, and remote listeners are fed
//! from an mpsc channel owned by the test.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::sshtun::{
    endpoint::Endpoint,
    tunnel::transport::{
        Accepted, AuthConfig, BoxedStream, Transport, TransportListener, TransportSession,
    },
};

#[derive(Debug, Default, Clone)]
pub struct MockBehavior {
    /// Zero-based indices of server dials that fail.
    pub fail_server_dials: Vec<usize>,
    pub fail_target_dials: bool,
    /// Remote listen requests never get an answer.
    pub stall_listen: bool,
}

struct MockState {
    behavior: MockBehavior,
    dials: AtomicUsize,
    closed: AtomicUsize,
    incoming: std::sync::Mutex<Option<mpsc::Receiver<Accepted>>>,
}

pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            state: Arc::new(MockState {
                behavior,
                dials: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                incoming: std::sync::Mutex::new(None),
            }),
        }
    }

    /// A transport whose sessions accept one remote listen, fed by the returned sender.
    pub fn with_incoming(behavior: MockBehavior) -> (Self, mpsc::Sender<Accepted>) {
        let t = Self::new(behavior);
        let (tx, rx) = mpsc::channel(16);
        *t.state.incoming.lock().unwrap() = Some(rx);
        (t, tx)
    }

    pub fn server_dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn dial(
        &self,
        server: &Endpoint,
        _auth: &AuthConfig,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let n = self.state.dials.fetch_add(1, Ordering::SeqCst);
        if self.state.behavior.fail_server_dials.contains(&n) {
            anyhow::bail!("mock: dial {n} to {server} refused");
        }
        Ok(Arc::new(MockSession {
            state: self.state.clone(),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl TransportSession for MockSession {
    async fn dial(&self, target: &Endpoint) -> anyhow::Result<BoxedStream> {
        if self.state.behavior.fail_target_dials {
            anyhow::bail!("mock: target {target} unreachable");
        }
        let c = TcpStream::connect(target.to_string()).await?;
        Ok(Box::new(c))
    }

    async fn listen(&self, bind: &Endpoint) -> anyhow::Result<Box<dyn TransportListener>> {
        if self.state.behavior.stall_listen {
            std::future::pending::<()>().await;
        }
        let Some(rx) = self.state.incoming.lock().unwrap().take() else {
            anyhow::bail!("mock: listen on {bind} refused");
        };
        Ok(Box::new(MockListener {
            bound: bind.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn close(&self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockListener {
    bound: Endpoint,
    rx: tokio::sync::Mutex<mpsc::Receiver<Accepted>>,
}

#[async_trait]
impl TransportListener for MockListener {
    async fn accept(&self) -> anyhow::Result<Accepted> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("mock: session closed"))
    }

    fn bound(&self) -> Endpoint {
        self.bound.clone()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Loopback TCP server that echoes every connection back to itself.
pub async fn spawn_echo_server() -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = ln.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = conn.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn unused_local_port() -> u16 {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    ln.local_addr().unwrap().port()
}
