//! Byte relay between two duplex streams.
//!
//! Both copy directions run concurrently inside one `select!`. The first
//! direction to stop (end-of-stream or I/O error) ends the relay: the other
//! direction is cancelled, both write halves are shut down and both streams
//! are dropped before `relay` returns. Nothing is left blocked on a half-dead
//! connection.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{self, Instant},
};

/// Upper bound on the best-effort shutdown of each side once the relay is done.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            idle_timeout: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

#[derive(Debug)]
pub enum RelayEnd {
    /// The source of this direction reached end-of-stream.
    Eof(Direction),
    /// A read or write in this direction failed.
    Failed(Direction, io::Error),
    /// No bytes moved in either direction for the configured idle timeout.
    IdleTimeout,
}

#[derive(Debug)]
pub struct RelayReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
}

/// Relay bytes between `a` and `b` until either direction stops.
///
/// Takes ownership of both streams; both are closed on every return path.
pub async fn relay<A, B>(a: A, b: B, opts: RelayOptions) -> RelayReport
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let buffer_size = opts.buffer_size.max(1);
    let activity = Activity::new();
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let end = tokio::select! {
        res = copy_one_way(&mut a_rd, &mut b_wr, buffer_size, &a_to_b, &activity) => {
            finished(Direction::AToB, res)
        }
        res = copy_one_way(&mut b_rd, &mut a_wr, buffer_size, &b_to_a, &activity) => {
            finished(Direction::BToA, res)
        }
        _ = activity.idle(opts.idle_timeout), if !opts.idle_timeout.is_zero() => {
            RelayEnd::IdleTimeout
        }
    };

    let _ = time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(a_wr.shutdown(), b_wr.shutdown());
    })
    .await;

    RelayReport {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        end,
    }
}

fn finished(dir: Direction, res: io::Result<()>) -> RelayEnd {
    match res {
        Ok(()) => RelayEnd::Eof(dir),
        Err(err) => RelayEnd::Failed(dir, err),
    }
}

async fn copy_one_way<R, W>(
    rd: &mut R,
    wr: &mut W,
    buffer_size: usize,
    copied: &AtomicU64,
    activity: &Activity,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Last-activity clock shared by both directions.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Resolves once nothing has moved for `timeout`.
    async fn idle(&self, timeout: Duration) {
        loop {
            let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = self.start + last + timeout;
            if Instant::now() >= deadline {
                return;
            }
            time::sleep_until(deadline).await;
        }
    }
}
