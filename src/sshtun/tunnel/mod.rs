//! Tunnel drivers and the per-connection sessions they spawn.
//!
//! Fatal conditions end a driver and come back as a [`DriverError`]. Anything
//! that goes wrong inside one session is logged and stays in that session.

pub mod forward;
pub mod reverse;
pub mod session;
pub mod transport;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept on {addr}")]
    Accept {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {server}: {reason}")]
    Connect { server: String, reason: String },
    #[error("remote listen on {remote} via {server}: {reason}")]
    RemoteListen {
        remote: String,
        server: String,
        reason: String,
    },
    #[error("remote accept via {server}: {reason}")]
    RemoteAccept { server: String, reason: String },
}
