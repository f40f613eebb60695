use std::fmt;

/// A `host:port` pair.
///
/// Port `0` means "unset" while a configuration is being assembled; a validated
/// tunnel configuration never carries it. The `Display` rendering is the only
/// serialization and is used unchanged for dialing and listening.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Both a host and a non-zero port are present.
    pub fn is_set(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
