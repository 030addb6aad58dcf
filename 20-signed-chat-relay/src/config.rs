use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use crate::error::ConfigError;

/// Well-known port shared by the stream and datagram transports.
pub const DEFAULT_PORT: u16 = 12000;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Unsent bytes a stream connection may accumulate before it is dropped.
pub const DEFAULT_OUTBOUND_LIMIT: usize = 4 * 1024 * 1024;

pub fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))
}

/// Key for the envelope MAC. Always provisioned externally; there is no
/// built-in default.
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: Vec<u8>) -> Result<Self, ConfigError> {
        if bytes.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        Ok(Self(bytes))
    }

    /// Picks the inline value if given, otherwise reads `file`.
    ///
    /// A single trailing newline is stripped from file contents so keys
    /// written with `echo` match keys passed inline.
    pub fn resolve(inline: Option<&str>, file: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(value) = inline {
            return Self::new(value.as_bytes().to_vec());
        }
        let Some(path) = file else {
            return Err(ConfigError::MissingSecret);
        };
        let mut bytes = std::fs::read(path).map_err(|source| ConfigError::ReadSecret {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        Self::new(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([{} bytes])", self.0.len())
    }
}

/// Everything the relay needs to start. Built once, then moved into the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address for both the stream listener and the datagram socket.
    pub listen: SocketAddr,
    pub secret: SharedSecret,
    /// Upper bound on how long the event loop waits for readiness.
    pub poll_interval: Duration,
    /// Per-connection cap on queued outgoing bytes; exceeding it closes the
    /// connection.
    pub outbound_limit: usize,
    /// Datagram identities silent for longer than this are deregistered.
    /// `None` keeps them until an explicit `leave`.
    pub datagram_idle_timeout: Option<Duration>,
}

impl RelayConfig {
    pub fn new(listen: SocketAddr, secret: SharedSecret) -> Self {
        Self {
            listen,
            secret,
            poll_interval: DEFAULT_POLL_INTERVAL,
            outbound_limit: DEFAULT_OUTBOUND_LIMIT,
            datagram_idle_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_and_missing_secrets_are_rejected() {
        assert!(matches!(
            SharedSecret::new(Vec::new()),
            Err(ConfigError::EmptySecret)
        ));
        assert!(matches!(
            SharedSecret::resolve(None, None),
            Err(ConfigError::MissingSecret)
        ));
        assert!(matches!(
            SharedSecret::resolve(Some(""), None),
            Err(ConfigError::EmptySecret)
        ));
    }

    #[test]
    fn inline_secret_wins_over_file() {
        let secret = SharedSecret::resolve(Some("inline"), Some(Path::new("/does/not/exist")))
            .expect("inline secret");
        assert_eq!(secret.expose(), b"inline");
    }

    #[test]
    fn secret_file_drops_one_trailing_newline() {
        let path = std::env::temp_dir().join(format!("relay-secret-{}", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).expect("create");
            file.write_all(b"from-file\n").expect("write");
        }
        let secret = SharedSecret::resolve(None, Some(path.as_path())).expect("file secret");
        assert_eq!(secret.expose(), b"from-file");
        let _ = std::fs::remove_file(&path);

        assert!(matches!(
            SharedSecret::resolve(None, Some(path.as_path())),
            Err(ConfigError::ReadSecret { .. })
        ));
    }

    #[test]
    fn debug_output_hides_the_key() {
        let secret = SharedSecret::new(b"hunter2".to_vec()).expect("secret");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(rendered, "SharedSecret([7 bytes])");
    }

    #[test]
    fn defaults_bind_all_interfaces_on_the_well_known_port() {
        let config = RelayConfig::new(
            default_listen_addr(),
            SharedSecret::new(b"k".to_vec()).expect("secret"),
        );
        assert_eq!(config.listen.to_string(), "0.0.0.0:12000");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.outbound_limit, 4 * 1024 * 1024);
        assert!(config.datagram_idle_timeout.is_none());
    }
}
