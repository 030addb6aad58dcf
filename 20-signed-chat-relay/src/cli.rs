use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    config::{DEFAULT_OUTBOUND_LIMIT, DEFAULT_POLL_INTERVAL, RelayConfig, SharedSecret},
    error::ConfigError,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, serving stream and datagram clients on one port.
    Relay(RelayArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

/// Where the shared MAC key comes from. One of the two is required.
#[derive(Args, Debug, Clone)]
pub struct SecretArgs {
    /// Shared authentication key.
    #[arg(long, env = "CHAT_RELAY_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// File holding the shared authentication key.
    #[arg(long, conflicts_with = "secret")]
    pub secret_file: Option<PathBuf>,
}

impl SecretArgs {
    pub fn load(&self) -> Result<SharedSecret, ConfigError> {
        SharedSecret::resolve(self.secret.as_deref(), self.secret_file.as_deref())
    }
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address for both transports. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:12000")]
    pub listen: SocketAddr,

    /// Longest the event loop sleeps before running housekeeping.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    pub poll_interval_ms: u64,

    /// Queued outgoing bytes a stream client may fall behind by before it is dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_LIMIT)]
    pub outbound_limit_bytes: usize,

    /// Forget datagram clients that stay silent this long. Off when unset.
    #[arg(long)]
    pub datagram_idle_secs: Option<u64>,

    #[command(flatten)]
    pub secret: SecretArgs,
}

impl RelayArgs {
    pub fn config(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = RelayConfig::new(self.listen, self.secret.load()?);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms.max(1));
        config.outbound_limit = self.outbound_limit_bytes;
        config.datagram_idle_timeout = self.datagram_idle_secs.map(Duration::from_secs);
        Ok(config)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name to register with the relay.
    #[arg(long)]
    pub name: String,

    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:12000")]
    pub server: SocketAddr,

    #[arg(long, value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,

    #[command(flatten)]
    pub secret: SecretArgs,
}
