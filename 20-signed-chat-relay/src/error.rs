//! Error types shared by the codec, delivery and configuration layers.
//!
//! Protocol outcomes that are answered on the wire (bad signature, name
//! conflicts) are not errors here; the router reports them as actions.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Malformed bytes or structure. Fatal to a stream connection, drops a
/// single datagram.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The named identity is not registered on either transport.
    #[error("no identity named '{0}'")]
    UnknownRecipient(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no shared secret configured; pass --secret, --secret-file or set CHAT_RELAY_SECRET")]
    MissingSecret,

    #[error("shared secret must not be empty")]
    EmptySecret,

    #[error("failed to read secret file {path}")]
    ReadSecret {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
