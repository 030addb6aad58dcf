//! Signed text relay serving stream and datagram clients on one port.
//!
//! Every envelope on the wire is JSON carrying an HMAC tag over its other
//! fields. Stream clients exchange length-prefixed frames, datagram clients
//! send one envelope per packet. A single event loop owns all sockets and
//! the routing state:
//!
//! - [`message`] defines the envelope and its body shapes.
//! - [`codec`] encodes, frames, signs, and verifies envelopes.
//! - [`framing`] reassembles frames from arbitrary stream reads.
//! - [`registry`] maps display names to transport endpoints.
//! - [`router`] applies join, chat, list, whisper, and leave rules.
//! - [`delivery`] fans envelopes out across both transports.
//! - [`dispatcher`] runs the readiness loop over the listener, streams,
//!   and the datagram socket.
//! - [`cli`], [`config`], and [`client`] cover the binary's surface.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod message;
pub mod registry;
pub mod router;
