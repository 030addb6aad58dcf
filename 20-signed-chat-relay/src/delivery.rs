//! Fan-out and directed delivery across both transports.
//!
//! Every outgoing envelope is signed and encoded once, before the first
//! send. Stream send failures are collected so the dispatcher can tear
//! those connections down after routing; datagram failures are dropped.

use std::{io, net::SocketAddr};

use tracing::debug;

use crate::{
    codec::{self, Codec},
    error::{CodecError, DeliveryError},
    message::Envelope,
    registry::{ConnectionId, Endpoint, Registry},
};

/// Non-blocking sink for encoded bytes, implemented by the dispatcher over
/// real sockets and by recorders in tests.
pub trait Outbox {
    /// Queues one complete length-prefixed frame on a stream connection.
    fn send_stream(&mut self, conn: ConnectionId, frame: &[u8]) -> io::Result<()>;

    /// Sends one datagram payload. Best effort.
    fn send_datagram(&mut self, peer: SocketAddr, payload: &[u8]) -> io::Result<()>;
}

/// Both wire encodings of one signed envelope, built before any send so an
/// envelope that cannot be framed reaches nobody.
struct Sealed {
    frame: Vec<u8>,
    datagram: Vec<u8>,
}

impl Sealed {
    fn new(codec: &Codec, envelope: &Envelope) -> Result<Self, CodecError> {
        let datagram = codec.encode(&codec.sign(envelope)?)?;
        Ok(Self {
            frame: codec::frame(&datagram)?,
            datagram,
        })
    }
}

/// One routing pass worth of sends.
pub struct Delivery<'a, O: Outbox> {
    codec: &'a Codec,
    outbox: &'a mut O,
    failed: Vec<ConnectionId>,
}

impl<'a, O: Outbox> Delivery<'a, O> {
    pub fn new(codec: &'a Codec, outbox: &'a mut O) -> Self {
        Self {
            codec,
            outbox,
            failed: Vec::new(),
        }
    }

    /// Sends `envelope` to every registered identity except `exclude`.
    /// Returns how many recipients were attempted.
    pub fn broadcast(
        &mut self,
        registry: &Registry,
        envelope: &Envelope,
        exclude: Option<Endpoint>,
    ) -> Result<usize, CodecError> {
        let sealed = Sealed::new(self.codec, envelope)?;
        let mut attempted = 0;
        for (_, endpoint) in registry.members() {
            if Some(endpoint) == exclude {
                continue;
            }
            self.deliver(&sealed, endpoint);
            attempted += 1;
        }
        Ok(attempted)
    }

    /// Sends `envelope` to the endpoint registered under `name`.
    pub fn unicast(
        &mut self,
        registry: &Registry,
        name: &str,
        envelope: &Envelope,
    ) -> Result<(), DeliveryError> {
        let endpoint = registry
            .resolve(name)
            .ok_or_else(|| DeliveryError::UnknownRecipient(name.to_string()))?;
        self.send_to(endpoint, envelope)?;
        Ok(())
    }

    /// Sends `envelope` straight to an endpoint, joined or not.
    pub fn send_to(&mut self, endpoint: Endpoint, envelope: &Envelope) -> Result<(), CodecError> {
        let sealed = Sealed::new(self.codec, envelope)?;
        self.deliver(&sealed, endpoint);
        Ok(())
    }

    /// Stream connections whose sends failed during this pass.
    pub fn into_failures(self) -> Vec<ConnectionId> {
        self.failed
    }

    fn deliver(&mut self, sealed: &Sealed, endpoint: Endpoint) {
        match endpoint {
            Endpoint::Stream(conn) => {
                if self.failed.contains(&conn) {
                    return;
                }
                if let Err(error) = self.outbox.send_stream(conn, &sealed.frame) {
                    debug!(%conn, ?error, "stream send failed; scheduling teardown");
                    self.failed.push(conn);
                }
            }
            Endpoint::Datagram(peer) => {
                if let Err(error) = self.outbox.send_datagram(peer, &sealed.datagram) {
                    debug!(%peer, ?error, "dropping undeliverable datagram");
                }
            }
        }
    }
}
