//! Single-task readiness loop that owns every socket.
//!
//! One task holds the stream listener, every accepted stream, the datagram
//! socket and the router. Each iteration waits for one readiness event, then
//! services it with non-blocking calls only, so a peer that trickles bytes or
//! stops reading never stalls anyone else.

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures::future::{self, BoxFuture, FutureExt};
use tokio::{
    io::{Interest, Ready},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    time::{Interval, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    codec::Codec,
    config::RelayConfig,
    delivery::Outbox,
    framing::{Feed, FrameBuffer},
    message::Envelope,
    registry::{ConnectionId, Endpoint},
    router::{Action, Rejection, Routed, Router},
};

/// Largest datagram the relay will read; also the stream read chunk size.
const MAX_DATAGRAM: usize = 65_535;

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            inbound: FrameBuffer::new(),
            outbound: Vec::new(),
        }
    }

    fn interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Appends a frame behind anything already queued and writes what the
    /// socket takes right now.
    fn queue(&mut self, frame: &[u8], limit: usize) -> io::Result<()> {
        if self.outbound.len() + frame.len() > limit {
            return Err(io::Error::other("outbound backlog limit exceeded"));
        }
        self.outbound.extend_from_slice(frame);
        self.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

/// Sends through the relay's own sockets without ever blocking.
struct SocketOutbox<'a> {
    connections: &'a mut HashMap<ConnectionId, Connection>,
    datagram: &'a UdpSocket,
    outbound_limit: usize,
}

impl Outbox for SocketOutbox<'_> {
    fn send_stream(&mut self, conn: ConnectionId, frame: &[u8]) -> io::Result<()> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        connection.queue(frame, self.outbound_limit)
    }

    fn send_datagram(&mut self, peer: SocketAddr, payload: &[u8]) -> io::Result<()> {
        let sent = self.datagram.try_send_to(payload, peer)?;
        if sent < payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated on send",
            ));
        }
        Ok(())
    }
}

enum Readiness {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Datagram(io::Result<()>),
    Stream(ConnectionId, io::Result<Ready>),
    Tick,
}

pub struct Relay {
    listener: TcpListener,
    datagram: UdpSocket,
    router: Router,
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
    scratch: Box<[u8]>,
    housekeeping: Interval,
    outbound_limit: usize,
    datagram_idle_timeout: Option<Duration>,
    datagram_seen: HashMap<SocketAddr, Instant>,
}

impl Relay {
    /// Binds the stream listener, then the datagram socket on the same port.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind stream listener on {}", config.listen))?;
        let addr = listener.local_addr()?;
        let datagram = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind datagram socket on {addr}"))?;

        // Fixed schedule, independent of how busy the sockets are.
        let mut housekeeping = interval(config.poll_interval.max(Duration::from_millis(1)));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            listener,
            datagram,
            router: Router::new(Codec::new(&config.secret)),
            connections: HashMap::new(),
            next_id: 1,
            scratch: vec![0; MAX_DATAGRAM].into_boxed_slice(),
            housekeeping,
            outbound_limit: config.outbound_limit,
            datagram_idle_timeout: config.datagram_idle_timeout,
            datagram_seen: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn datagram_addr(&self) -> io::Result<SocketAddr> {
        self.datagram.local_addr()
    }

    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            let readiness = select! {
                _ = &mut shutdown => {
                    info!(connections = self.connections.len(), "relay shutting down");
                    break;
                }
                readiness = self.next_readiness() => readiness,
            };
            self.handle(readiness);
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    async fn next_readiness(&mut self) -> Readiness {
        select! {
            accepted = self.listener.accept() => Readiness::Accepted(accepted),
            ready = self.datagram.readable() => Readiness::Datagram(ready),
            (id, ready) = stream_readiness(&self.connections) => Readiness::Stream(id, ready),
            _ = self.housekeeping.tick() => Readiness::Tick,
        }
    }

    fn handle(&mut self, readiness: Readiness) {
        match readiness {
            Readiness::Accepted(Ok((stream, peer))) => self.accept(stream, peer),
            Readiness::Accepted(Err(error)) => warn!(?error, "failed to accept connection"),
            Readiness::Datagram(Ok(())) => self.receive_datagram(),
            Readiness::Datagram(Err(error)) => warn!(?error, "datagram socket not readable"),
            Readiness::Stream(id, Ok(ready)) => self.service_stream(id, ready),
            Readiness::Stream(id, Err(error)) => {
                warn!(%id, ?error, "stream readiness failed");
                self.teardown(vec![id]);
            }
            Readiness::Tick => self.evict_idle_datagram_peers(),
        }
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%id, ?error, "could not disable nagle");
        }
        info!(%id, %peer, "accepted stream connection");
        self.connections.insert(id, Connection::new(stream, peer));
    }

    fn receive_datagram(&mut self) {
        let (len, peer) = match self.datagram.try_recv_from(&mut self.scratch) {
            Ok(received) => received,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) => {
                warn!(?error, "datagram receive failed");
                return;
            }
        };

        let envelope = match self.router.codec().decode(&self.scratch[..len]) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(%peer, %error, "discarding malformed datagram");
                return;
            }
        };

        let endpoint = Endpoint::Datagram(peer);
        let action = self.route(endpoint, envelope);
        if self.datagram_idle_timeout.is_none() {
            return;
        }
        match action {
            Some(Action::Rejected(Rejection::InvalidSignature)) | None => {}
            Some(_) if self.router.registry().identity_of(&endpoint).is_some() => {
                self.datagram_seen.insert(peer, Instant::now());
            }
            Some(_) => {
                self.datagram_seen.remove(&peer);
            }
        }
    }

    fn service_stream(&mut self, id: ConnectionId, ready: Ready) {
        if ready.is_writable() {
            let flushed = match self.connections.get_mut(&id) {
                Some(conn) => conn.flush(),
                None => return,
            };
            if let Err(error) = flushed {
                warn!(%id, ?error, "stream write failed");
                self.teardown(vec![id]);
                return;
            }
        }
        if ready.is_readable() {
            self.read_stream(id);
        }
    }

    fn read_stream(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let feed = match conn.stream.try_read(&mut self.scratch) {
            Ok(read) => conn.inbound.feed(self.router.codec(), &self.scratch[..read]),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
            Err(error) => {
                warn!(%id, ?error, "stream read failed");
                self.teardown(vec![id]);
                return;
            }
        };

        match feed {
            Feed::Pending => {}
            Feed::Closed => {
                info!(%id, "stream closed by peer");
                self.teardown(vec![id]);
            }
            Feed::Envelopes(envelopes) => {
                self.route_stream(id, envelopes);
            }
            Feed::Corrupt { envelopes, error } => {
                // Frames that arrived ahead of the fault are still honoured.
                if self.route_stream(id, envelopes) {
                    warn!(%id, %error, "protocol error; closing stream");
                    self.teardown(vec![id]);
                }
            }
        }
    }

    /// Routes envelopes from one stream in order. Returns whether the
    /// connection is still open afterwards.
    fn route_stream(&mut self, id: ConnectionId, envelopes: Vec<Envelope>) -> bool {
        for envelope in envelopes {
            let action = self.route(Endpoint::Stream(id), envelope);
            if matches!(action, Some(Action::Left { .. })) {
                // Closed is terminal; anything after the leave is discarded.
                self.teardown(vec![id]);
                return false;
            }
            if !self.connections.contains_key(&id) {
                return false;
            }
        }
        self.connections.contains_key(&id)
    }

    fn route(&mut self, from: Endpoint, envelope: Envelope) -> Option<Action> {
        let mut outbox = SocketOutbox {
            connections: &mut self.connections,
            datagram: &self.datagram,
            outbound_limit: self.outbound_limit,
        };
        match self.router.route(from, envelope, &mut outbox) {
            Ok(Routed { action, teardown }) => {
                self.teardown(teardown);
                Some(action)
            }
            Err(error) => {
                warn!(%from, %error, "failed to route envelope");
                None
            }
        }
    }

    /// Closes each connection, drops its identity and announces the
    /// departure. Announcements that fail on further streams queue those too.
    fn teardown(&mut self, mut pending: Vec<ConnectionId>) {
        while let Some(id) = pending.pop() {
            let Some(conn) = self.connections.remove(&id) else {
                continue;
            };
            info!(%id, peer = %conn.peer, "closing stream connection");
            drop(conn);

            let mut outbox = SocketOutbox {
                connections: &mut self.connections,
                datagram: &self.datagram,
                outbound_limit: self.outbound_limit,
            };
            match self.router.disconnect(Endpoint::Stream(id), &mut outbox) {
                Ok(routed) => pending.extend(routed.teardown),
                Err(error) => warn!(%id, %error, "failed to announce departure"),
            }
        }
    }

    fn evict_idle_datagram_peers(&mut self) {
        let Some(timeout) = self.datagram_idle_timeout else {
            return;
        };
        let now = Instant::now();
        let idle: Vec<SocketAddr> = self
            .datagram_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > timeout)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in idle {
            self.datagram_seen.remove(&peer);
            info!(%peer, "evicting idle datagram peer");
            let mut outbox = SocketOutbox {
                connections: &mut self.connections,
                datagram: &self.datagram,
                outbound_limit: self.outbound_limit,
            };
            match self.router.disconnect(Endpoint::Datagram(peer), &mut outbox) {
                Ok(routed) => self.teardown(routed.teardown),
                Err(error) => warn!(%peer, %error, "failed to announce eviction"),
            }
        }
    }
}

/// Resolves when any stream is ready for the I/O its state calls for.
fn stream_readiness(
    connections: &HashMap<ConnectionId, Connection>,
) -> BoxFuture<'_, (ConnectionId, io::Result<Ready>)> {
    if connections.is_empty() {
        return future::pending().boxed();
    }
    let waiting = connections.iter().map(|(&id, conn)| {
        let interest = conn.interest();
        async move { (id, conn.stream.ready(interest).await) }.boxed()
    });
    future::select_all(waiting)
        .map(|(ready, _, _)| ready)
        .boxed()
}
