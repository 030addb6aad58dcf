use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use signed_chat_relay::{
    codec::{self, Codec},
    config::{RelayConfig, SharedSecret},
    dispatcher::Relay,
    framing::{Feed, FrameBuffer},
    message::{Body, Envelope},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream, UdpSocket},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct RunningRelay {
    addr: SocketAddr,
    codec: Codec,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl RunningRelay {
    async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tune: impl FnOnce(&mut RelayConfig)) -> Result<Self> {
        let secret = SharedSecret::new(b"integration-secret".to_vec())?;
        let mut config = RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)), secret.clone());
        config.poll_interval = Duration::from_millis(50);
        tune(&mut config);

        let relay = Relay::bind(config).await?;
        let addr = relay.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(relay.run_until(async {
            let _ = rx.await;
        }));

        Ok(Self {
            addr,
            codec: Codec::new(&secret),
            shutdown: Some(tx),
            task,
        })
    }

    async fn stream_peer(&self) -> Result<StreamPeer> {
        let stream = TcpStream::connect(self.addr).await?;
        Ok(self.wrap_stream(stream))
    }

    /// A stream peer advertising a tiny receive window, so unread data piles
    /// up in the relay rather than in kernel buffers.
    async fn narrow_stream_peer(&self) -> Result<StreamPeer> {
        let socket = TcpSocket::new_v4()?;
        socket.set_recv_buffer_size(4096)?;
        let stream = socket.connect(self.addr).await?;
        Ok(self.wrap_stream(stream))
    }

    fn wrap_stream(&self, stream: TcpStream) -> StreamPeer {
        StreamPeer {
            codec: self.codec.clone(),
            stream,
            frames: FrameBuffer::new(),
            backlog: VecDeque::new(),
        }
    }

    async fn datagram_peer(&self) -> Result<DatagramPeer> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(self.addr).await?;
        Ok(DatagramPeer {
            codec: self.codec.clone(),
            socket,
        })
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await?
    }
}

struct StreamPeer {
    codec: Codec,
    stream: TcpStream,
    frames: FrameBuffer,
    backlog: VecDeque<Envelope>,
}

impl StreamPeer {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = self.codec.seal_frame(envelope)?;
        self.send_raw(&frame).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope> {
        timeout(RECV_TIMEOUT, self.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for stream envelope"))?
    }

    async fn next(&mut self) -> Result<Envelope> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                return Ok(envelope);
            }
            let read = self.stream.read(&mut chunk).await?;
            match self.frames.feed(&self.codec, &chunk[..read]) {
                Feed::Closed => return Err(anyhow!("relay closed the stream")),
                Feed::Pending => {}
                Feed::Envelopes(envelopes) => self.backlog.extend(envelopes),
                Feed::Corrupt { error, .. } => return Err(error.into()),
            }
        }
    }

    async fn expect_quiet(&mut self) -> Result<()> {
        match timeout(QUIET_PERIOD, self.next()).await {
            Err(_) => Ok(()),
            Ok(received) => Err(anyhow!("expected silence, got {received:?}")),
        }
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match timeout(RECV_TIMEOUT, self.next()).await {
            Ok(Err(_)) => Ok(()),
            Ok(Ok(envelope)) => Err(anyhow!("expected close, got {envelope:?}")),
            Err(_) => Err(anyhow!("relay kept the stream open")),
        }
    }
}

struct DatagramPeer {
    codec: Codec,
    socket: UdpSocket,
}

impl DatagramPeer {
    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.socket
            .send(&self.codec.seal_datagram(envelope)?)
            .await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Envelope> {
        timeout(RECV_TIMEOUT, self.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for datagram"))?
    }

    async fn next(&self) -> Result<Envelope> {
        let mut buffer = vec![0u8; 65535];
        let read = self.socket.recv(&mut buffer).await?;
        Ok(self.codec.decode(&buffer[..read])?)
    }

    async fn expect_quiet(&self) -> Result<()> {
        match timeout(QUIET_PERIOD, self.next()).await {
            Err(_) => Ok(()),
            Ok(received) => Err(anyhow!("expected silence, got {received:?}")),
        }
    }
}

fn assert_signed(codec: &Codec, envelope: &Envelope) {
    assert!(codec.verify(envelope), "unsigned envelope {envelope:?}");
    assert!(envelope.ts.is_some(), "relay envelopes carry a timestamp");
}

fn sys_text(envelope: &Envelope) -> Option<&str> {
    match &envelope.body {
        Body::Sys { text } => Some(text),
        _ => None,
    }
}

fn err_text(envelope: &Envelope) -> Option<&str> {
    match &envelope.body {
        Body::Err { text } => Some(text),
        _ => None,
    }
}

fn chat_text(envelope: &Envelope) -> Option<(&str, &str)> {
    match &envelope.body {
        Body::Msg {
            name: Some(name),
            text,
        } => Some((name, text)),
        _ => None,
    }
}

/// Alice over the stream transport, Bob over datagrams, both joined.
async fn alice_and_bob(relay: &RunningRelay) -> Result<(StreamPeer, DatagramPeer)> {
    let mut alice = relay.stream_peer().await?;
    alice.send(&Envelope::join("alice")).await?;
    let own = alice.recv().await.context("alice join notice")?;
    assert_eq!(sys_text(&own), Some("alice joined"));

    let bob = relay.datagram_peer().await?;
    bob.send(&Envelope::join("bob")).await?;
    let bob_own = bob.recv().await.context("bob join notice")?;
    assert_eq!(sys_text(&bob_own), Some("bob joined"));
    let alice_sees_bob = alice.recv().await.context("alice sees bob")?;
    assert_eq!(sys_text(&alice_sees_bob), Some("bob joined"));
    assert_signed(&relay.codec, &alice_sees_bob);

    Ok((alice, bob))
}

#[tokio::test]
async fn chat_list_and_whisper_cross_transports() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (mut alice, bob) = alice_and_bob(&relay).await?;

    alice.send(&Envelope::chat("hello")).await?;
    let heard = bob.recv().await.context("bob hears alice")?;
    assert_signed(&relay.codec, &heard);
    assert_eq!(
        heard.body,
        Body::Msg {
            name: Some("alice".into()),
            text: "hello".into(),
        }
    );
    alice.expect_quiet().await?;

    bob.send(&Envelope::list_request()).await?;
    let listed = bob.recv().await.context("bob roster")?;
    assert_signed(&relay.codec, &listed);
    assert_eq!(
        listed.body,
        Body::List {
            users: vec!["alice".into(), "bob".into()],
        }
    );

    alice
        .send(&Envelope::whisper_request("carol", "anyone?"))
        .await?;
    let missing = alice.recv().await.context("whisper to carol")?;
    assert_eq!(err_text(&missing), Some("No such user"));
    bob.expect_quiet().await?;

    bob.send(&Envelope::whisper_request("alice", "psst")).await?;
    let whispered = alice.recv().await.context("alice gets whisper")?;
    assert_signed(&relay.codec, &whispered);
    assert_eq!(
        whispered.body,
        Body::Whisper {
            from: "bob".into(),
            text: "psst".into(),
        }
    );

    relay.stop().await
}

#[tokio::test]
async fn tampered_join_is_rejected_and_not_registered() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let mut mallory = relay.stream_peer().await?;

    let mut forged = relay.codec.sign(&Envelope::join("mallory"))?;
    forged.body = Body::Join {
        name: "alice".into(),
    };
    let frame = codec::frame(&relay.codec.encode(&forged)?)?;
    mallory.send_raw(&frame).await?;

    let rejected = mallory.recv().await.context("invalid signature reply")?;
    assert_signed(&relay.codec, &rejected);
    assert_eq!(err_text(&rejected), Some("Invalid signature"));

    let mut alice = relay.stream_peer().await?;
    alice.send(&Envelope::join("alice")).await?;
    let joined = alice.recv().await.context("alice join")?;
    assert_eq!(sys_text(&joined), Some("alice joined"));
    mallory.expect_quiet().await?;

    relay.stop().await
}

#[tokio::test]
async fn traffic_before_join_is_ignored() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (mut alice, _bob) = alice_and_bob(&relay).await?;

    let lurker = relay.datagram_peer().await?;
    lurker.send(&Envelope::chat("anyone here?")).await?;
    lurker.send(&Envelope::list_request()).await?;
    lurker.expect_quiet().await?;
    alice.expect_quiet().await?;

    relay.stop().await
}

#[tokio::test]
async fn names_are_unique_across_transports() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (_alice, bob) = alice_and_bob(&relay).await?;

    let imposter = relay.datagram_peer().await?;
    imposter.send(&Envelope::join("alice")).await?;
    let rejected = imposter.recv().await.context("name taken reply")?;
    assert_eq!(err_text(&rejected), Some("Name already in use"));
    bob.expect_quiet().await?;

    relay.stop().await
}

#[tokio::test]
async fn dropping_a_stream_announces_the_departure() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (alice, bob) = alice_and_bob(&relay).await?;

    drop(alice);
    let left = bob.recv().await.context("bob sees alice leave")?;
    assert_signed(&relay.codec, &left);
    assert_eq!(sys_text(&left), Some("alice left"));

    bob.send(&Envelope::list_request()).await?;
    let listed = bob.recv().await.context("roster after leave")?;
    assert_eq!(
        listed.body,
        Body::List {
            users: vec!["bob".into()],
        }
    );

    relay.stop().await
}

#[tokio::test]
async fn datagram_leave_is_announced_once() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (mut alice, bob) = alice_and_bob(&relay).await?;

    bob.send(&Envelope::leave()).await?;
    let left = alice.recv().await.context("alice sees bob leave")?;
    assert_eq!(sys_text(&left), Some("bob left"));

    bob.send(&Envelope::leave()).await?;
    alice.expect_quiet().await?;

    relay.stop().await
}

#[tokio::test]
async fn stream_leave_closes_the_connection_and_announces_once() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (mut alice, bob) = alice_and_bob(&relay).await?;

    // Anything written after the leave is discarded with the connection.
    let mut bytes = relay.codec.seal_frame(&Envelope::leave())?;
    bytes.extend(relay.codec.seal_frame(&Envelope::chat("still here?"))?);
    alice.send_raw(&bytes).await?;

    let left = bob.recv().await.context("bob sees alice leave")?;
    assert_eq!(sys_text(&left), Some("alice left"));
    alice.expect_closed().await?;
    bob.expect_quiet().await?;

    relay.stop().await
}

#[tokio::test]
async fn frames_ahead_of_garbage_are_still_routed() -> Result<()> {
    let relay = RunningRelay::start().await?;
    let (mut alice, bob) = alice_and_bob(&relay).await?;

    let mut bytes = relay.codec.seal_frame(&Envelope::chat("before the noise"))?;
    bytes.extend(codec::frame(b"{garbage")?);
    alice.send_raw(&bytes).await?;

    let heard = bob.recv().await.context("bob hears alice")?;
    assert_eq!(chat_text(&heard), Some(("alice", "before the noise")));
    let left = bob.recv().await.context("bob sees alice dropped")?;
    assert_eq!(sys_text(&left), Some("alice left"));
    alice.expect_closed().await?;

    relay.stop().await
}

#[tokio::test]
async fn idle_datagram_peers_are_evicted_under_steady_traffic() -> Result<()> {
    let relay = RunningRelay::start_with(|config| {
        config.poll_interval = Duration::from_millis(100);
        config.datagram_idle_timeout = Some(Duration::from_millis(400));
    })
    .await?;

    let mut alice = relay.stream_peer().await?;
    alice.send(&Envelope::join("alice")).await?;
    assert_eq!(sys_text(&alice.recv().await?), Some("alice joined"));

    let idle = relay.datagram_peer().await?;
    idle.send(&Envelope::join("idle")).await?;
    assert_eq!(sys_text(&alice.recv().await?), Some("idle joined"));

    let busy = relay.datagram_peer().await?;
    busy.send(&Envelope::join("busy")).await?;
    assert_eq!(sys_text(&alice.recv().await?), Some("busy joined"));

    // Junk from a stranger keeps the loop permanently busy; the signed list
    // requests keep "busy" alive.
    let noise = UdpSocket::bind("127.0.0.1:0").await?;
    noise.connect(relay.addr).await?;
    let keepalive = relay.codec.seal_datagram(&Envelope::list_request())?;
    let traffic = tokio::spawn(async move {
        for round in 0u32.. {
            let _ = noise.send(b"not json").await;
            if round % 4 == 0 {
                let _ = busy.socket.send(&keepalive).await;
            }
            sleep(Duration::from_millis(25)).await;
        }
    });

    let left = alice.recv().await.context("idle peer evicted")?;
    assert_eq!(sys_text(&left), Some("idle left"));

    alice.send(&Envelope::list_request()).await?;
    let listed = alice.recv().await.context("roster after eviction")?;
    assert_eq!(
        listed.body,
        Body::List {
            users: vec!["alice".into(), "busy".into()],
        }
    );

    traffic.abort();
    relay.stop().await
}

#[tokio::test]
async fn reader_that_falls_too_far_behind_is_dropped() -> Result<()> {
    let relay = RunningRelay::start_with(|config| {
        config.outbound_limit = 256 * 1024;
    })
    .await?;

    let mut sink = relay.narrow_stream_peer().await?;
    sink.send(&Envelope::join("sink")).await?;
    assert_eq!(sys_text(&sink.recv().await?), Some("sink joined"));

    let mut alice = relay.stream_peer().await?;
    alice.send(&Envelope::join("alice")).await?;
    assert_eq!(sys_text(&alice.recv().await?), Some("alice joined"));

    // The sink never reads again; alice's chat piles up in its backlog.
    let text = "y".repeat(64 * 1024);
    for _ in 0..256 {
        alice.send(&Envelope::chat(text.as_str())).await?;
    }

    let left = alice.recv().await.context("sink dropped")?;
    assert_eq!(sys_text(&left), Some("sink left"));

    alice.send(&Envelope::list_request()).await?;
    let listed = alice.recv().await.context("roster after drop")?;
    assert_eq!(
        listed.body,
        Body::List {
            users: vec!["alice".into()],
        }
    );

    relay.stop().await
}
