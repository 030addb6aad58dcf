use std::net::SocketAddr;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream, UdpSocket,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::{ClientArgs, Transport},
    codec::Codec,
    framing::{Feed, FrameBuffer},
    message::{Body, Envelope},
};

const USAGE_WHISPER: &str = "usage: /whisper <name> <message>";

/// One line of terminal input, interpreted.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Skip,
    Quit,
    List,
    Whisper { to: String, text: String },
    Chat(String),
    Usage(&'static str),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Input::Skip;
    }
    if line == "/quit" {
        return Input::Quit;
    }
    if line.starts_with("/list") {
        return Input::List;
    }
    if line == "/whisper" {
        return Input::Usage(USAGE_WHISPER);
    }
    if let Some(rest) = line.strip_prefix("/whisper ") {
        let Some((to, text)) = rest.trim_start().split_once(char::is_whitespace) else {
            return Input::Usage(USAGE_WHISPER);
        };
        let text = text.trim_start();
        if text.is_empty() {
            return Input::Usage(USAGE_WHISPER);
        }
        return Input::Whisper {
            to: to.to_string(),
            text: text.to_string(),
        };
    }
    Input::Chat(line.to_string())
}

impl Input {
    fn into_envelope(self) -> Option<Envelope> {
        match self {
            Input::List => Some(Envelope::list_request()),
            Input::Whisper { to, text } => Some(Envelope::whisper_request(to, text)),
            Input::Chat(text) => Some(Envelope::chat(text)),
            Input::Skip | Input::Quit | Input::Usage(_) => None,
        }
    }
}

/// Terminal rendering of a relay envelope, or `None` for shapes a client
/// never displays.
pub fn render(envelope: &Envelope) -> Option<String> {
    let line = match &envelope.body {
        Body::Msg { name, text } => format!("{}: {text}", name.as_deref().unwrap_or("?")),
        Body::Sys { text } => format!("* {text}"),
        Body::List { users } => format!("* Users: {}", users.join(", ")),
        Body::Whisper { from, text } => format!("(whisper from {from}): {text}"),
        Body::Err { text } => format!("! {text}"),
        Body::Join { .. } | Body::Leave | Body::Cmd(_) => return None,
    };
    Some(format!("[{}] {line}", clock(envelope.ts)))
}

fn clock(ts: Option<u64>) -> String {
    let stamp = ts
        .and_then(|ms| i64::try_from(ms).ok())
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Local::now);
    stamp.format("%H:%M:%S").to_string()
}

enum Link {
    Stream {
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        frames: FrameBuffer,
        chunk: Box<[u8]>,
    },
    Datagram {
        socket: UdpSocket,
        buffer: Box<[u8]>,
    },
}

enum Incoming {
    Envelopes(Vec<Envelope>),
    Closed,
    /// Last envelopes before the stream became unreadable.
    Corrupt(Vec<Envelope>),
}

impl Link {
    async fn connect(server: SocketAddr, transport: Transport) -> Result<Self> {
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(server)
                    .await
                    .with_context(|| format!("failed to connect to {server}"))?;
                let (reader, writer) = stream.into_split();
                Ok(Link::Stream {
                    reader,
                    writer,
                    frames: FrameBuffer::new(),
                    chunk: vec![0; 8192].into_boxed_slice(),
                })
            }
            Transport::Udp => {
                let local: SocketAddr = if server.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket
                    .connect(server)
                    .await
                    .with_context(|| format!("failed to address {server}"))?;
                Ok(Link::Datagram {
                    socket,
                    buffer: vec![0; 65535].into_boxed_slice(),
                })
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Link::Stream { .. } => "TCP",
            Link::Datagram { .. } => "UDP",
        }
    }

    async fn send(&mut self, codec: &Codec, envelope: &Envelope) -> Result<()> {
        match self {
            Link::Stream { writer, .. } => {
                writer.write_all(&codec.seal_frame(envelope)?).await?;
            }
            Link::Datagram { socket, .. } => {
                socket.send(&codec.seal_datagram(envelope)?).await?;
            }
        }
        Ok(())
    }

    async fn recv(&mut self, codec: &Codec) -> Result<Incoming> {
        match self {
            Link::Stream {
                reader,
                frames,
                chunk,
                ..
            } => {
                let read = reader.read(chunk).await?;
                match frames.feed(codec, &chunk[..read]) {
                    Feed::Closed => Ok(Incoming::Closed),
                    Feed::Pending => Ok(Incoming::Envelopes(Vec::new())),
                    Feed::Envelopes(envelopes) => Ok(Incoming::Envelopes(envelopes)),
                    Feed::Corrupt { envelopes, error } => {
                        warn!(%error, "relay stream is unreadable");
                        Ok(Incoming::Corrupt(envelopes))
                    }
                }
            }
            Link::Datagram { socket, buffer } => {
                let read = socket.recv(buffer).await?;
                match codec.decode(&buffer[..read]) {
                    Ok(envelope) => Ok(Incoming::Envelopes(vec![envelope])),
                    Err(error) => {
                        debug!(%error, "ignoring malformed datagram");
                        Ok(Incoming::Envelopes(Vec::new()))
                    }
                }
            }
        }
    }

    async fn close(self) {
        if let Link::Stream { mut writer, .. } = self {
            if let Err(error) = writer.shutdown().await {
                warn!(?error, "failed to shutdown client writer cleanly");
            }
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let codec = Codec::new(&args.secret.load()?);
    let mut link = Link::connect(args.server, args.transport).await?;
    info!(server = %args.server, transport = link.label(), "connected");

    link.send(&codec, &Envelope::join(args.name.as_str())).await?;
    write_stdout(&format!(
        "Connected ({}). Commands: /list, /whisper <name> <msg>, /quit",
        link.label()
    ))
    .await?;

    let mut lines = BufReader::new(io::stdin()).lines();
    let outcome = run_client_loop(&codec, &mut link, &mut lines).await;

    if matches!(outcome, Ok(Exit::Quit)) {
        if let Err(error) = link.send(&codec, &Envelope::leave()).await {
            debug!(?error, "could not send leave");
        }
    }
    link.close().await;
    outcome.map(|_| ())
}

enum Exit {
    Quit,
    Disconnected,
}

async fn run_client_loop(
    codec: &Codec,
    link: &mut Link,
    lines: &mut io::Lines<BufReader<io::Stdin>>,
) -> Result<Exit> {
    loop {
        select! {
            incoming = link.recv(codec) => {
                match incoming? {
                    Incoming::Closed => {
                        write_stdout("** disconnected **").await?;
                        return Ok(Exit::Disconnected);
                    }
                    Incoming::Envelopes(envelopes) => show(codec, &envelopes).await?,
                    Incoming::Corrupt(envelopes) => {
                        show(codec, &envelopes).await?;
                        write_stdout("** disconnected **").await?;
                        return Ok(Exit::Disconnected);
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(Exit::Quit);
                };
                match parse_input(&line) {
                    Input::Quit => return Ok(Exit::Quit),
                    Input::Usage(usage) => write_stdout(usage).await?,
                    input => {
                        if let Some(envelope) = input.into_envelope() {
                            link.send(codec, &envelope).await?;
                        }
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(Exit::Quit);
            }
        }
    }
}

async fn show(codec: &Codec, envelopes: &[Envelope]) -> io::Result<()> {
    for envelope in envelopes {
        if !codec.verify(envelope) {
            debug!(kind = envelope.kind(), "dropping envelope with bad tag");
            continue;
        }
        if let Some(line) = render(envelope) {
            write_stdout(&line).await?;
        }
    }
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
