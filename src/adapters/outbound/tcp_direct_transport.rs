//! TCP Direct Transport
//!
//! Point-to-point channels over TCP. Every frame is a 4-byte big-endian
//! length followed by a JSON envelope. The dialing side opens with a
//! `hello` frame naming itself; after that both directions are symmetric.

use crate::domain::entities::{PeerId, PeerInfo};
use crate::domain::ports::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelKind, Inbound, InboundSink, Transport, TransportChannel,
    TransportError,
};
use crate::domain::value_objects::{ChannelId, Envelope};
use crate::infrastructure::ShutdownController;
use crate::replication::types::{decode_frame, decode_length, encode_frame, Message, MAX_FRAME_LEN};
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Time allowed for the dial and for the `hello` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum WriterCommand {
    Frame(Bytes),
    Shutdown,
}

/// One TCP connection to a peer.
pub struct DirectChannel {
    id: ChannelId,
    peer: PeerId,
    open: AtomicBool,
    closed: AtomicBool,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl DirectChannel {
    fn new(peer: PeerId, open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<WriterCommand>) {
        let (writer, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: ChannelId::next(),
            peer,
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            writer,
        });
        (channel, rx)
    }

    fn mark_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn event(&self, kind: ChannelEventKind) -> Inbound {
        Inbound::Channel(ChannelEvent::new(self.peer.clone(), self.id, kind))
    }
}

impl TransportChannel for DirectChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.peer.clone()));
        }
        let frame = encode_frame(envelope).map_err(|e| ChannelError::Io(e.to_string()))?;
        if self.writer.send(WriterCommand::Frame(frame)).is_err() {
            self.mark_closed();
            return Err(ChannelError::Closed(self.peer.clone()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.writer.send(WriterCommand::Shutdown);
    }
}

/// Listens for direct connections and dials peers whose address is known.
pub struct TcpDirectTransport {
    local: PeerId,
    local_addr: SocketAddr,
    addresses: DashMap<PeerId, SocketAddr>,
    shutdown: ShutdownController,
    runtime: Handle,
}

impl TcpDirectTransport {
    /// Bind the listener and start accepting connections.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn bind(
        addr: SocketAddr,
        local: PeerId,
        sink: InboundSink,
        shutdown: ShutdownController,
    ) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("direct transport listening on {}", local_addr);

        let transport = Arc::new(Self {
            local,
            local_addr,
            addresses: DashMap::new(),
            shutdown: shutdown.clone(),
            runtime: Handle::current(),
        });

        tokio::spawn(Self::accept_loop(listener, sink, shutdown));
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remember where `peer` listens.
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.addresses.insert(peer, addr);
    }

    pub fn known_peers(&self) -> usize {
        self.addresses.len()
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn accept_loop(listener: TcpListener, sink: InboundSink, shutdown: ShutdownController) {
        let mut stop = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("direct transport stopped accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let sink = sink.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_incoming(stream, sink, shutdown).await {
                                tracing::warn!("rejected direct connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("failed to accept direct connection: {:?}", e),
                },
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn handle_incoming(stream: TcpStream, sink: InboundSink, shutdown: ShutdownController) -> io::Result<()> {
        let (mut reader, writer) = stream.into_split();

        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no hello"))??
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "closed before hello"))?;

        let peer = match Message::decode(hello) {
            Ok(Message::Hello(peer)) => peer,
            Ok(other) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected hello, got {}", other.kind()),
                ))
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        };

        tracing::debug!("direct connection from {}", peer);
        let (channel, commands) = DirectChannel::new(peer, true);
        if sink.send(Inbound::Incoming(channel.clone())).is_err() {
            return Ok(());
        }
        run_channel(channel, reader, writer, commands, sink, shutdown).await;
        Ok(())
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn dial(
        channel: Arc<DirectChannel>,
        local: PeerId,
        addr: SocketAddr,
        commands: mpsc::UnboundedReceiver<WriterCommand>,
        sink: InboundSink,
        shutdown: ShutdownController,
    ) {
        let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut stream = TcpStream::connect(addr).await?;
            let hello = encode_frame(&Message::Hello(local).into_envelope())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            stream.write_all(&hello).await?;
            Ok::<_, io::Error>(stream)
        })
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")));

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to dial {} at {}: {}", channel.peer, addr, e);
                channel.mark_closed();
                let _ = sink.send(channel.event(ChannelEventKind::Error(e.to_string())));
                return;
            }
        };

        if !channel.mark_open() {
            return;
        }
        if sink.send(channel.event(ChannelEventKind::Opened)).is_err() {
            return;
        }
        let (reader, writer) = stream.into_split();
        run_channel(channel, reader, writer, commands, sink, shutdown).await;
    }
}

impl Transport for TcpDirectTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    fn can_reach(&self, peer: &PeerId) -> bool {
        self.addresses.contains_key(peer)
    }

    fn learn(&self, peer: &PeerInfo) {
        if let Some(addr) = peer.addr {
            self.addresses.insert(peer.id.clone(), addr);
        }
    }

    fn connect(
        &self,
        local: &PeerId,
        remote: &PeerId,
        sink: InboundSink,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let addr = self
            .addresses
            .get(remote)
            .map(|a| *a.value())
            .ok_or_else(|| TransportError::PeerUnavailable(remote.clone()))?;

        let (channel, commands) = DirectChannel::new(remote.clone(), false);
        self.runtime.spawn(Self::dial(
            channel.clone(),
            local.clone(),
            addr,
            commands,
            sink,
            self.shutdown.clone(),
        ));
        Ok(channel)
    }
}

impl std::fmt::Debug for TcpDirectTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDirectTransport")
            .field("local", &self.local)
            .field("local_addr", &self.local_addr)
            .field("known_peers", &self.addresses.len())
            .finish()
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Envelope>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = decode_length(&len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_frame(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Pump frames in both directions until either side stops.
#[cfg_attr(coverage_nightly, coverage(off))]
async fn run_channel(
    channel: Arc<DirectChannel>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    sink: InboundSink,
    shutdown: ShutdownController,
) {
    let _guard = shutdown.channel_guard();
    let mut stop = shutdown.subscribe();

    let read = async {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(envelope)) => {
                    if sink.send(channel.event(ChannelEventKind::Data(envelope))).is_err() {
                        return None;
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some(e.to_string()),
            }
        }
    };

    let write = async {
        while let Some(command) = commands.recv().await {
            match command {
                WriterCommand::Frame(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        return Some(e.to_string());
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
        let _ = writer.shutdown().await;
        None
    };

    let failure = tokio::select! {
        failure = read => failure,
        failure = write => failure,
        _ = stop.recv() => None,
    };

    channel.mark_closed();
    if let Some(reason) = failure {
        tracing::debug!("direct channel to {} failed: {}", channel.peer, reason);
        let _ = sink.send(channel.event(ChannelEventKind::Error(reason)));
    }
    let _ = sink.send(channel.event(ChannelEventKind::Closed));
}
