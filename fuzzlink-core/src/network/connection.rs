use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::error::FuzzlinkError;
use crate::message::{ExecutorMessage, HostMessage, Message};

/// Queue depth between the user handle and the background tasks.
const CHANNEL_CAPACITY: usize = 100;

/// How long `shutdown` lets the writer drain before dropping queued frames.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// The host side of a channel: reads executor messages, writes host ones.
pub type HostConnection = Connection<ExecutorMessage, HostMessage>;

/// The executor side of a channel.
pub type ExecutorConnection = Connection<HostMessage, ExecutorMessage>;

struct Outgoing<Out> {
    message: Out,
    flushed: Option<oneshot::Sender<()>>,
}

/// A framed, bidirectional channel to one peer.
///
/// A reader task decodes frames off the socket and a writer task encodes
/// queued messages onto it. `send` waits only for room in the queue; a
/// [`ConnectionSender`] lets an owner loop wait for that room inside a
/// `select!` instead. The writer keeps submission order.
pub struct Connection<In, Out> {
    tx: mpsc::Sender<Outgoing<Out>>,
    rx: mpsc::Receiver<Result<In, FuzzlinkError>>,
    peer: Option<SocketAddr>,
    reader: AbortOnDropHandle<()>,
    writer: JoinHandle<()>,
}

impl<In: Message, Out: Message> Connection<In, Out> {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_peer(stream, None)
    }

    fn with_peer<S>(stream: S, peer: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut net_writer, mut net_reader) =
            Framed::new(stream, FrameCodec::<In, Out>::new()).split();

        // User -> Network
        let (user_tx, mut network_rx) = mpsc::channel::<Outgoing<Out>>(CHANNEL_CAPACITY);
        // Network -> User
        let (network_tx, user_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(Outgoing { message, flushed }) = network_rx.recv().await {
                trace!(%message, "writing frame");
                if let Err(e) = net_writer.send(message).await {
                    warn!(error = %e, "network write failed");
                    break;
                }
                if let Some(ack) = flushed {
                    let _ = ack.send(());
                }
            }
            let _ = net_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                let fatal = result.is_err();
                if let Err(e) = &result {
                    warn!(error = %e, "network read failed");
                }
                if network_tx.send(result).await.is_err() || fatal {
                    break;
                }
            }
            debug!("reader finished");
        });

        Self {
            tx: user_tx,
            rx: user_rx,
            peer,
            reader: AbortOnDropHandle::new(reader),
            writer,
        }
    }

    /// Queue a message for the writer task.
    pub async fn send(&self, message: Out) -> Result<(), FuzzlinkError> {
        send_to(&self.tx, message, None).await
    }

    /// Send a message and wait until it has been written and flushed.
    pub async fn send_flushed(&self, message: Out) -> Result<(), FuzzlinkError> {
        send_flushed_to(&self.tx, message).await
    }

    /// Next message from the peer. A decode error is returned once; after
    /// that, and after end of stream, the result is `ChannelClosed`.
    pub async fn recv(&mut self) -> Result<In, FuzzlinkError> {
        self.rx.recv().await.unwrap_or(Err(FuzzlinkError::ChannelClosed))
    }

    /// A write handle that can wait for queue room without holding `self`.
    pub fn sender(&self) -> ConnectionSender<Out> {
        ConnectionSender {
            tx: self.tx.clone(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Stop reading, let queued messages drain, then close the socket.
    ///
    /// The writer only finishes once every [`ConnectionSender`] is gone. A
    /// peer that stops reading gets `WRITER_DRAIN` before the writer is
    /// aborted.
    pub async fn shutdown(self) {
        let Self {
            tx,
            reader,
            mut writer,
            ..
        } = self;
        drop(reader);
        drop(tx);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            warn!("peer stopped reading; dropping queued frames");
            writer.abort();
        }
    }
}

impl<In: Message, Out: Message> Connection<In, Out> {
    /// Adopt an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        Self::with_peer(stream, peer)
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, FuzzlinkError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_tcp(stream))
    }
}

impl<In, Out> fmt::Debug for Connection<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Cloneable write half of a [`Connection`].
pub struct ConnectionSender<Out> {
    tx: mpsc::Sender<Outgoing<Out>>,
}

impl<Out> Clone for ConnectionSender<Out> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Out> fmt::Debug for ConnectionSender<Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSender")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<Out: Message> ConnectionSender<Out> {
    /// Wait until the writer queue has room for one message.
    ///
    /// Cancel safe: dropping the future gives up the place in line and
    /// nothing else.
    pub async fn reserve(&self) -> Result<SendPermit<'_, Out>, FuzzlinkError> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| FuzzlinkError::ChannelClosed)?;
        Ok(SendPermit { permit })
    }
}

/// Room for exactly one message in a writer queue.
pub struct SendPermit<'a, Out> {
    permit: mpsc::Permit<'a, Outgoing<Out>>,
}

impl<Out> SendPermit<'_, Out> {
    pub fn send(self, message: Out) {
        self.permit.send(Outgoing {
            message,
            flushed: None,
        });
    }
}

async fn send_to<Out>(
    tx: &mpsc::Sender<Outgoing<Out>>,
    message: Out,
    flushed: Option<oneshot::Sender<()>>,
) -> Result<(), FuzzlinkError> {
    tx.send(Outgoing { message, flushed })
        .await
        .map_err(|_| FuzzlinkError::ChannelClosed)
}

async fn send_flushed_to<Out>(
    tx: &mpsc::Sender<Outgoing<Out>>,
    message: Out,
) -> Result<(), FuzzlinkError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    send_to(tx, message, Some(ack_tx)).await?;
    ack_rx.await.map_err(|_| FuzzlinkError::ChannelClosed)
}

/// Address of the host an executor dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
