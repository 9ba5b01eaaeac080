//! Synchronous request/reply transport over TCP.
//!
//! An [`Endpoint`] accepts connections for one logical channel. Each
//! connection reads one request at a time, hands it to the server loop as an
//! [`Exchange`] and waits for the reply before reading the next request, so a
//! peer never has more than one request in flight. All connections of an
//! endpoint publish into a single intake queue owned by the server loop.
//!
//! [`Requester`] is the client half: one connection, one outstanding request.

use std::{fmt, io, net::SocketAddr};

use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    error::{NetMsgError, Result},
    protocol::{Frame, read_frame, write_frame},
};

/// Requests an endpoint buffers before connections wait on the server loop.
const INTAKE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Registration,
    Submission,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Registration => "registration",
            ChannelKind::Submission => "submission",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request waiting for its reply.
#[derive(Debug)]
pub struct Exchange {
    request: Frame,
    reply_tx: oneshot::Sender<Reply>,
}

#[derive(Debug)]
struct Reply {
    frame: Frame,
    delivered: oneshot::Sender<()>,
}

impl Exchange {
    /// Builds an exchange outside of a connection, returning the receiving
    /// side the reply will arrive on.
    pub fn new(request: Frame) -> (Self, PendingReply) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self { request, reply_tx }, PendingReply { reply_rx })
    }

    pub fn request(&self) -> &Frame {
        &self.request
    }

    /// Hands the reply to the connection that owns this exchange.
    pub fn respond(self, frame: Frame) -> Delivery {
        let (delivered, delivered_rx) = oneshot::channel();
        if self.reply_tx.send(Reply { frame, delivered }).is_err() {
            debug!("requester went away before the reply was ready");
        }
        Delivery { delivered_rx }
    }
}

/// Resolves once the reply has been written and flushed to the peer.
#[derive(Debug)]
pub struct Delivery {
    delivered_rx: oneshot::Receiver<()>,
}

impl Delivery {
    /// Returns false if the connection dropped the reply instead of sending it.
    pub async fn flushed(self) -> bool {
        self.delivered_rx.await.is_ok()
    }
}

#[derive(Debug)]
pub struct PendingReply {
    reply_rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Waits for the reply and marks it delivered. `None` if the exchange was
    /// dropped without an answer.
    pub async fn recv(self) -> Option<Frame> {
        let Reply { frame, delivered } = self.reply_rx.await.ok()?;
        let _ = delivered.send(());
        Some(frame)
    }
}

pub struct Endpoint {
    kind: ChannelKind,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Endpoint {
    pub async fn bind(kind: ChannelKind, addr: SocketAddr) -> Result<Self> {
        let bind_error = |source: io::Error| NetMsgError::Bind {
            channel: kind,
            addr,
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        Ok(Self {
            kind,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections in the background.
    pub fn serve(self) -> ServingEndpoint {
        let Endpoint {
            kind,
            listener,
            local_addr,
        } = self;
        let (intake_tx, intake) = mpsc::channel(INTAKE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(kind, listener, intake_tx, shutdown_rx));
        info!("{kind} endpoint listening on {local_addr}");

        ServingEndpoint {
            kind,
            local_addr,
            intake,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// A running endpoint and the receiving side of its intake queue.
pub struct ServingEndpoint {
    kind: ChannelKind,
    local_addr: SocketAddr,
    intake: mpsc::Receiver<Exchange>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServingEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next pending request. `None` once the endpoint has been closed.
    pub async fn recv(&mut self) -> Option<Exchange> {
        self.intake.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Exchange> {
        self.intake.try_recv().ok()
    }

    /// Requests waiting in the intake queue.
    pub fn queued(&self) -> usize {
        self.intake.len()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stops accepting, drops every open connection and releases the port.
    /// Requests still queued are dropped unanswered. Closing twice is a no-op.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(err) = task.await {
            warn!(channel = %self.kind, error = ?err, "accept loop ended abnormally");
        }

        self.intake.close();
        let mut dropped = 0usize;
        while self.intake.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(channel = %self.kind, dropped, "dropped queued requests on close");
        }
        info!(channel = %self.kind, addr = %self.local_addr, "endpoint closed");
    }
}

impl Drop for ServingEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    kind: ChannelKind,
    listener: TcpListener,
    intake: mpsc::Sender<Exchange>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = &mut shutdown => break,
            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer)) => {
                    debug!(channel = %kind, %peer, "accepted connection");
                    connections.spawn(serve_connection(kind, stream, peer, intake.clone()));
                }
                Err(err) => warn!(channel = %kind, error = ?err, "failed to accept connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    warn!(channel = %kind, error = ?err, "connection task failed");
                }
            }
        }
    }

    connections.shutdown().await;
}

async fn serve_connection(
    kind: ChannelKind,
    stream: TcpStream,
    peer: SocketAddr,
    intake: mpsc::Sender<Exchange>,
) {
    match run_connection(stream, intake).await {
        Ok(()) => debug!(channel = %kind, %peer, "connection closed"),
        Err(err) => warn!(channel = %kind, %peer, error = ?err, "connection closed with error"),
    }
}

async fn run_connection(stream: TcpStream, intake: mpsc::Sender<Exchange>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_frame(&mut reader).await? {
        let (exchange, pending) = Exchange::new(request);
        if intake.send(exchange).await.is_err() {
            break;
        }
        let Ok(Reply { frame, delivered }) = pending.reply_rx.await else {
            break;
        };
        write_frame(&mut writer, &frame).await?;
        let _ = delivered.send(());
    }

    Ok(())
}

/// Client side of one channel.
pub struct Requester {
    kind: ChannelKind,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Requester {
    pub async fn connect(kind: ChannelKind, addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| NetMsgError::Connect {
                channel: kind,
                addr,
                source,
            })?;
        debug!(channel = %kind, %addr, "connected");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            kind,
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one request and blocks until its reply arrives.
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame> {
        write_frame(&mut self.writer, frame).await?;
        read_frame(&mut self.reader)
            .await?
            .ok_or(NetMsgError::NoReply { channel: self.kind })
    }

    pub async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(channel = %self.kind, ?error, "failed to shut down connection cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("loopback addr")
    }

    #[tokio::test]
    async fn requests_reach_the_intake_and_replies_come_back() {
        let endpoint = Endpoint::bind(ChannelKind::Registration, loopback())
            .await
            .expect("bind");
        let mut serving = endpoint.serve();
        let mut requester = Requester::connect(ChannelKind::Registration, serving.local_addr())
            .await
            .expect("connect");

        let server = tokio::spawn(async move {
            let exchange = serving.recv().await.expect("exchange");
            assert_eq!(exchange.request(), &Frame::single("ping"));
            let delivered = exchange.respond(Frame::single("pong")).flushed().await;
            serving.close().await;
            delivered
        });

        let reply = timeout(Duration::from_secs(1), requester.request(&Frame::single("ping")))
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply, Frame::single("pong"));
        assert!(server.await.expect("server task"));
    }

    #[tokio::test]
    async fn binding_a_taken_port_fails() {
        let first = Endpoint::bind(ChannelKind::Registration, loopback())
            .await
            .expect("bind");
        let err = Endpoint::bind(ChannelKind::Submission, first.local_addr())
            .await
            .err()
            .expect("second bind should fail");
        assert!(err.is_bind());
    }

    #[tokio::test]
    async fn dropped_exchange_closes_the_connection() {
        let mut serving = Endpoint::bind(ChannelKind::Submission, loopback())
            .await
            .expect("bind")
            .serve();
        let mut requester = Requester::connect(ChannelKind::Submission, serving.local_addr())
            .await
            .expect("connect");

        let server = tokio::spawn(async move {
            drop(serving.recv().await.expect("exchange"));
            serving
        });

        let err = timeout(Duration::from_secs(1), requester.request(&Frame::single("hi")))
            .await
            .expect("reply in time")
            .expect_err("no reply expected");
        assert!(matches!(err, NetMsgError::NoReply { .. }));

        let mut serving = server.await.expect("server task");
        serving.close().await;
        serving.close().await;
        assert!(serving.is_closed());
    }

    #[tokio::test]
    async fn closed_endpoint_refuses_connections() {
        let mut serving = Endpoint::bind(ChannelKind::Registration, loopback())
            .await
            .expect("bind")
            .serve();
        let addr = serving.local_addr();
        serving.close().await;

        let result = Requester::connect(ChannelKind::Registration, addr).await;
        assert!(matches!(result, Err(NetMsgError::Connect { .. })));
    }

    #[tokio::test]
    async fn pending_reply_marks_delivery() {
        let (exchange, pending) = Exchange::new(Frame::single("STOP"));
        let delivery = exchange.respond(Frame::single("STOP:ACK"));
        assert_eq!(pending.recv().await, Some(Frame::single("STOP:ACK")));
        assert!(delivery.flushed().await);
    }
}
