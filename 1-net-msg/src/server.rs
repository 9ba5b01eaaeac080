//! The server loop: waits on both channels and dispatches requests to the
//! handlers until a stop command or an interrupt arrives.
//!
//! ```text
//!   Running ──STOP / interrupt──► Stopping ──channels released──► Stopped
//! ```
//!
//! On every wake-up the loop collects whatever is pending on both channels and
//! serves the registration request before the submission.

use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{select, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelKind, Endpoint, Exchange, ServingEndpoint},
    cli::ServerArgs,
    error::Result,
    handler::{Flow, handle_registration, handle_submission},
    protocol::{RegistrationRequest, SubmissionRequest},
    sink::LogSink,
    store::SessionStore,
};

/// Upper bound on how long shutdown waits for `STOP:ACK` to reach the caller.
const STOP_ACK_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopping,
    Stopped,
}

/// Requests collected in one wake-up of the server loop.
#[derive(Debug, Default)]
pub struct Ready {
    pub registration: Option<Exchange>,
    pub submission: Option<Exchange>,
}

pub struct Server {
    registration: ServingEndpoint,
    submission: ServingEndpoint,
    sessions: SessionStore,
    sink: LogSink,
    state: ServerState,
}

impl Server {
    /// Binds both endpoints and opens the log sink. An endpoint that was
    /// already bound is released again if a later step fails.
    pub async fn bind(args: &ServerArgs) -> Result<Self> {
        let registration = Endpoint::bind(ChannelKind::Registration, args.registration).await?;
        let submission = Endpoint::bind(ChannelKind::Submission, args.submission).await?;
        let sink = LogSink::open(&args.log_file).await?;
        Ok(Self::new(registration, submission, sink))
    }

    pub fn new(registration: Endpoint, submission: Endpoint, sink: LogSink) -> Self {
        Self {
            registration: registration.serve(),
            submission: submission.serve(),
            sessions: SessionStore::new(),
            sink,
            state: ServerState::Running,
        }
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.registration.local_addr()
    }

    pub fn submission_addr(&self) -> SocketAddr {
        self.submission.local_addr()
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Serves requests until a stop command is processed or `shutdown`
    /// resolves, then releases both channels.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        while self.state == ServerState::Running {
            select! {
                biased;
                _ = &mut shutdown => {
                    info!("interrupt received, stopping");
                    self.state = ServerState::Stopping;
                }
                ready = self.next_ready() => match ready {
                    Some(ready) => self.dispatch(ready).await,
                    None => {
                        warn!("request intake closed unexpectedly");
                        self.state = ServerState::Stopping;
                    }
                },
            }
        }

        self.shutdown().await
    }

    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Releases both channels and flushes the log sink. Calling it on a
    /// stopped server does nothing.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state == ServerState::Stopped {
            debug!("server already stopped");
            return Ok(());
        }

        info!("stopping server");
        self.state = ServerState::Stopping;
        self.submission.close().await;
        self.registration.close().await;
        self.sink.flush().await?;
        self.state = ServerState::Stopped;
        info!(sessions = self.sessions.len(), "server stopped");
        Ok(())
    }

    /// Blocks until at least one channel has a request, then picks up
    /// whatever the other channel already has queued.
    pub(crate) async fn next_ready(&mut self) -> Option<Ready> {
        let mut ready = Ready::default();
        select! {
            biased;
            exchange = self.registration.recv() => ready.registration = Some(exchange?),
            exchange = self.submission.recv() => ready.submission = Some(exchange?),
        }

        if ready.registration.is_none() {
            ready.registration = self.registration.try_recv();
        }
        if ready.submission.is_none() {
            ready.submission = self.submission.try_recv();
        }
        debug!(
            registration_backlog = self.registration.queued(),
            submission_backlog = self.submission.queued(),
            "collected pending requests"
        );
        Some(ready)
    }

    pub(crate) async fn dispatch(&mut self, ready: Ready) {
        if let Some(exchange) = ready.registration {
            if self.serve_registration(exchange).await == Flow::Stop {
                self.state = ServerState::Stopping;
                if ready.submission.is_some() {
                    debug!("dropping submission that arrived with the stop command");
                }
                return;
            }
        }

        if let Some(exchange) = ready.submission {
            self.serve_submission(exchange).await;
        }
    }

    async fn serve_registration(&mut self, exchange: Exchange) -> Flow {
        let request = RegistrationRequest::decode(exchange.request());
        let (reply, flow) = handle_registration(&mut self.sessions, request);
        let delivery = exchange.respond(reply.encode());

        if flow == Flow::Stop {
            match timeout(STOP_ACK_FLUSH_TIMEOUT, delivery.flushed()).await {
                Ok(true) => debug!("stop acknowledgment delivered"),
                Ok(false) => warn!("stop requester left before the acknowledgment was sent"),
                Err(_) => warn!("timed out waiting for the stop acknowledgment to flush"),
            }
        }
        flow
    }

    async fn serve_submission(&mut self, exchange: Exchange) {
        let request = SubmissionRequest::decode(exchange.request());
        let reply = handle_submission(&self.sessions, &mut self.sink, request).await;
        exchange.respond(reply.encode());
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::time::sleep;

    use super::*;
    use crate::{
        channel::Requester,
        protocol::{ClientIdentity, Frame, Token},
    };

    async fn bind_server(log_file: &Path) -> Server {
        let args = ServerArgs {
            registration: "127.0.0.1:0".parse().expect("addr"),
            submission: "127.0.0.1:0".parse().expect("addr"),
            log_file: log_file.to_path_buf(),
        };
        Server::bind(&args).await.expect("bind server")
    }

    #[tokio::test]
    async fn one_wake_up_collects_both_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = bind_server(&dir.path().join("log.txt")).await;

        let mut registration =
            Requester::connect(ChannelKind::Registration, server.registration_addr())
                .await
                .expect("connect registration");
        let mut submission = Requester::connect(ChannelKind::Submission, server.submission_addr())
            .await
            .expect("connect submission");
        let identity = ClientIdentity::generate();

        let reg_task = tokio::spawn(async move {
            registration
                .request(&RegistrationRequest::Register(identity).encode())
                .await
        });
        let sub_task = tokio::spawn(async move {
            submission
                .request(&SubmissionRequest::new("early", &identity, &Token::generate()).encode())
                .await
        });
        timeout(Duration::from_secs(2), async {
            while server.registration.queued() == 0 || server.submission.queued() == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both requests queued");

        let ready = server.next_ready().await.expect("ready");
        assert!(ready.registration.is_some());
        assert!(ready.submission.is_some());

        server.dispatch(ready).await;
        reg_task.await.expect("join").expect("registration reply");
        let reply = sub_task.await.expect("join").expect("submission reply");

        // Registration ran first, so the identity is known and only the token is wrong.
        assert_eq!(reply, Frame::single("ERR:wrong-token"));
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn stop_in_same_wake_up_skips_the_submission() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_file = dir.path().join("log.txt");
        let mut server = bind_server(&log_file).await;

        let identity = ClientIdentity::generate();
        let token = server.sessions.register(identity);

        let (stop, stop_reply) = Exchange::new(RegistrationRequest::Stop.encode());
        let (submit, submit_reply) =
            Exchange::new(SubmissionRequest::new("too late", &identity, &token).encode());
        let stop_reply = tokio::spawn(stop_reply.recv());
        server
            .dispatch(Ready {
                registration: Some(stop),
                submission: Some(submit),
            })
            .await;

        assert_eq!(
            stop_reply.await.expect("join"),
            Some(Frame::single("STOP:ACK"))
        );
        assert_eq!(submit_reply.recv().await, None);
        assert_eq!(server.state(), ServerState::Stopping);

        server.shutdown().await.expect("shutdown");
        let contents = tokio::fs::read_to_string(&log_file).await.expect("read log");
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = bind_server(&dir.path().join("log.txt")).await;

        server.shutdown().await.expect("first shutdown");
        assert_eq!(server.state(), ServerState::Stopped);
        server.shutdown().await.expect("second shutdown");
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn failed_second_bind_releases_the_first_endpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("blocker");
        let free = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe");
        let registration = free.local_addr().expect("addr");
        drop(free);

        let args = ServerArgs {
            registration,
            submission: blocker.local_addr().expect("addr"),
            log_file: dir.path().join("log.txt"),
        };
        let err = Server::bind(&args).await.err().expect("bind should fail");
        assert!(err.is_bind());

        tokio::net::TcpListener::bind(registration)
            .await
            .expect("registration address released");
    }
}
