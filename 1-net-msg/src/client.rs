use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelKind, Requester},
    cli::{ClientArgs, StopArgs},
    error::NetMsgError,
    protocol::{
        ClientIdentity, RegistrationReply, RegistrationRequest, SubmissionReply, SubmissionRequest,
        Token,
    },
};

/// A client holding one connection per channel.
pub struct Client {
    identity: ClientIdentity,
    channels: Option<Channels>,
}

struct Channels {
    registration: Requester,
    submission: Requester,
}

impl Client {
    pub async fn connect(registration: SocketAddr, submission: SocketAddr) -> crate::Result<Self> {
        Self::connect_as(ClientIdentity::generate(), registration, submission).await
    }

    pub async fn connect_as(
        identity: ClientIdentity,
        registration: SocketAddr,
        submission: SocketAddr,
    ) -> crate::Result<Self> {
        let registration = Requester::connect(ChannelKind::Registration, registration).await?;
        let submission = Requester::connect(ChannelKind::Submission, submission).await?;
        info!(client = %identity, "client started");

        Ok(Self {
            identity,
            channels: Some(Channels {
                registration,
                submission,
            }),
        })
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn is_stopped(&self) -> bool {
        self.channels.is_none()
    }

    pub async fn register(&mut self) -> crate::Result<Token> {
        let request = RegistrationRequest::Register(self.identity).encode();
        let channels = self.channels.as_mut().ok_or(NetMsgError::ClientStopped)?;
        let reply = channels.registration.request(&request).await?;

        match RegistrationReply::decode(&reply)? {
            RegistrationReply::Token(token) => Ok(token),
            other => Err(NetMsgError::Rejected {
                channel: ChannelKind::Registration,
                reply: other.encode().parts().concat(),
            }),
        }
    }

    pub async fn submit(&mut self, text: &str, token: &Token) -> crate::Result<SubmissionReply> {
        let request = SubmissionRequest::new(text, &self.identity, token).encode();
        let channels = self.channels.as_mut().ok_or(NetMsgError::ClientStopped)?;
        let reply = channels.submission.request(&request).await?;
        Ok(SubmissionReply::decode(&reply)?)
    }

    /// Closes both connections. Stopping an already stopped client is a no-op.
    pub async fn stop(&mut self) {
        let Some(Channels {
            registration,
            submission,
        }) = self.channels.take()
        else {
            debug!(client = %self.identity, "client already stopped");
            return;
        };

        submission.close().await;
        registration.close().await;
        info!(client = %self.identity, "client stopped");
    }
}

/// Sends the stop command and returns the server's answer.
pub async fn send_stop(registration: SocketAddr) -> crate::Result<RegistrationReply> {
    let mut requester = Requester::connect(ChannelKind::Registration, registration).await?;
    let reply = requester.request(&RegistrationRequest::Stop.encode()).await;
    requester.close().await;
    Ok(RegistrationReply::decode(&reply?)?)
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut client = Client::connect(args.registration, args.submission)
        .await
        .context("failed to start client")?;
    write_stdout(&format!("client id: {}", client.identity())).await?;

    let outcome = select! {
        result = register_and_submit(&mut client, &args.text) => result,
        ctrl_c = tokio::signal::ctrl_c() => {
            handle_ctrl_c(ctrl_c);
            Ok(())
        }
    };

    client.stop().await;
    outcome
}

async fn register_and_submit(client: &mut Client, text: &str) -> Result<()> {
    let token = client.register().await.context("registration failed")?;
    write_stdout(&format!("registered with token {token}")).await?;

    let reply = client.submit(text, &token).await.context("submission failed")?;
    write_stdout(&format!("server replied {reply}")).await?;
    Ok(())
}

pub async fn run_stop(args: StopArgs) -> Result<()> {
    let reply = select! {
        reply = send_stop(args.registration) => reply.context("failed to stop server")?,
        ctrl_c = tokio::signal::ctrl_c() => {
            handle_ctrl_c(ctrl_c);
            return Ok(());
        }
    };

    match reply {
        RegistrationReply::StopAck => write_stdout("server replied STOP:ACK").await?,
        other => anyhow::bail!("unexpected reply to stop command: {other:?}"),
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    match result {
        Ok(()) => info!("interrupt received, stopping"),
        Err(error) => warn!(?error, "ctrl-c handler failed"),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
