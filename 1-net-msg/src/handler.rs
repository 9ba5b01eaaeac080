//! Request handlers for the registration and submission channels.
//!
//! Handlers are plain functions over the session store and log sink; the
//! server loop owns both and feeds them decoded requests.

use tokio::io::AsyncWrite;
use tracing::{debug, error, info, warn};

use crate::{
    protocol::{
        ClientIdentity, ProtocolError, RegistrationReply, RegistrationRequest, SubmissionReply,
        SubmissionRequest, Token,
    },
    sink::LogSink,
    store::SessionStore,
};

/// What the server loop should do once the reply has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub fn handle_registration(
    sessions: &mut SessionStore,
    request: Result<RegistrationRequest, ProtocolError>,
) -> (RegistrationReply, Flow) {
    match request {
        Ok(RegistrationRequest::Stop) => {
            info!("received stop command");
            (RegistrationReply::StopAck, Flow::Stop)
        }
        Ok(RegistrationRequest::Register(identity)) => {
            let token = sessions.register(identity);
            info!(client = %identity, sessions = sessions.len(), "client registered");
            (RegistrationReply::Token(token), Flow::Continue)
        }
        Err(err) => {
            warn!(error = %err, "rejecting registration request");
            (RegistrationReply::UnknownClient, Flow::Continue)
        }
    }
}

/// Checks the submission against the session table and persists accepted
/// payloads. An unknown or undecodable identity is reported before any token
/// check.
pub async fn handle_submission<W>(
    sessions: &SessionStore,
    sink: &mut LogSink<W>,
    request: Result<SubmissionRequest, ProtocolError>,
) -> SubmissionReply
where
    W: AsyncWrite + Unpin,
{
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed submission");
            return SubmissionReply::UnknownClient;
        }
    };

    let identity = match request.identity.parse::<ClientIdentity>() {
        Ok(identity) if sessions.contains(&identity) => identity,
        _ => {
            warn!(client = %request.identity, "submission from unknown client");
            return SubmissionReply::UnknownClient;
        }
    };

    let token_matches = request
        .token
        .parse::<Token>()
        .is_ok_and(|token| sessions.validate(&identity, &token));
    if !token_matches {
        warn!(client = %identity, token = %request.token, "submission with wrong token");
        return SubmissionReply::WrongToken;
    }

    if let Err(err) = sink.append(&request.payload).await {
        error!(client = %identity, error = ?err, "failed to persist submission");
        return SubmissionReply::StorageFailure;
    }

    debug!(client = %identity, bytes = request.payload.len(), "submission stored");
    SubmissionReply::Ack
}
