//! Authenticated messaging over two request/reply channels.
//!
//! Clients register an identity on the registration channel and receive a
//! token, then submit text on the submission channel together with that
//! identity and token. The server appends every accepted submission to a log
//! file. A `STOP` sent on the registration channel shuts the server down.
//!
//! - [`server`] runs the loop that multiplexes both channels.
//! - [`handler`] answers registrations and submissions.
//! - [`store`] keeps the identity → token table.
//! - [`sink`] is the append-only log of accepted payloads.
//! - [`channel`] carries frames over TCP with strict request/reply pacing.
//! - [`protocol`] defines frames, identities, tokens and the typed messages.
//! - [`client`] drives the protocol from the client side, including the stop
//!   command.
//! - [`cli`] parses the command-line interface.

pub mod channel;
pub mod cli;
pub mod client;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod sink;
pub mod store;

pub use error::{NetMsgError, Result};
