use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server, answering registrations and storing submitted text.
    Server(ServerArgs),
    /// Register with a server and submit one line of text.
    Client(ClientArgs),
    /// Ask a running server to stop.
    Stop(StopArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the registration endpoint binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8000")]
    pub registration: SocketAddr,

    /// Address the submission endpoint binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8001")]
    pub submission: SocketAddr,

    /// File accepted submissions are appended to, one per line.
    #[arg(long, default_value = "messages.txt")]
    pub log_file: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Registration endpoint of the server.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub registration: SocketAddr,

    /// Submission endpoint of the server.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub submission: SocketAddr,

    /// Text to submit once registered.
    #[arg(long, default_value = "Hello, Server!")]
    pub text: String,
}

#[derive(Args, Debug, Clone)]
pub struct StopArgs {
    /// Registration endpoint of the server to stop.
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub registration: SocketAddr,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn server_defaults_match_well_known_ports() {
        let cli = Cli::try_parse_from(["net_msg", "server"]).expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.registration.port(), 8000);
        assert_eq!(args.submission.port(), 8001);
        assert_eq!(args.log_file, PathBuf::from("messages.txt"));
    }

    #[test]
    fn client_text_can_be_overridden() {
        let cli = Cli::try_parse_from(["net_msg", "client", "--text", "hi there"]).expect("parse");
        let Command::Client(args) = cli.command else {
            panic!("expected client command");
        };
        assert_eq!(args.text, "hi there");
        assert_eq!(args.registration, "127.0.0.1:8000".parse().expect("addr"));
    }
}
