use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, warn};

use net_msg::{
    NetMsgError,
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let mut server = match Server::bind(&args).await {
                Ok(server) => server,
                Err(err @ NetMsgError::Bind { .. }) => {
                    error!("{err}");
                    return Ok(ExitCode::from(NetMsgError::BIND_EXIT_CODE));
                }
                Err(err) => return Err(err.into()),
            };
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err.into());
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::Stop(args) => client::run_stop(args).await?,
    }

    Ok(ExitCode::SUCCESS)
}
