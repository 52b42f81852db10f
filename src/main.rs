use clap::Parser;

use duo_rtc::{
    config::{Cli, Mode},
    peer, server,
    util::init_log,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_log();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server(config) => {
            tracing::info!("Starting signaling relay...");
            server::main(config).await
        }
        Mode::Peer(config) => {
            tracing::info!("Starting call participant...");
            peer::main(config).await
        }
    }
}
