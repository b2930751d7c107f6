mod cli;
mod http;

use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> eyre::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = cli::Cli::parse();
    cli::run(cli)
}
