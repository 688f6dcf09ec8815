mod commands;
mod output;

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::run::RunArgs;

/// Environment variable holding the log filter
const LOG_ENV: &str = "REPLAY_LOG";

/// Replay a CI build matrix locally, optionally in parallel
#[derive(Parser, Debug)]
#[command(name = "replay", version, about)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let code = commands::run::execute(cli.run).await?;
    std::process::exit(code);
}
