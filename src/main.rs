use clap::Parser;
use tracing_subscriber::EnvFilter;

use covenant::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "covenant=debug"
    } else {
        "covenant=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    if let Err(e) = cli::execute(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
