use clap::Parser;

use varmed::cli::{Cli, Command};
use varmed::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => {
            varmed::telemetry::init_tracing()?;
            let cfg = Config::load(&config)?;
            varmed::run(cfg).await
        }
        Command::Status { admin_url } => varmed::cli::print_status(&admin_url).await,
        Command::Trigger { admin_url } => varmed::cli::trigger(&admin_url).await,
    }
}
