//! Bot worker
//!
//! Binary entry point for the NATS chat bot worker.

use bot_worker::Cli;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = bot_worker::run(cli).await {
        eprintln!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}
