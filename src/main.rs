//! airtek: declare, preview, converge and destroy the Air-Tek web stack.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "airtek",
    version,
    about = "Resource graph for the Air-Tek web stack with BLAKE3 state and provenance events"
)]
struct Cli {
    /// Log filter when RUST_LOG is unset (e.g. debug, airtek_infra=trace)
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: airtek_infra::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = airtek_infra::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
