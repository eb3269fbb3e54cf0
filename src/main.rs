//! Kiln CLI — render resources, run recipes, resolve deferred values.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "kiln",
    version,
    about = "Resource rendering and recipe deployment: output graphs, deferred values, Bicep/Terraform recipes"
)]
struct Cli {
    #[command(subcommand)]
    command: kiln::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = kiln::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
