// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use clap::{Parser, Subcommand};
use std::process;

mod client;
mod commands;

use commands::{serve, worker};

/// Coordinator and worker binaries for the work-unit dispatch system.
#[derive(Parser)]
#[command(name = "wu-coordinator")]
#[command(author = "Work Unit Coordinator Contributors")]
#[command(version)]
#[command(about = "Run the work-unit coordinator or a worker against it", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator: accept worker connections and dispatch work units
    Serve(serve::ServeArgs),

    /// Run a worker: connect to a coordinator and execute work units
    Worker(worker::WorkerArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => serve::execute(args, cli.verbose).await,
        Commands::Worker(args) => worker::execute(args, cli.verbose).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if cli.verbose {
            eprintln!("\nCaused by:");
            for cause in e.chain().skip(1) {
                eprintln!("  {cause}");
            }
        }
        process::exit(1);
    }
}
