mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::DaemonClient;
use shared::ipc::{Command, Response};

#[derive(Parser)]
#[command(name = "farfield")]
#[command(about = "CLI tool for the farfield voice satellite daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the satellite loop
    Start,
    /// Stop the satellite loop
    Stop,
    /// Show satellite status
    Status,
    /// Toggle debug recording for the next session
    Record {
        #[arg(value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = DaemonClient::new();

    let command = match cli.command {
        Commands::Start => Command::Start,
        Commands::Stop => Command::Stop,
        Commands::Status => Command::Status,
        Commands::Record { enabled } => Command::Record(enabled),
    };

    match client.send_command(command).await {
        Ok(Response::Ok) => {
            println!("Success");
        }
        Ok(Response::Status(info)) => {
            println!("Status:");
            println!("  Running: {}", info.is_running);
            println!("  Connected: {}", info.connected);
            println!("  State: {}", info.session_state);
            println!("  Pipeline runs: {}", info.pipeline_runs);
            println!("  Recording: {}", info.recording);
        }
        Ok(Response::Error(msg)) => {
            eprintln!("Error: {}", msg);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to connect to farfieldd: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
