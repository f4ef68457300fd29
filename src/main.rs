use clap::{Parser, Subcommand};
use env_logger::Env;
use log::error;

use fleetmon::agent;
use fleetmon::config::{Config, DEFAULT_LOCAL_API_PORT};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring agent
    Run {
        /// Port for the local status API
        #[arg(short, long, default_value_t = DEFAULT_LOCAL_API_PORT)]
        port: u16,
    },

    /// Query the status of a locally running agent
    Status {
        /// Port of the local status API
        #[arg(short, long, default_value_t = DEFAULT_LOCAL_API_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Some(Commands::Status { port }) => {
            if let Err(e) = print_status(port).await {
                error!("agent not reachable on port {}: {}", port, e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { port }) => run_agent(port).await,
        None => run_agent(DEFAULT_LOCAL_API_PORT).await,
    }
}

async fn run_agent(port: u16) {
    let mut config = Config::new();
    config.local_api_port = port;

    if let Err(e) = agent::run(config).await {
        error!("agent stopped with an error: {}", e);
        std::process::exit(1);
    }
}

async fn print_status(port: u16) -> Result<(), reqwest::Error> {
    let url = format!("http://127.0.0.1:{}/health", port);
    let body: serde_json::Value = reqwest::get(&url).await?.json().await?;

    println!(
        "agent {} ({})",
        body["agentStatus"].as_str().unwrap_or("unknown"),
        body["version"].as_str().unwrap_or("unknown"),
    );
    Ok(())
}
