mod probe;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use huddle_session::{init_logging, Config};

#[derive(Parser, Debug)]
#[command(name = "huddle")]
#[command(about = "Huddle media session client", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "HUDDLE_CONFIG")]
    config: Option<String>,

    /// Signaling WebSocket URL, overrides the configuration
    #[arg(long, env = "HUDDLE_URL")]
    url: Option<String>,

    /// Access token appended to the signaling URL
    #[arg(long, env = "HUDDLE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room's signaling, log what the server announces, then leave
    Probe {
        /// Room to join
        #[arg(long)]
        room: String,

        /// How long to listen for announcements, in seconds
        #[arg(long, default_value = "10")]
        duration: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.signaling.url = url;
    }
    if args.token.is_some() {
        config.signaling.token = args.token;
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    init_logging(&config.logging)?;

    match args.command {
        Command::Config => {
            let mut shown = config.clone();
            if shown.signaling.token.is_some() {
                shown.signaling.token = Some("***".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
        Command::Probe { room, duration } => {
            info!(room_id = %room, url = %config.signaling.url, "Probing room");
            let result = probe::run(&config, &room, std::time::Duration::from_secs(duration)).await;
            if let Err(e) = &result {
                error!(room_id = %room, error = %e, "Probe failed");
            }
            result
        }
    }
}
