mod call_cmd;
mod history_cmd;
mod status_cmd;
mod terminal_output;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use callforge_config::{VoiceCallConfig, config_dir, config_file_path, load_and_prepare};
use callforge_core::CallMode;
use callforge_gateway::{build_state, start_server};
use callforge_logging::init_logger;

use call_cmd::CallRequest;

#[derive(Parser)]
#[command(name = "callforge")]
#[command(about = "callforge: programmable voice calls over Twilio, Telnyx and Plivo")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.callforge/voice-call.yaml)
    #[arg(short, long, global = true, env = "CALLFORGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server and call control API
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Place an outbound call through the running server
    Call {
        /// Destination in E.164 form
        #[arg(long)]
        to: String,
        /// Message spoken when the call connects
        #[arg(short, long)]
        message: Option<String>,
        /// notify (speak and hang up) or conversation
        #[arg(long)]
        mode: Option<CallMode>,
    },
    /// Show the running server's health and live calls
    Status,
    /// List recent calls from the call log
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

fn control_url(config: &VoiceCallConfig) -> String {
    let host = match config.serve.bind.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        bind => bind,
    };
    format!("http://{host}:{}", config.serve.port)
}

fn init_cli_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(|| config_file_path(&config_dir()));

    match cli.command {
        Commands::Serve { port } => {
            let mut config = load_and_prepare(&path).await?;
            if let Some(port) = port {
                config.serve.port = port;
            }
            run_server(config).await?;
        }
        Commands::Call { to, message, mode } => {
            init_cli_logging();
            let config = load_and_prepare(&path).await?;
            call_cmd::run(&control_url(&config), CallRequest { to, message, mode }).await?;
        }
        Commands::Status => {
            init_cli_logging();
            let config = load_and_prepare(&path).await?;
            status_cmd::run(&control_url(&config)).await?;
        }
        Commands::History { limit } => {
            init_cli_logging();
            let config = load_and_prepare(&path).await?;
            history_cmd::run(&config.store_dir(), limit)?;
        }
    }

    Ok(())
}

async fn run_server(config: VoiceCallConfig) -> Result<()> {
    init_logger(config.log_dir(), &config.logging.level)?;
    if !config.enabled {
        bail!("voice calls are disabled; set `enabled: true` in the config");
    }

    let addr: SocketAddr = format!("{}:{}", config.serve.bind, config.serve.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.serve.bind, config.serve.port))?;
    info!(
        %addr,
        store = %config.store_dir().display(),
        streaming = config.streaming.enabled,
        "Starting callforge"
    );

    let state = build_state(config).await?;
    start_server(addr, state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_with_mode() {
        let cli = Cli::parse_from(["callforge", "call", "--to", "+15550002222", "--mode", "conversation"]);
        match cli.command {
            Commands::Call { to, mode, message } => {
                assert_eq!(to, "+15550002222");
                assert_eq!(mode, Some(CallMode::Conversation));
                assert!(message.is_none());
            }
            _ => panic!("expected call subcommand"),
        }
    }

    #[test]
    fn wildcard_bind_is_reached_over_loopback() {
        let mut config = VoiceCallConfig::default();
        config.serve.bind = "0.0.0.0".into();
        config.serve.port = 4000;
        assert_eq!(control_url(&config), "http://127.0.0.1:4000");
    }
}
