//! relay-hub daemon — runs the WebSocket message relay.
//!
//! Parses the command line, installs `env_logger` (default level `info`,
//! override with `RUST_LOG`), and serves until ctrl-c, after which pending
//! log lines are flushed before exit.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use log::{error, warn};
use relay_hub::config::{DEFAULT_LOG_PATH, DEFAULT_PORT};
use relay_hub::{ConfigError, RelayConfig, RelayError, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "relay-hub")]
#[command(about = "Real-time WebSocket message relay with history replay and a durable log", long_about = None)]
#[command(disable_help_flag = true)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT as i64, allow_negative_numbers = true)]
    port: i64,

    /// Send received messages back to their sender
    #[arg(short, long)]
    loopback: bool,

    /// Number of recent messages replayed to new connections (0 disables replay)
    #[arg(short = 'h', long, default_value_t = 20, allow_negative_numbers = true)]
    history: i64,

    /// Append-only log of all relayed messages
    #[arg(long, default_value = DEFAULT_LOG_PATH)]
    log_file: PathBuf,

    /// Interface to bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let config = RelayConfig {
            log_path: self.log_file,
            bind_host: self.bind,
            ..RelayConfig::from_raw(self.port, self.loopback, self.history)?
        };
        config.validate()?;
        Ok(config)
    }
}

async fn run(args: Args) -> Result<(), RelayError> {
    let config = args.into_config()?;
    let server = RelayServer::bind(config).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Unable to listen for ctrl-c, running until killed: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let config = Args::try_parse_from(["relay-hub"]).unwrap().into_config().unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from(["relay-hub", "-p", "9000", "-l", "-h", "5"]).unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.self_echo);
        assert_eq!(config.history_window, 5);
    }

    #[test]
    fn test_long_flags() {
        let args = Args::try_parse_from([
            "relay-hub",
            "--port",
            "0",
            "--loopback",
            "--history",
            "0",
            "--log-file",
            "/tmp/relay.log",
            "--bind",
            "127.0.0.1",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.history_window, 0);
        assert_eq!(config.log_path, PathBuf::from("/tmp/relay.log"));
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn test_negative_values_rejected() {
        let args = Args::try_parse_from(["relay-hub", "--port", "-1"]).unwrap();
        assert_eq!(args.into_config(), Err(ConfigError::InvalidPort(-1)));

        let args = Args::try_parse_from(["relay-hub", "-h", "-3"]).unwrap();
        assert_eq!(args.into_config(), Err(ConfigError::NegativeHistory(-3)));
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        assert!(Args::try_parse_from(["relay-hub", "--port", "abc"]).is_err());
    }
}
