//! ptyrelay daemon
//!
//! Serves PTY-backed shells to browser terminals over WebSocket.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ptyrelay::config::Config;
use ptyrelay::control::ControlClient;
use ptyrelay::protocol::SessionSummary;
use ptyrelay::server::{RelayServer, ServerEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// ptyrelay - relays pseudo-terminal shells to browser terminals.
#[derive(Parser, Debug)]
#[command(name = "ptyrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the relay in the foreground
    Serve {
        /// WebSocket listen address (overrides the config file)
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Show status and live sessions of a running daemon
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Environment wins over the file, the command line wins over both
    config.apply_env_overrides();
    if let Commands::Serve {
        listen: Some(addr), ..
    } = &cli.command
    {
        config.server.listen_addr = addr.clone();
    }

    config.validate()?;

    let _guard = init_tracing(cli.verbose, &config)?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!(
                listen = %config.server.listen_addr,
                control = %config.server.control_socket.display(),
                "ptyrelay starting"
            );
            let mut server = RelayServer::new(config);
            run_headless(&mut server).await?;
        }
        Commands::Status { json } => {
            let mut client = ControlClient::connect(&config.server.control_socket)
                .await
                .with_context(|| {
                    format!(
                        "Daemon is not running (cannot connect to {})",
                        config.server.control_socket.display()
                    )
                })?;

            let status = client.status().await?;
            let sessions = client.list_sessions().await?;

            if json {
                let report = serde_json::json!({
                    "pending": status.pending,
                    "sessions": sessions,
                    "uptime_secs": status.uptime_secs,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Daemon Status: running");
                println!("  Uptime:   {}", format_duration(status.uptime_secs));
                println!("  Pending:  {}", status.pending);
                println!("  Sessions: {}", status.sessions);
                println!();
                print_sessions_table(&sessions);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// `--verbose` forces debug, otherwise `RUST_LOG` wins over the configured
/// level. The returned guard flushes the file writer and must outlive `main`.
fn init_tracing(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level))
    };

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "ptyrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let user_width = sessions
        .iter()
        .map(|s| s.username.as_ref().map(|u| u.len()).unwrap_or(1))
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:>8}  {:>9}  {:<user_width$}  {:>10}",
        "PID",
        "SIZE",
        "USER",
        "AGE",
        user_width = user_width
    );
    println!("{}", "-".repeat(user_width + 35));

    for session in sessions {
        let size = format!("{}x{}", session.size.cols, session.size.rows);
        println!(
            "{:>8}  {:>9}  {:<user_width$}  {:>10}",
            session.pid,
            size,
            session.username.as_deref().unwrap_or("-"),
            format_duration(session.age_secs),
            user_width = user_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the relay until SIGTERM or SIGINT.
async fn run_headless(server: &mut RelayServer) -> anyhow::Result<()> {
    server.start().await?;

    if let Some(addr) = server.local_addr() {
        tracing::info!(addr = %addr, "Accepting WebSocket connections");
    }

    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::StateChanged(state) => {
                    tracing::debug!("Server state: {:?}", state);
                }
                ServerEvent::ConnectionOpened { conn_id, peer } => {
                    tracing::info!(conn_id = conn_id, peer = %peer, "Connection opened");
                }
                ServerEvent::ConnectionClosed { conn_id, reason } => {
                    tracing::info!(conn_id = conn_id, reason = ?reason, "Connection closed");
                }
            }
        }
    });

    let signal_result = wait_for_shutdown_signal().await;
    if let Err(e) = &signal_result {
        tracing::error!(error = %e, "Failed to wait for shutdown signal");
    }

    server.stop().await?;
    signal_result
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["ptyrelay", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert!(listen.is_none()),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_listen() {
        let cli = Cli::try_parse_from(["ptyrelay", "serve", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Serve { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_with_short_listen() {
        let cli = Cli::try_parse_from(["ptyrelay", "serve", "-l", "127.0.0.1:0"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve { listen: Some(ref addr) } if addr == "127.0.0.1:0"
        ));
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["ptyrelay", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: false }));
    }

    #[test]
    fn test_status_json() {
        let cli = Cli::try_parse_from(["ptyrelay", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["ptyrelay", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_global_verbose_flag() {
        let cli = Cli::try_parse_from(["ptyrelay", "--verbose", "status"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_global_short_config_flag() {
        let cli = Cli::try_parse_from(["ptyrelay", "-c", "/path/to/config.toml", "serve"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.toml")));
    }

    #[test]
    fn test_verbose_after_command() {
        // Global flags can also come after the command
        let cli = Cli::try_parse_from(["ptyrelay", "serve", "-v"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_config_after_command() {
        let cli = Cli::try_parse_from(["ptyrelay", "status", "--config", "/etc/ptyrelay.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/ptyrelay.toml")));
    }

    #[test]
    fn test_invalid_command_fails() {
        assert!(Cli::try_parse_from(["ptyrelay", "invalid"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["ptyrelay"]).is_err());
    }

    #[test]
    fn test_listen_requires_value() {
        assert!(Cli::try_parse_from(["ptyrelay", "serve", "--listen"]).is_err());
    }

    #[test]
    fn test_help_available() {
        let err = Cli::try_parse_from(["ptyrelay", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3723), "1h 2m 3s");
    }
}
