mod action_commands;
mod probe_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "hearth", about = "Hearth, companion for your home-automation server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding hearth.toml, instead of the default locations.
    #[arg(long, global = true, env = "HEARTH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a server can be reached, negotiating certificate trust.
    Probe {
        url: String,
        /// Server entry whose persisted trust is used and updated.
        #[arg(long)]
        server: Option<String>,
        /// Persist accepted certificates and the imported identity.
        #[arg(long, default_value_t = false)]
        save: bool,
    },
    /// Fire an action.
    Run { action_id: String },
    /// List actions as the companion device sees them.
    Actions,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file path.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = &cli.config_dir {
        hearth_config::set_config_dir(dir.clone());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "hearth starting");

    match cli.command {
        Commands::Probe { url, server, save } => {
            probe_commands::probe(&url, server.as_deref(), save).await
        },
        Commands::Run { action_id } => action_commands::run(&action_id).await,
        Commands::Actions => action_commands::list(),
        Commands::Config {
            action: ConfigAction::Path,
        } => {
            println!("{}", hearth_config::find_or_default_config_path().display());
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_with_save() {
        let cli = Cli::try_parse_from([
            "hearth",
            "probe",
            "https://home.hearth.test:8123",
            "--server",
            "home",
            "--save",
        ])
        .unwrap();
        match cli.command {
            Commands::Probe { url, server, save } => {
                assert_eq!(url, "https://home.hearth.test:8123");
                assert_eq!(server.as_deref(), Some("home"));
                assert!(save);
            },
            _ => panic!("expected probe"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hearth",
            "run",
            "porch",
            "--log-level",
            "debug",
            "--json-logs",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Run { action_id } if action_id == "porch"));
    }

    #[test]
    fn config_path_subcommand() {
        let cli = Cli::try_parse_from(["hearth", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { action: ConfigAction::Path }));
    }
}
