//! vesper: session orchestration and realtime client.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use vesper_core::settings::{self, VesperSettings};
use vesper_telemetry::{init_telemetry, TelemetryConfig};

use app::App;

#[derive(Parser)]
#[command(name = "vesper")]
#[command(about = "Session orchestration and resilient realtime client")]
struct Cli {
    /// Settings file (defaults to ~/.vesper/settings.json)
    #[arg(long, global = true, env = "VESPER_SETTINGS")]
    settings: Option<PathBuf>,

    /// API origin, overrides settings and VESPER_API_ORIGIN
    #[arg(long, global = true)]
    origin: Option<String>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    /// Bootstrap, poll health and keep realtime connected until Ctrl-C
    Run,
    /// Run one identity check and print the session state
    Whoami,
    /// Log out and notify other sessions
    Logout,
    /// Print the effective configuration
    Status,
}

fn load(cli: &Cli) -> anyhow::Result<VesperSettings> {
    let path = cli.settings.clone().unwrap_or_else(settings::settings_path);
    let mut loaded = settings::load_settings_from_path(&path)?;

    if let Some(origin) = &cli.origin {
        loaded.api.origin = origin.clone();
    }
    if let Some(level) = &cli.log_level {
        loaded.logging.level = level.clone();
    }
    if cli.json_logs {
        loaded.logging.json = true;
    }
    Ok(loaded)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;

    let telemetry = init_telemetry(TelemetryConfig::from_level_str(
        &settings.logging.level,
        settings.logging.json,
    ));
    info!(origin = %settings.api.origin, "vesper starting");

    let app = App::build(settings, telemetry)?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => app.run().await?,
        Command::Whoami => {
            let state = app.whoami().await;
            println!("{}", serde_json::to_string_pretty(&state)?);
            app.shutdown();
        }
        Command::Logout => {
            let state = app.logout().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            app.shutdown();
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&app.status())?);
            app.shutdown();
        }
    }
    Ok(())
}
