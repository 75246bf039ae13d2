mod admin;
mod app;
mod cursor;
mod cursor_store;
mod ingest;
mod kinds;
mod model;
mod persist;
mod pipeline;
mod store;
#[cfg(test)]
mod testing;
mod window;

use clap::{Parser, Subcommand, ValueEnum};
use fleet_sync_core::config::TelemetryConfig;
use fleet_sync_core::{telemetry, Config, SystemClock};
use model::RecordKind;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "fleet-sync")]
#[clap(about = "Incremental telematics sync for trips, events and drivers", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Run one sync invocation per record kind
    Sync {
        #[clap(long, value_enum, default_value_t = SyncTarget::All)]
        kind: SyncTarget,

        /// Fetch a single page even if more data is pending
        #[clap(long)]
        single_shot: bool,
    },

    /// Upsert the full driver list
    SyncDrivers,

    /// Poll every incremental kind until interrupted
    Watch,

    /// Inspect or override cursor slots
    Cursor {
        #[clap(subcommand)]
        command: CursorCommand,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncTarget {
    Trips,
    Events,
    All,
}

impl SyncTarget {
    fn kinds(self) -> Vec<RecordKind> {
        match self {
            SyncTarget::Trips => vec![RecordKind::Trips],
            SyncTarget::Events => vec![RecordKind::Events],
            SyncTarget::All => RecordKind::INCREMENTAL.to_vec(),
        }
    }
}

#[derive(Subcommand)]
enum CursorCommand {
    /// Show the stored cursor and whether it is inside the window
    Show {
        #[clap(long, value_parser = incremental_kind)]
        kind: RecordKind,
    },

    /// Build a cursor from a wall-clock start time
    Set {
        #[clap(long, value_parser = incremental_kind)]
        kind: RecordKind,

        /// e.g. "2024-01-05 10:30" or "05/01/2024 10:30:00"
        #[clap(long)]
        start: String,

        /// Informational end of the range to replay
        #[clap(long)]
        end: Option<String>,

        /// IANA zone name, UTC, Z, +HH:MM, -HH:MM or decimal hours (defaults to the display offset)
        #[clap(long)]
        tz: Option<String>,

        /// Write the cursor; without this the command is a dry run
        #[clap(long)]
        apply: bool,

        /// Allow a cursor outside the lookback window
        #[clap(long)]
        force: bool,
    },

    /// Build a cursor for now minus N hours
    Relative {
        #[clap(long, value_parser = incremental_kind)]
        kind: RecordKind,

        #[clap(long, default_value_t = 24)]
        hours: i64,

        #[clap(long)]
        apply: bool,
    },

    /// Store a literal token after validating it
    Raw {
        #[clap(long, value_parser = incremental_kind)]
        kind: RecordKind,

        #[clap(long)]
        token: String,

        #[clap(long)]
        apply: bool,

        #[clap(long)]
        force: bool,
    },
}

impl Commands {
    /// Only the sync commands bind the Prometheus listener.
    fn exports_metrics(&self) -> bool {
        matches!(
            self,
            Commands::Sync { .. } | Commands::SyncDrivers | Commands::Watch
        )
    }
}

fn telemetry_for(command: &Commands, config: &TelemetryConfig) -> TelemetryConfig {
    let mut telemetry = config.clone();
    telemetry.metrics_enabled &= command.exports_metrics();
    telemetry
}

fn incremental_kind(raw: &str) -> Result<RecordKind, String> {
    let kind: RecordKind = raw.parse()?;
    if kind.is_incremental() {
        Ok(kind)
    } else {
        Err(format!("{kind} has no cursor slot; expected trips or events"))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load()
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Initialize telemetry
    telemetry::init(&telemetry_for(&cli.command, &config.telemetry))?;

    match cli.command {
        Commands::Migrate => {
            let pool = app::connect(&config.database).await?;
            store::Store::new(pool).run_migrations().await?;
        }

        Commands::Sync { kind, single_shot } => {
            if single_shot {
                config.sync.drain_mode = fleet_sync_core::config::DrainMode::SingleShot;
            }
            let kinds = kind.kinds();
            info!(kinds = ?kinds, drain_mode = ?config.sync.drain_mode, "Starting sync");

            let pool = app::connect(&config.database).await?;
            let app = app::App::new(config, pool).await?;

            let mut failed = Vec::new();
            for (kind, result) in app.sync(&kinds).await {
                match result {
                    Ok(report) => println!(
                        "{kind}: {} fetched, {} stored, {} failed, {} skipped over {} page(s); cursor {} -> {}{}",
                        report.fetched,
                        report.outcome.succeeded,
                        report.outcome.failed,
                        report.outcome.skipped,
                        report.pages,
                        report.cursor_before,
                        report.cursor_after,
                        if report.has_more { " (more pending)" } else { "" }
                    ),
                    Err(e) => {
                        println!("{kind}: FAILED ({e})");
                        failed.push(kind);
                    }
                }
            }

            if !failed.is_empty() {
                anyhow::bail!("sync failed for {:?}", failed);
            }
        }

        Commands::SyncDrivers => {
            let pool = app::connect(&config.database).await?;
            let app = app::App::new(config, pool).await?;
            let outcome = app.sync_drivers().await?;
            println!(
                "drivers: {} stored, {} failed",
                outcome.succeeded, outcome.failed
            );
        }

        Commands::Watch => {
            let pool = app::connect(&config.database).await?;
            let app = app::App::new(config, pool).await?;
            app.watch().await?;
        }

        Commands::Cursor { command } => run_cursor_command(&config, command).await?,
    }

    telemetry::shutdown();
    Ok(())
}

async fn run_cursor_command(config: &Config, command: CursorCommand) -> anyhow::Result<()> {
    let display_tz = config.sync.display_offset()?;
    let window = window::Window::from_config(&config.sync, Arc::new(SystemClock))?;

    let db_store = match config.sync.cursor_backend {
        fleet_sync_core::config::CursorBackend::Database => {
            let pool = app::connect(&config.database).await?;
            Some(Arc::new(store::Store::new(pool)))
        }
        fleet_sync_core::config::CursorBackend::File => None,
    };
    let cursors = app::cursor_store(config, db_store)?;

    let (proposal, apply) = match command {
        CursorCommand::Show { kind } => {
            let status = admin::status(cursors.as_ref(), &window, kind, display_tz).await?;
            println!("{status}");
            return Ok(());
        }
        CursorCommand::Set { kind, start, end, tz, apply, force } => {
            let zone = admin::resolve_zone(tz.as_deref(), display_tz)?;
            let proposal = admin::propose_at(&window, kind, &start, end.as_deref(), &zone, force)?;
            (proposal, apply)
        }
        CursorCommand::Relative { kind, hours, apply } => {
            (admin::propose_relative(&window, kind, hours)?, apply)
        }
        CursorCommand::Raw { kind, token, apply, force } => {
            (admin::propose_raw(&window, kind, &token, force)?, apply)
        }
    };

    println!("{}", proposal.render(&display_tz));
    if apply {
        admin::apply(cursors.as_ref(), &proposal).await?;
        println!("written to {}", cursors.location(proposal.kind));
    } else {
        println!("dry run; pass --apply to write {}", cursors.location(proposal.kind));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> Commands {
        Cli::try_parse_from(std::iter::once("fleet-sync").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    fn metrics_on() -> TelemetryConfig {
        let mut telemetry = Config::default().telemetry;
        telemetry.metrics_enabled = true;
        telemetry
    }

    #[test]
    fn cursor_commands_never_bind_the_metrics_port() {
        for args in [
            &["cursor", "show", "--kind", "trips"][..],
            &["cursor", "relative", "--kind", "events", "--hours", "6"][..],
            &["cursor", "set", "--kind", "trips", "--start", "2024-01-05 10:30", "--tz", "America/Manaus"][..],
            &["migrate"][..],
        ] {
            assert!(!telemetry_for(&command(args), &metrics_on()).metrics_enabled, "{args:?}");
        }
    }

    #[test]
    fn sync_commands_keep_configured_metrics() {
        assert!(telemetry_for(&command(&["watch"]), &metrics_on()).metrics_enabled);
        assert!(telemetry_for(&command(&["sync", "--kind", "trips"]), &metrics_on()).metrics_enabled);

        let off = Config::default().telemetry;
        assert!(!telemetry_for(&command(&["sync-drivers"]), &off).metrics_enabled);
    }

    #[test]
    fn cursor_slots_exist_only_for_incremental_kinds() {
        assert!(Cli::try_parse_from(["fleet-sync", "cursor", "show", "--kind", "drivers"]).is_err());
    }
}
