use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use hazardwatch::config::HazardwatchConfig;
use hazardwatch::detect::AlertLevel;
use hazardwatch::model::{BoundingBox, HazardType};
use hazardwatch::registry::{HotspotEvent, HotspotFilter, HotspotSet};
use hazardwatch::storage::{HotspotStore, SqliteStore};

#[derive(Parser)]
#[command(
    name = "hazardwatch",
    about = "Geospatial hotspot detection for citizen hazard reports",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path
    #[arg(long, global = true, env = "HAZARDWATCH_DB")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + alert log)
    Serve,

    /// Load reports and social signals from a JSON array or JSON-lines file
    Ingest {
        /// Input file
        file: PathBuf,

        /// Run clustering once after ingesting
        #[arg(long)]
        run: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run one clustering pass now
    Run {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List active hotspots
    Hotspots {
        /// Bounding box as south,west,north,east
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<BoundingBox>,

        /// Minimum alert level (info, warning, alert, emergency)
        #[arg(long)]
        min_level: Option<AlertLevel>,

        /// Only hotspots of this dominant hazard type
        #[arg(long)]
        hazard: Option<HazardType>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Report and hotspot statistics
    Stats {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recent clustering runs
    History {
        /// Number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HazardwatchConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.database {
        config.storage.database_path = db;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting hazardwatch daemon");
            hazardwatch::serve(config).await?;
        }
        Commands::Ingest { file, run, json } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let records = hazardwatch::intake::parse_batch(&text)
                .with_context(|| format!("failed to parse {}", file.display()))?;

            let service = hazardwatch::open_service(&config).await?;
            let summary = hazardwatch::intake::ingest_batch(&service, records).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Ingested {}: {} accepted, {} duplicate, {} ineligible, {} withdrawn, {} signals, {} invalid",
                    file.display(),
                    summary.accepted,
                    summary.duplicate,
                    summary.ineligible,
                    summary.withdrawn,
                    summary.signals,
                    summary.invalid
                );
            }
            if run {
                let report = service.run_once(Utc::now()).await?;
                print_run(&report.record, &report.events, json)?;
            }
        }
        Commands::Run { json } => {
            let service = hazardwatch::open_service(&config).await?;
            let report = service.run_once(Utc::now()).await?;
            print_run(&report.record, &report.events, json)?;
        }
        Commands::Hotspots {
            bbox,
            min_level,
            hazard,
            json,
        } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let active: HotspotSet = store.load_active()?.into_iter().collect();
            let filter = HotspotFilter {
                bbox,
                min_alert_level: min_level,
                hazard_type: hazard,
            };
            let hotspots = active.query(&filter);

            if json {
                println!("{}", serde_json::to_string_pretty(&hotspots)?);
            } else if hotspots.is_empty() {
                println!("No active hotspots.");
            } else {
                println!(
                    "{:<8} | {:<9} | {:<13} | {:>7} | {:>5} | {:<19} | Name",
                    "ID", "Level", "Hazard", "Reports", "Conf", "Center"
                );
                println!("{:-<8}-|-{:-<9}-|-{:-<13}-|-{:->7}-|-{:->5}-|-{:-<19}-|-{:-<30}", "", "", "", "", "", "", "");
                for h in hotspots {
                    let id = h.id.to_string();
                    println!(
                        "{:<8} | {:<9} | {:<13} | {:>7} | {:>5.2} | {:<19} | {}",
                        &id[..8],
                        h.alert_level,
                        h.dominant_hazard_type,
                        h.report_count,
                        h.confidence_score,
                        format!("{:.4},{:.4}", h.center_latitude, h.center_longitude),
                        h.name
                    );
                }
            }
        }
        Commands::Stats { json } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let reports = store.load_all_reports()?;
            let hotspots = store.load_active()?;
            let report_stats = hazardwatch::stats::report_statistics(&reports, Utc::now());
            let hotspot_stats = hazardwatch::stats::hotspot_statistics(&hotspots);

            if json {
                let out = serde_json::json!({
                    "reports": report_stats,
                    "hotspots": hotspot_stats,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("\n=== Reports ===");
                println!("Total:          {}", report_stats.total_reports);
                println!(
                    "Last {} days:   {}",
                    hazardwatch::stats::RECENT_WINDOW_DAYS,
                    report_stats.recent_reports
                );
                for (status, count) in &report_stats.by_status {
                    println!("  {:<14} {}", status.as_str(), count);
                }
                println!("By severity:");
                for (severity, count) in &report_stats.by_severity {
                    println!("  {:<14} {}", severity.as_str(), count);
                }
                println!("By hazard type:");
                for (hazard, count) in &report_stats.by_hazard_type {
                    println!("  {:<14} {}", hazard.as_str(), count);
                }
                println!("\n=== Hotspots ===");
                println!("Active:         {}", hotspot_stats.active_hotspots);
                println!("Member reports: {}", hotspot_stats.member_reports);
                if let Some(mean) = hotspot_stats.mean_confidence {
                    println!("Mean conf.:     {:.2}", mean);
                }
                for (level, count) in &hotspot_stats.by_alert_level {
                    println!("  {:<14} {}", level.as_str(), count);
                }
                println!();
            }
        }
        Commands::History { limit, json } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let runs = store.list_runs(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs recorded.");
            } else {
                println!(
                    "{:<20} | {:<7} | {:>7} | {:>8} | {:>7} | {:>7} | {:>7} | Error",
                    "Started", "Status", "Reports", "Clusters", "Created", "Updated", "Retired"
                );
                for r in runs {
                    println!(
                        "{:<20} | {:<7} | {:>7} | {:>8} | {:>7} | {:>7} | {:>7} | {}",
                        r.started_at.format("%Y-%m-%d %H:%M:%S"),
                        r.status,
                        r.reports_considered,
                        r.clusters_found,
                        r.created,
                        r.updated,
                        r.retired,
                        r.error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(config: &HazardwatchConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_run(
    record: &hazardwatch::scheduler::RunRecord,
    events: &[HotspotEvent],
    json: bool,
) -> Result<()> {
    if json {
        let out = serde_json::json!({ "run": record, "events": events });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("\n=== Clustering Run {} ===", record.run_id);
    println!("Reports:  {}", record.reports_considered);
    println!("Clusters: {} (noise {})", record.clusters_found, record.noise);
    println!(
        "Hotspots: {} created, {} updated, {} retired",
        record.created, record.updated, record.retired
    );
    for event in events {
        let h = event.hotspot();
        match event {
            HotspotEvent::Updated {
                previous_alert_level,
                alert_level_changed: true,
                ..
            } => println!(
                " - {:<8} {} ({} -> {})",
                event.kind(),
                h.name,
                previous_alert_level,
                h.alert_level
            ),
            HotspotEvent::Retired { reason, .. } => {
                println!(" - {:<8} {} ({})", event.kind(), h.name, reason.as_str())
            }
            _ => println!(" - {:<8} {} [{}]", event.kind(), h.name, h.alert_level),
        }
    }
    println!();
    Ok(())
}
