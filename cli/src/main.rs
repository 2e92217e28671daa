mod commands;
mod config;
mod peer;
mod server;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    cmd_cache_list, cmd_cache_prune, cmd_history, cmd_schedule_assign, cmd_schedule_clear,
    cmd_schedule_show, cmd_simulate, cmd_template_add_block, cmd_template_create,
    cmd_template_list, cmd_today,
};
use crate::config::Config;
use stepsync_core::cache::DeltaCache;
use stepsync_core::db::Database;

#[derive(Parser)]
#[command(
    name = "stepsync",
    version,
    about = "Step ledger and schedule progress for a wrist sensor + handheld pair"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show today's steps against the scheduled targets
    Today {
        /// Date to show (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show ledger totals for the last N days
    History {
        /// Number of days to show
        #[arg(short, long, default_value = "7")]
        days: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage day templates and their time blocks
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },
    /// Bind templates to days of the week
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Inspect the sensor unit's delta cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Run a sensor and handheld unit against each other over an in-memory link
    Simulate {
        /// Cumulative daily step readings, in order (e.g. 0 120 480 900)
        #[arg(required = true)]
        readings: Vec<u64>,
        /// Sensor battery level as a fraction (0.0-1.0)
        #[arg(long, default_value = "0.8")]
        battery: f64,
        /// Keep the link down until this reading index (past the end: connect after the last)
        #[arg(long)]
        offline_until: Option<usize>,
        /// Minutes of simulated time between readings
        #[arg(long, default_value = "1")]
        interval: i64,
        /// Write to the real handheld and sensor databases instead of in-memory ones
        #[arg(long)]
        persist: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the handheld engine behind an HTTP peer endpoint
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Create an empty template
    Create {
        /// Template name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a time block to a template
    AddBlock {
        /// Template name
        template: String,
        /// Block name (e.g. "Morning walk")
        name: String,
        /// Start time (HH:MM)
        #[arg(long)]
        start: String,
        /// End time (HH:MM); earlier than start means the block runs past midnight
        #[arg(long)]
        end: String,
        /// Step target for the block
        #[arg(long)]
        target: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List templates with their blocks
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Assign a template to one or more days
    Assign {
        /// Template name
        template: String,
        /// Day(s): monday-sunday, mon-sun, weekdays, weekends, all (default: all)
        #[arg(long, default_value = "all")]
        day: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the weekly schedule
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove day assignments
    Clear {
        /// Day(s) to clear: monday-sunday, mon-sun, weekdays, weekends, all (default: all)
        #[arg(long)]
        day: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached increments
    List {
        /// Only rows not yet handed to the handheld unit
        #[arg(long)]
        unsynced: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop cached increments older than the retention window
    Prune {
        /// Retention in hours (default: 48)
        #[arg(long)]
        hours: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stepsync=info,stepsync_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Today { date, json } => {
            cmd_today(&Database::open(&config.handheld_db_path)?, date, json)
        }
        Commands::History { days, json } => {
            cmd_history(&Database::open(&config.handheld_db_path)?, days, json)
        }
        Commands::Template { command } => {
            let db = Database::open(&config.handheld_db_path)?;
            match command {
                TemplateCommands::Create { name, json } => cmd_template_create(&db, &name, json),
                TemplateCommands::AddBlock {
                    template,
                    name,
                    start,
                    end,
                    target,
                    json,
                } => cmd_template_add_block(&db, &template, &name, &start, &end, target, json),
                TemplateCommands::List { json } => cmd_template_list(&db, json),
            }
        }
        Commands::Schedule { command } => {
            let db = Database::open(&config.handheld_db_path)?;
            match command {
                ScheduleCommands::Assign {
                    template,
                    day,
                    json,
                } => cmd_schedule_assign(&db, &template, &day, json),
                ScheduleCommands::Show { json } => cmd_schedule_show(&db, json),
                ScheduleCommands::Clear { day, json } => {
                    cmd_schedule_clear(&db, day.as_deref(), json)
                }
            }
        }
        Commands::Cache { command } => {
            let cache = DeltaCache::new(Arc::new(Mutex::new(Database::open(
                &config.sensor_db_path,
            )?)));
            match command {
                CacheCommands::List { unsynced, json } => cmd_cache_list(&cache, unsynced, json),
                CacheCommands::Prune { hours, json } => cmd_cache_prune(&cache, hours, json),
            }
        }
        Commands::Simulate {
            readings,
            battery,
            offline_until,
            interval,
            persist,
            json,
        } => {
            let dbs = if persist {
                Some((
                    Database::open(&config.handheld_db_path)?,
                    Database::open(&config.sensor_db_path)?,
                ))
            } else {
                None
            };
            cmd_simulate(readings, battery, offline_until, interval, dbs, json).await
        }
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let (api_key, new_api_key) = if no_auth {
                (None, false)
            } else {
                let (key, new) = config.load_or_create_api_key()?;
                (Some(key), new)
            };
            let db = Database::open(&config.handheld_db_path)?;
            server::start_server(db, port, &bind, api_key, new_api_key).await
        }
    }
}
