mod app;
mod auth;
mod cursor;
mod gate;
mod model;
mod pipeline;
mod poller;
mod source;
mod store;
mod timefmt;

use clap::{Parser, Subcommand};
use harvester_core::{telemetry, Config};
use sqlx::postgres::PgPoolOptions;
use std::process;
use tracing::{error, info};

#[derive(Parser)]
#[clap(name = "harvester")]
#[clap(about = "Incremental event-log harvester", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Run the continuous harvest loop
    Run {
        /// Override the initial boundary timestamp when no checkpoint exists (RFC3339)
        #[clap(long, env = "HARVEST_START")]
        start: Option<chrono::DateTime<chrono::Utc>>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut config =
        Config::load().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    telemetry::init(&config.telemetry)?;

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            config.database.connect_timeout_secs,
        ))
        .idle_timeout(std::time::Duration::from_secs(
            config.database.idle_timeout_secs,
        ))
        .connect(&config.database.url)
        .await?;

    match cli.command {
        Commands::Migrate => {
            info!("running database migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
            info!("migrations completed");
        }

        Commands::Run { start } => {
            if let Some(start) = start {
                config.poll.start_from = Some(start);
            }

            info!(
                base_url = %config.source.base_url,
                start = ?config.poll.start_from,
                "starting harvester"
            );

            let app = app::App::new(config, pool).await?;
            app.run().await?;
        }
    }

    telemetry::shutdown();
    Ok(())
}
