use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dealwatch::commands::CommandHandler;
use dealwatch::config::AppConfig;
use dealwatch::fetch::BrowserFetcher;
use dealwatch::notify::PriceAlerter;
use dealwatch::repo::SqliteTrackerRepo;
use dealwatch::scheduler::CheckScheduler;
use dealwatch::signal::{SignalCli, SignalListener};

#[derive(Parser)]
#[command(name = "dealwatch", about = "Price tracking over Signal group chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the listener and scheduler until interrupted (the default).
    Run,
    /// Check every tracked item once, reviving failed ones, then exit.
    CheckNow,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dealwatch=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout))
        .connect(&config.database.url)
        .await?;

    let repo = Arc::new(SqliteTrackerRepo::new(pool));
    repo.init_schema().await?;

    let fetcher = Arc::new(BrowserFetcher::new(config.fetcher.clone())?);
    let delivery = Arc::new(SignalCli::new(config.signal.clone()));
    let alerter = Arc::new(PriceAlerter::new(
        delivery.clone(),
        config.signal.group_id.clone(),
    ));
    let scheduler = Arc::new(CheckScheduler::new(
        repo.clone(),
        fetcher.clone(),
        alerter,
        config.scheduler.clone(),
    ));

    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Run => {
            info!("Starting Dealwatch...");

            let handler = Arc::new(CommandHandler::new(
                repo,
                fetcher,
                config.scheduler.check_interval,
            ));
            let listener = SignalListener::new(config.signal.clone(), handler, delivery);

            let scheduler_task = tokio::spawn(scheduler.run());
            let listener_task = tokio::spawn(async move { listener.run().await });

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            scheduler_task.abort();
            listener_task.abort();
        }
        CliCommand::CheckNow => {
            let checked = scheduler.check_all_now().await?;
            info!(checked, "manual check finished");
        }
    }

    Ok(())
}
