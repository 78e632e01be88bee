use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use finsight_job::{JobConfig, StoreBackend};
use finsight_storage::PgFinanceStore;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "finsight")]
#[command(about = "Proactive finance insight detector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze every user once and print the run summary.
    Run,
    /// Serve the HTTP trigger; also runs the scheduler when enabled.
    Serve {
        #[arg(long, env = "FINSIGHT_WEB_PORT", default_value_t = finsight_web::DEFAULT_PORT)]
        port: u16,
    },
    /// Run on the cron schedule until interrupted.
    Schedule,
    /// Apply database migrations (postgres backend only).
    Migrate,
}

/// Applies to every crate in the workspace unless `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("FINSIGHT_LOG_FORMAT").is_ok_and(|v| v == "json");
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = JobConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runner = finsight_job::build_runner(&config).await?;
            let summary = runner.run_once().await.context("insight run failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve { port } => {
            let runner = Arc::new(finsight_job::build_runner(&config).await?);
            let scheduler =
                finsight_job::maybe_build_scheduler(&config, Arc::clone(&runner)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.schedule_cron, "scheduler started");
            }
            let service_key =
                SecretString::from(config.service_role_key.expose_secret().to_string());
            finsight_web::serve(runner, service_key, port).await?;
        }
        Commands::Schedule => {
            let runner = Arc::new(finsight_job::build_runner(&config).await?);
            let mut sched = finsight_job::build_scheduler(&config.schedule_cron, runner).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let StoreBackend::Postgres { database_url } = &config.backend else {
                bail!("migrate requires FINSIGHT_STORE=postgres");
            };
            let store = PgFinanceStore::connect(database_url, config.user_page_size).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
