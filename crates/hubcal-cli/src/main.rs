use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubcal_core::SyncResult;
use hubcal_storage::{EventStore, PgEventStore};
use hubcal_sync::{apply_seed, load_seed_file, maybe_build_scheduler, FeedRequest, HubConfig};
use hubcal_web::AppState;
use tracing::{info, Subscriber};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "hubcal-cli")]
#[command(about = "Community hub event aggregation and calendar feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one source, or every active source.
    Sync {
        #[arg(long)]
        source: Option<Uuid>,
    },
    /// Apply the Postgres schema.
    Migrate,
    /// Run the HTTP server, plus the cron trigger when enabled.
    Serve {
        /// Sources file applied before serving.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Print a calendar feed to stdout.
    Feed {
        #[arg(long)]
        sources: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        internal: Option<bool>,
    },
    /// List sources with their sync health.
    Sources,
    /// Register sources from a YAML file.
    Seed { path: PathBuf },
}

fn log_layer<S, W>(json: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_writer(writer).boxed()
    }
}

/// Logs go to stderr so `feed` output on stdout stays a clean calendar.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hubcal=info"));
    let json = std::env::var_os("HUBCAL_LOG_JSON").is_some();
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer(json, std::io::stderr))
        .try_init();
}

fn print_result(label: &str, result: &SyncResult) {
    println!(
        "{label}: inserted={} updated={} unchanged={} skipped={} phase={:?}{}",
        result.inserted,
        result.updated,
        result.unchanged,
        result.skipped,
        result.phase,
        result
            .error
            .as_deref()
            .map(|e| format!(" error={e}"))
            .unwrap_or_default()
    );
    for item in &result.item_errors {
        println!("  skipped {}: {}", item.item, item.reason);
    }
}

async fn seed_from(store: &Arc<dyn EventStore>, path: &Path) -> Result<()> {
    let file = load_seed_file(path).await?;
    let summary = apply_seed(store.as_ref(), &file)
        .await
        .with_context(|| format!("applying {}", path.display()))?;
    println!(
        "seed complete: created={} updated={} unchanged={}",
        summary.created, summary.updated, summary.unchanged
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = HubConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let store = config.open_durable_store("sync").await?;
            let state = AppState::from_config(&config, store)?;
            match source {
                Some(id) => {
                    let result = state.orchestrator.sync_source(id).await?;
                    print_result(&id.to_string(), &result);
                }
                None => {
                    let reports = state.orchestrator.sync_all().await?;
                    for report in &reports {
                        match (&report.result, &report.rejected) {
                            (Some(result), _) => print_result(&report.display_name, result),
                            (None, Some(reason)) => println!("{}: not run ({reason})", report.display_name),
                            (None, None) => {}
                        }
                    }
                    println!("sync complete: sources={}", reports.len());
                }
            }
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgEventStore::connect(url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { seed } => {
            let store = config.open_store().await?;
            if let Some(path) = &seed {
                seed_from(&store, path).await?;
            }
            let state = AppState::from_config(&config, store)?;
            let scheduler = maybe_build_scheduler(&config, Arc::clone(&state.orchestrator)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduled sync enabled");
            }
            hubcal_web::serve(state, config.web_port).await?;
        }
        Commands::Feed {
            sources,
            user,
            internal,
        } => {
            let store = config.open_durable_store("feed").await?;
            let state = AppState::from_config(&config, store)?;
            let request = FeedRequest {
                sources,
                user,
                internal: internal.map(|flag| flag.to_string()),
            };
            let doc = state.composer.compose_request(&request).await?;
            print!("{}", doc.body);
        }
        Commands::Sources => {
            let store = config.open_durable_store("sources").await?;
            for source in store.list_sources().await? {
                println!(
                    "{} {} {} active={} imported={} health={:?} {}",
                    source.id,
                    source.kind,
                    source.display_name,
                    source.active,
                    source.imported_count,
                    source.health(),
                    source.url
                );
            }
        }
        Commands::Seed { path } => {
            let store = config.open_durable_store("seed").await?;
            seed_from(&store, &path).await?;
        }
    }

    Ok(())
}
