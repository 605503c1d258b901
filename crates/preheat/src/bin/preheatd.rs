//! preheatd - image preheating control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use preheat::config::Settings;
use preheat::job::preheat_params;
use preheat::models::{Instance, PreheatImage, Query};
use preheat::provider::{DriverContext, DriverRegistry, HttpClient};
use preheat::store::{
    HistoryStore, HttpRegistryClient, MemoryHistoryStore, MemoryInstanceStore, TokenEndpointService,
    TokenService,
};
use preheat::{reconcile, Controller, Job, Monitor, PreheatError, PreheatJob, PreheatResult};

/// preheatd - push image manifests to P2P providers ahead of demand.
#[derive(Parser)]
#[command(name = "preheatd")]
#[command(about = "Image preheating control plane")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file
    #[arg(long, global = true, env = "PREHEAT_CONFIG", default_value = "preheat.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the registered provider drivers
    Providers,

    /// Probe every configured instance once
    Check,

    /// Run the monitor for the configured instances until Ctrl-C
    Serve,

    /// Preheat images on every enabled healthy instance
    Preheat {
        /// Images as namespace/name:tag
        #[arg(required = true)]
        images: Vec<String>,

        /// Seconds to keep tracking submitted tasks
        #[arg(long, default_value = "60")]
        wait_secs: u64,
    },

    /// Run a single preheat job to completion (Ctrl-C stops it)
    Job {
        /// Instance as JSON
        #[arg(long)]
        provider: String,

        /// Preheat image as JSON
        #[arg(long)]
        image: String,
    },
}

/// Token collaborator used when no token realm is configured.
struct NoTokenRealm;

#[async_trait]
impl TokenService for NoTokenRealm {
    async fn mint(&self, repository: &str, _actions: &[String]) -> PreheatResult<String> {
        Err(PreheatError::Validation(format!(
            "cannot mint token for {repository}: registry.token_realm is not configured"
        )))
    }
}

struct Stack {
    controller: Controller,
    monitor: Arc<Monitor>,
    history: Arc<MemoryHistoryStore>,
    registry: Arc<DriverRegistry>,
}

fn build(settings: &Settings) -> Result<Stack> {
    let instances = Arc::new(MemoryInstanceStore::new());
    let history = Arc::new(MemoryHistoryStore::new());

    let tokens: Arc<dyn TokenService> =
        match TokenEndpointService::from_config(&settings.registry, &settings.transport)? {
            Some(service) => Arc::new(service),
            None => {
                warn!("registry.token_realm not set, preheat requests will fail");
                Arc::new(NoTokenRealm)
            }
        };

    let context = DriverContext {
        http: HttpClient::new(&settings.transport).context("building HTTP clients")?,
        registry: Arc::new(HttpRegistryClient::new(
            &settings.registry,
            &settings.transport,
            Some(Arc::clone(&tokens)),
        )?),
        history: history.clone(),
    };
    let registry = Arc::new(DriverRegistry::builtin(context));

    let monitor = Arc::new(Monitor::new(
        instances.clone(),
        history.clone(),
        Arc::clone(&registry),
        settings.monitor.clone(),
    ));
    let controller = Controller::new(
        instances,
        history.clone(),
        Arc::clone(&registry),
        tokens,
        monitor.clone(),
        settings.registry.external_endpoint.clone(),
    );

    Ok(Stack {
        controller,
        monitor,
        history,
        registry,
    })
}

/// Register the configured instances, skipping ones that clash.
async fn seed(controller: &Controller, instances: &[Instance]) -> Result<()> {
    for instance in instances {
        match controller.create_instance(instance.clone()).await {
            Ok(id) => info!(instance = %instance.name, instance_id = id, "Registered instance"),
            Err(e) if e.is_conflict() => {
                warn!(instance = %instance.name, error = %e, "Skipping duplicate instance");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("registering instance {}", instance.name))
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait until no tracked task is live or `limit` runs out.
async fn wait_for_history(history: &MemoryHistoryStore, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        let rows = history.list(&Query::all()).await?;
        let live = rows.iter().filter(|r| !r.status.is_terminal()).count();
        if live == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(live, "Stopped waiting with tasks still in flight");
            return Ok(());
        }
        sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("preheat=debug,preheatd=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("preheat=info,preheatd=info,warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let settings = Settings::load(&cli.config).await?;
    let stack = build(&settings)?;

    match cli.command {
        Commands::Providers => print_json(&stack.controller.list_providers())?,

        Commands::Check => {
            let mut unhealthy = 0;
            for instance in &settings.instances {
                match stack.controller.check_health(instance).await {
                    Ok(()) => println!("{}\thealthy", instance.name),
                    Err(e) => {
                        unhealthy += 1;
                        println!("{}\tunhealthy\t{e}", instance.name);
                    }
                }
            }
            if unhealthy > 0 {
                anyhow::bail!("{unhealthy} instance(s) unhealthy");
            }
        }

        Commands::Serve => {
            seed(&stack.controller, &settings.instances).await?;
            let cancel = CancellationToken::new();
            let handle = stack.monitor.start(cancel.clone())?;
            reconcile(stack.history.as_ref(), stack.monitor.as_ref()).await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            cancel.cancel();
            handle.join().await;
        }

        Commands::Preheat { images, wait_secs } => {
            seed(&stack.controller, &settings.instances).await?;
            let cancel = CancellationToken::new();
            let handle = stack.monitor.start(cancel.clone())?;
            reconcile(stack.history.as_ref(), stack.monitor.as_ref()).await?;

            let results = stack.controller.preheat_images(&images).await?;
            print_json(&results)?;

            wait_for_history(&stack.history, Duration::from_secs(wait_secs)).await?;
            let (_, rows) = stack.controller.load_history(&Query::all()).await?;
            print_json(&rows)?;

            cancel.cancel();
            handle.join().await;
        }

        Commands::Job { provider, image } => {
            let instance: Instance =
                serde_json::from_str(&provider).context("parsing --provider")?;
            let image: PreheatImage = serde_json::from_str(&image).context("parsing --image")?;
            let params = preheat_params(&instance, &image)?;

            let job = PreheatJob::new(Arc::clone(&stack.registry), settings.job.clone());
            job.validate(&params)?;

            let stop = CancellationToken::new();
            let on_signal = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            job.run(&stop, &params).await?;
            info!(instance = %instance.name, image = %image.image_name, "Preheat job finished");
        }
    }

    Ok(())
}
