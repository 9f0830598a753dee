//! `quarry` binary: serve the extraction service, run migrations, or
//! bootstrap an API key.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use {
    quarry_common::{hash::sha256_hex, logging},
    quarry_config::{RemoteConfig, ServiceConfig, TierTable},
    quarry_crawler::{CrawlEngine, HttpFetcher},
    quarry_extract::{ConfigResolver, FallbackExecutor},
    quarry_gateway::{AppState, auth::generate_api_key, serve},
    quarry_llm::{HttpExtractor, ProviderRegistry},
    quarry_scheduler::{CleanupLoop, IdleMonitor, Scheduler, SchedulerConfig},
    quarry_store::{AuthStore, JobStore, SqliteStore, types::ApiPrincipal},
    quarry_webhooks::{SecretCipher, WebhookDispatcher},
};

/// Drain deadline for graceful shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "quarry", about = "Quarry — LLM-powered web extraction service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway, scheduler, and webhook loops (default).
    Serve,
    /// Run database migrations and exit.
    Migrate,
    /// Mint a platform API key (bootstrap for the first admin).
    CreateApiKey {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "free")]
        tier: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
        #[arg(long, default_value_t = false)]
        byok: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::from_env().context("loading configuration")?;
    logging::init(&config.log_level, logging::LogFormat::parse(&config.log_format));

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(config).await,
        Commands::Migrate => {
            SqliteStore::new(&config.database_url).await?;
            info!("migrations applied");
            Ok(())
        },
        Commands::CreateApiKey {
            user_id,
            tier,
            admin,
            byok,
        } => {
            let store = SqliteStore::new(&config.database_url).await?;
            let api_key = generate_api_key();
            store
                .insert_api_key(&sha256_hex(&api_key), &ApiPrincipal {
                    user_id,
                    tier,
                    is_admin: admin,
                    is_byok: byok,
                })
                .await?;
            // Shown once; only the hash is stored.
            println!("{api_key}");
            Ok(())
        },
    }
}

async fn run_serve(config: ServiceConfig) -> Result<()> {
    let store = Arc::new(SqliteStore::new(&config.database_url).await?);
    let client = reqwest::Client::new();
    let registry = Arc::new(ProviderRegistry::new());
    let tiers = Arc::new(TierTable::new());
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Remote config overlay, when a bucket is configured.
    let remote = config.blocklist_bucket.as_ref().map(|bucket| {
        let remote = Arc::new(RemoteConfig::new(client.clone(), bucket.clone()));
        remote.on_log_filters(Arc::new(|directives| {
            info!(?directives, "log filter rules updated");
        }));
        remote
    });
    if let Some(remote) = &remote {
        remote.refresh(&tiers).await;
        tasks.push(remote.clone().spawn_refresh_loop(tiers.clone(), cancel.clone()));
    }

    // Mirror the effective tier table into SQLite for ClaimPending.
    store.sync_tier_limits(&tiers.snapshot()).await?;
    tasks.push(spawn_tier_sync(store.clone(), tiers.clone(), cancel.clone()));

    let cipher = match &config.encryption_key {
        Some(key) => {
            use secrecy::ExposeSecret;
            Some(Arc::new(SecretCipher::from_hex(key.expose_secret())?))
        },
        None => {
            warn!("ENCRYPTION_KEY not set: webhook secrets will be stored unencrypted");
            None
        },
    };

    let fetcher = Arc::new(HttpFetcher::new(
        client.clone(),
        config.request_timeout,
        config.render_service_url.clone(),
    ));
    let extractor = Arc::new(HttpExtractor::new(
        client.clone(),
        registry.clone(),
        config.llm_request_timeout,
    ));
    let executor = Arc::new(FallbackExecutor::new(extractor, store.clone()));
    let resolver = Arc::new(ConfigResolver::new(
        store.clone(),
        store.clone(),
        registry.clone(),
        remote.clone(),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        store.clone(),
        store.clone(),
        client.clone(),
        cipher.clone(),
    ));
    let engine = Arc::new(CrawlEngine::new(fetcher.clone(), executor.clone()));

    let idle = config.idle_timeout.map(IdleMonitor::new);
    if let Some(idle) = &idle {
        tasks.push(idle.clone().spawn_watch(cancel.clone()));
    }

    // Scheduler worker loops.
    let mut scheduler = Scheduler::new(
        store.clone(),
        engine,
        dispatcher.clone(),
        SchedulerConfig {
            workers: config.scheduler_workers,
            poll_interval: config.poll_interval,
            stale_job_age: config.stale_job_age,
        },
    );
    if let Some(idle) = &idle {
        scheduler = scheduler.with_idle_monitor(idle.clone());
    }
    let scheduler_handle = tokio::spawn(Arc::new(scheduler).run(cancel.clone()));

    tasks.push(dispatcher.clone().spawn_retry_loop(cancel.clone()));
    if config.cleanup_enabled {
        let cleanup = Arc::new(CleanupLoop::new(store.clone(), config.cleanup_interval));
        tasks.push(cleanup.spawn(cancel.clone()));
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        jobs: store.clone(),
        chains: store.clone(),
        keys: store.clone(),
        auth: store.clone(),
        webhooks: store.clone(),
        registry,
        resolver,
        executor,
        fetcher,
        dispatcher,
        tiers,
        remote,
        cipher,
        idle: idle.clone(),
    });

    // Shutdown on ctrl-c, SIGTERM, or the idle monitor.
    let shutdown = cancel.clone();
    let idle_shutdown = idle.as_ref().map(|m| m.shutdown_token());
    tokio::spawn(async move {
        let idle_fired = async {
            match idle_shutdown {
                Some(token) => token.cancelled_owned().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            () = terminate_signal() => info!("terminate received"),
            () = idle_fired => info!("idle shutdown"),
        }
        shutdown.cancel();
    });

    let server_handle = tokio::spawn(serve(state, cancel.clone()));
    cancel.cancelled().await;

    // Drain order: workers finish their jobs, then the listener closes,
    // each bounded by the shutdown deadline.
    if tokio::time::timeout(SHUTDOWN_DEADLINE, scheduler_handle)
        .await
        .is_err()
    {
        warn!("scheduler did not drain within the shutdown deadline");
    }
    match tokio::time::timeout(SHUTDOWN_DEADLINE, server_handle).await {
        Ok(joined) => joined??,
        Err(_) => warn!("listener did not close within the shutdown deadline"),
    }
    for task in tasks {
        task.abort();
    }
    info!("shutdown complete");
    Ok(())
}

fn spawn_tier_sync(
    store: Arc<SqliteStore>,
    tiers: Arc<TierTable>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(300)) => {},
                () = cancel.cancelled() => break,
            }
            if let Err(e) = store.sync_tier_limits(&tiers.snapshot()).await {
                warn!(error = %e, "tier limit sync failed");
            }
        }
    })
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        },
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending().await
}
