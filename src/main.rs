use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gordon::config::{ConfigService, Settings};
use gordon::containers::{ContainerEvents, ContainerService, EnvLoader};
use gordon::events::{Event, EventBus};
use gordon::grpc::{AdminServer, AuthService, CoreServer, SecretsServer, WatcherEvents, WatcherSet};
use gordon::health::HealthService;
use gordon::logs::LogService;
use gordon::proxy::{ProxyEvents, ProxyService};
use gordon::rate_limit::RateLimiter;
use gordon::registry::RegistryService;
use gordon::runtime::{running_in_container, ContainerRuntime, DockerRuntime};
use gordon::scheduler::{Schedule, Scheduler};
use gordon::secrets::{
    EnvProvider, FileProvider, PassProvider, SecretResolver, SopsProvider, TokenStore,
};
use gordon::storage::{BlobStore, ManifestStore};
use gordon::{create_registry_app, AppState};

/// How often stale upload sessions and unreferenced blobs are collected.
const PRUNE_UPLOAD_AGE: Duration = Duration::from_secs(24 * 3600);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "gordon", version, about = "Container platform: registry, proxy, deployments")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "gordon.toml")]
    config: PathBuf,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(&args.config).context("loading configuration")?;
    if let Some(data_dir) = args.data_dir {
        settings.server.data_dir = data_dir;
    }
    let data_dir = settings.server.data_dir.clone();
    std::fs::create_dir_all(&data_dir).context("creating data directory")?;

    let log_file = init_tracing(&settings, &data_dir)?;
    tracing::info!(version = gordon::VERSION, data_dir = %data_dir.display(), "starting");

    // Stores and the event bus.
    let events = Arc::new(EventBus::new());
    let blobs = Arc::new(BlobStore::new(&data_dir)?);
    let manifests = Arc::new(ManifestStore::new(&data_dir)?);
    let registry = Arc::new(RegistryService::new(
        blobs,
        manifests,
        Arc::clone(&events),
    ));
    let config = Arc::new(ConfigService::new(
        &args.config,
        settings.clone(),
        Arc::clone(&events),
    ));

    // Secrets, env and tokens.
    let tokens = Arc::new(TokenStore::open(&data_dir)?);
    let mut resolver = SecretResolver::new();
    resolver.register(Arc::new(EnvProvider));
    resolver.register(Arc::new(FileProvider::new(data_dir.join("secrets"))));
    resolver.register(Arc::new(PassProvider));
    resolver.register(Arc::new(SopsProvider));
    let resolver = Arc::new(resolver);
    let env_loader = Arc::new(EnvLoader::new(&data_dir, Arc::clone(&resolver))?);

    // Controller, proxy, probing.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let log_service = Arc::new(LogService::new(log_file, Arc::clone(&runtime)));
    let containers = ContainerService::new(
        Arc::clone(&runtime),
        Arc::clone(&config),
        env_loader,
        Arc::clone(&log_service),
        Arc::clone(&events),
        data_dir.clone(),
        running_in_container(),
    )?;
    let proxy = ProxyService::new(Arc::clone(&config), Arc::clone(&containers))?;
    let health = HealthService::new(
        Arc::clone(&config),
        Arc::clone(&containers),
        Arc::clone(&proxy),
    )?;
    let watchers = WatcherSet::new();

    // Subscriber order fixes delivery order: controller first, then proxy
    // invalidation, then watcher fan-out.
    events.subscribe(Arc::new(ContainerEvents(Arc::clone(&containers))));
    events.subscribe(Arc::new(ProxyEvents(Arc::clone(&proxy))));
    events.subscribe(Arc::new(WatcherEvents {
        watchers: Arc::clone(&watchers),
        config: Arc::clone(&config),
    }));

    // Background jobs.
    let scheduler = Arc::new(Scheduler::new());
    {
        let registry = Arc::clone(&registry);
        scheduler.register("registry-prune", "prune unreferenced blobs", Schedule::Daily, move || {
            let registry = Arc::clone(&registry);
            Box::pin(async move {
                let report = registry.prune(PRUNE_UPLOAD_AGE).await?;
                tracing::info!(
                    blobs_removed = report.blobs_removed,
                    uploads_removed = report.uploads_removed,
                    "prune finished"
                );
                Ok(())
            })
        });
    }

    // gRPC services.
    let auth = Arc::new(AuthService::from_env(Arc::clone(&tokens)));
    let core = CoreServer::new(
        Arc::clone(&proxy),
        Arc::clone(&config),
        Arc::clone(&events),
        Arc::clone(&watchers),
    );
    let admin = AdminServer::new(
        Arc::clone(&auth),
        Arc::clone(&config),
        Arc::clone(&containers),
        Arc::clone(&health),
        Arc::clone(&log_service),
    );
    let secrets_server = SecretsServer::new(Arc::clone(&auth), Arc::clone(&resolver));

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // Registry HTTP surface.
    let registry_addr = SocketAddr::from(([0, 0, 0, 0], settings.server.registry_port));
    let limiter = Arc::new(RateLimiter::new(50.0, 100));
    let registry_app = create_registry_app(AppState {
        registry: Arc::clone(&registry),
        limiter,
    });
    tasks.spawn(serve_http(registry_addr, registry_app, cancel.clone(), "registry"));

    // Proxy surface: every request falls through to domain resolution.
    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    let proxy_app = Router::new()
        .fallback(gordon::proxy::handle)
        .with_state(Arc::clone(&proxy));
    tasks.spawn(serve_http(proxy_addr, proxy_app, cancel.clone(), "proxy"));

    // gRPC surface.
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], settings.server.grpc_port));
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = gordon::grpc::serve(grpc_addr, core, admin, secrets_server, cancel).await
            {
                tracing::error!(error = %e, "grpc server exited");
            }
        });
    }

    // Periodic work.
    tasks.spawn(Arc::clone(&health).run(HEALTH_INTERVAL, cancel.clone()));
    tasks.spawn(Arc::clone(&scheduler).run(cancel.clone()));

    // Bring declared routes up, then let the bus fan out the initial sync.
    if let Err(e) = containers.auto_start().await {
        tracing::warn!(error = %e, "initial reconciliation failed");
    }
    events.publish(Event::ManualReload);

    shutdown_signal().await;
    tracing::info!("shutting down");
    cancel.cancel();
    containers.shutdown().await;
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn serve_http(addr: SocketAddr, app: Router, cancel: CancellationToken, name: &'static str) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, error = %e, "{name} listener failed to bind");
            cancel.cancel();
            return;
        }
    };
    tracing::info!(%addr, "{name} listening");
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned());
    if let Err(e) = server.await {
        tracing::error!(error = %e, "{name} server exited");
    }
}

/// Sets up the subscriber and returns the process log path when file
/// logging is enabled, for the log service to tail.
fn init_tracing(settings: &Settings, data_dir: &std::path::Path) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));

    if settings.logging.enabled {
        let dir = settings
            .logging
            .dir
            .clone()
            .unwrap_or_else(|| data_dir.to_path_buf());
        std::fs::create_dir_all(&dir).context("creating log directory")?;
        let path = dir.join("gordon.log");
        let writer = gordon::logs::RollingWriter::open(
            path.clone(),
            settings.logging.max_size,
            settings.logging.max_backups,
            settings.logging.max_age,
        )
        .context("opening log file")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .init();
        Ok(Some(path))
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        Ok(None)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
