use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use auth_catalog::{
    BackendConnection, BackendTarget, Catalog, Loader, LoaderOptions, MysqlBackend, PersistOptions,
    Persister,
};
use clap::Parser;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Loads, periodically refreshes, and persists a MySQL-compatible proxy's
/// user authentication catalog. This binary only exercises the library's
/// load/refresh/persist surface; it does not run a proxy listener.
#[derive(Parser, Debug, Clone)]
#[command(name = "auth-catalog-cli", author, version)]
struct AuthCatalogArgs {
    /// `host:port` of each backend to load grants from. May be repeated.
    #[arg(long = "backend", required = true)]
    backends: Vec<String>,

    /// Username used to connect to each backend for catalog loading.
    #[arg(long, default_value = "catalog_reader")]
    backend_user: String,

    /// Password used to connect to each backend for catalog loading.
    #[arg(long, default_value = "")]
    backend_password: String,

    /// Where the catalog snapshot is persisted between restarts.
    #[arg(long, default_value = "auth-catalog.bin")]
    catalog_file: PathBuf,

    /// Seconds between background catalog refreshes.
    #[arg(long, default_value_t = 60)]
    refresh_interval_secs: u64,

    /// Include the `root` account's rows in the catalog.
    #[arg(long, default_value_t = false)]
    enable_root: bool,

    /// Skip the zero-row sanity `SELECT` against each grant table.
    #[arg(long, default_value_t = false)]
    skip_permission_checks: bool,

    #[arg(long)]
    log_level: Option<String>,
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => "ctrl_c",
        _ = terminate => "terminate",
    }
}

fn connect_backends(args: &AuthCatalogArgs) -> Vec<(BackendTarget, Box<dyn BackendConnection>)> {
    args.backends
        .iter()
        .filter_map(|addr| {
            let target = BackendTarget {
                addr: addr.clone(),
                connect_timeout: Duration::from_secs(5),
                read_timeout: Duration::from_secs(10),
                write_timeout: Duration::from_secs(10),
            };
            match MysqlBackend::connect(
                addr,
                &args.backend_user,
                &args.backend_password,
                target.connect_timeout,
            ) {
                Ok(conn) => Some((target, Box::new(conn) as Box<dyn BackendConnection>)),
                Err(e) => {
                    warn!(%addr, error = %e, "failed to set up backend connection pool");
                    None
                }
            }
        })
        .collect()
}

async fn refresh_loop(
    catalog: Arc<Catalog>,
    loader: Arc<Loader>,
    backends: Vec<(BackendTarget, Box<dyn BackendConnection>)>,
    persister: Arc<Persister>,
    interval: Duration,
    mut shutdown_rx: Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = loader.refresh(&catalog, &backends).await;
                info!(
                    rows = report.rows_loaded,
                    databases = report.databases_loaded,
                    "catalog refresh complete"
                );
                if let Err(e) = persister.save(&catalog) {
                    warn!(error = %e, "failed to persist catalog after refresh");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() {
                    break;
                }
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = AuthCatalogArgs::parse();

    let log_level_string = args.log_level.clone().unwrap_or_else(|| "INFO".to_string());
    let level = Level::from_str(&log_level_string)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,mysql_async=INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("auth-catalog")
        .build()?;

    info!(?args, "auth-catalog-cli starting");

    let catalog = Arc::new(Catalog::new());
    let persister = Arc::new(Persister::new(PersistOptions {
        path: args.catalog_file.clone(),
    }));

    if persister.load(&catalog)? {
        info!("primed catalog from persisted snapshot before first load");
    }

    let loader = Arc::new(Loader::new(LoaderOptions {
        skip_permission_checks: args.skip_permission_checks,
        enable_root: args.enable_root,
        ..LoaderOptions::default()
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    runtime.block_on(async {
        let backends = connect_backends(&args);
        let report = loader.load(&catalog, &backends).await;
        info!(
            rows = report.rows_loaded,
            databases = report.databases_loaded,
            "initial catalog load complete"
        );
        persister.save(&catalog)?;

        let refresh_handle = tokio::spawn(refresh_loop(
            Arc::clone(&catalog),
            Arc::clone(&loader),
            backends,
            Arc::clone(&persister),
            Duration::from_secs(args.refresh_interval_secs),
            shutdown_rx,
        ));

        let reason = shutdown_signal().await;
        info!(%reason, "auth-catalog-cli shutting down");
        shutdown_tx.send(true).ok();
        refresh_handle.await.ok();
        persister.save(&catalog)?;

        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
