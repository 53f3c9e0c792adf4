use std::sync::Arc;
use std::time::Duration;

use adipura::auth::LocalAuth;
use adipura::config::{Cli, Config, default_config_dir, default_config_path};
use adipura::handler::AppState;
use adipura::prefs::Preferences;
use adipura::routes;
use adipura::store::LocalStore;
use clap::Parser;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    // --config puts data (database, device preferences) next to the config file,
    // otherwise both live in ~/.adipura/
    let (config_path, data_dir) = match args.config_path {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| std::path::PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("adipura.svc starting");

    let cfg = Config::new(&config_path.to_string_lossy()).unwrap_or_else(|e| {
        tracing::error!(error = %e, path = ?config_path, "failed to load config file");
        std::process::exit(1);
    });
    let store = Arc::new(LocalStore::new(&cfg, &data_dir).await.unwrap_or_else(|e| {
        tracing::error!(error = %adipura::unpack_error(&e), "failed to setup store");
        std::process::exit(1);
    }));
    let preferences = Arc::new(
        Preferences::load(&data_dir.join("device.json"))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to load device preferences");
                std::process::exit(1);
            }),
    );
    let auth = Arc::new(LocalAuth::new(store.clone()));
    let state = AppState::new(&cfg, store.clone(), auth, preferences);

    let address = format!("0.0.0.0:{}", cfg.app.get_port());
    let cancellation_token = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    if LocalStore::is_replica(&cfg.app.turso_url, &cfg.app.turso_auth_token) {
        let sync_store = store.clone();
        let sync_token = cancellation_token.clone();
        let sync_done = shutdown_complete_tx.clone();
        let period = Duration::from_secs(cfg.app.sync_interval_seconds.max(1));
        tokio::spawn(async move {
            let _sync_done = sync_done;
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = sync_store.sync().await {
                            tracing::warn!(error = %e, "replica sync failed");
                        }
                    }
                    _ = sync_token.cancelled() => {
                        if let Err(e) = sync_store.sync().await {
                            tracing::warn!(error = %e, "final replica sync failed");
                        }
                        tracing::info!("replica sync task shutting down");
                        break;
                    }
                }
            }
        });
    }

    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(&address).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to setup tcp listener");
        std::process::exit(1);
    });

    tracing::info!("adipura.svc running on {}", &address);
    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "server stopped unexpectedly");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            tracing::info!("ctrl+c signal received, preparing to shutdown");
            cancellation_token.cancel();
        }
    }

    drop(shutdown_complete_tx);
    shutdown_complete_rx.recv().await;
    tracing::info!("adipura.svc going off, graceful shutdown complete");
}
