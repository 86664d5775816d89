use hotify::config::Config;
use hotify::git::GitCli;
use hotify::proxy::{CaddyPublisher, ProxyPublisher, RouteTable};
use hotify::registry::Registry;
use hotify::server::{ControlPlane, ControlState, PKG_NAME, VERSION};
use hotify::store::{ConfigStore, TomlConfigStore};
use hotify::supervisor::SupervisorOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hotify=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let generated_secret = config.secret.is_empty();
    if generated_secret {
        config.secret = uuid::Uuid::new_v4().simple().to_string();
    }

    let store = Arc::new(TomlConfigStore::new(&config_path, config.clone()));

    if generated_secret {
        store.save(&config.services)?;
        warn!(
            secret = %config.secret,
            path = %config_path.display(),
            "No API secret configured, generated one and saved it"
        );
    }

    print_startup_banner(&config);

    let proxy: Arc<dyn ProxyPublisher> = match &config.caddy {
        Some(caddy) => {
            info!(admin_url = %caddy.admin_url, server = %caddy.server, "Publishing routes to Caddy");
            Arc::new(CaddyPublisher::new(&caddy.admin_url, &caddy.server)?)
        }
        None => {
            warn!("No [caddy] section configured, routes are tracked in-process only");
            Arc::new(RouteTable::new())
        }
    };

    let registry = Arc::new(Registry::new(
        store,
        Arc::new(GitCli::new()),
        proxy,
        config.services_path.clone(),
        SupervisorOptions {
            stop_timeout: config.stop_timeout(),
            max_log_lines: config.max_log_lines,
        },
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_plane =
        ControlPlane::bind(&config.address, ControlState::new(config.clone(), Arc::clone(&registry)))
            .await
            .map_err(|e| {
                error!(address = %config.address, error = %e, "Failed to start control plane");
                e
            })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = control_plane.run(shutdown_rx).await {
            error!(error = %e, "Control plane error");
        }
    });

    // Bring up persisted services while already serving requests
    let init_registry = Arc::clone(&registry);
    let init_handle = tokio::spawn(async move {
        if let Err(e) = init_registry.init().await {
            error!(error = %e, "Failed to load services");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Services still being provisioned would be started after the sweep
    let _ = init_handle.await;

    info!("Stopping all services...");
    registry.stop_all().await;

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting deploy daemon");
    info!(
        address = %config.address,
        services_path = %config.services_path.display(),
        stop_timeout_secs = config.stop_timeout_secs,
        max_log_lines = config.max_log_lines,
        caddy = config.caddy.is_some(),
        "Server configuration"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.services.keys().collect::<Vec<_>>(),
        "Configured services"
    );
}
