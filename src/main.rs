use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pushrelay::apns::ApnsClient;
use pushrelay::dispatch::Dispatcher;
use pushrelay::hub::{Hub, HubConfig};
use pushrelay::store::Store;
use pushrelay::{routes, AppError, AppState, Config};

/// How long in-flight requests and sockets get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    tracing::info!(db_path = %config.db_path, "starting pushrelay");

    let store = Store::connect(&config.db_path).await?;

    let hub = Hub::new(
        store.clone(),
        HubConfig {
            ping_interval: config.ws_ping_interval,
            pong_timeout: config.ws_pong_timeout,
            write_wait: Duration::from_secs(10),
            queue_size: config.ws_queue_size,
        },
    );

    let apns = match config.apns.as_ref() {
        Some(apns_cfg) => match ApnsClient::new(apns_cfg) {
            Ok(client) => {
                tracing::info!(
                    topic = %apns_cfg.topic,
                    production = apns_cfg.production,
                    "APNs client initialized"
                );
                Some(Arc::new(client))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to initialize APNs client; iOS push disabled");
                None
            }
        },
        None => {
            tracing::info!("APNs not configured, iOS push disabled");
            None
        }
    };

    if config.enable_https {
        // TLS termination is delegated to the fronting proxy; the options are
        // validated so misconfiguration surfaces at startup.
        tracing::warn!(
            cert_file = %config.cert_file,
            key_file = %config.key_file,
            "enable_https set; expecting the fronting proxy to terminate TLS"
        );
    }

    let dispatcher = Dispatcher::new(store.clone(), hub.clone(), apns);
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        hub,
        dispatcher,
    };

    spawn_housekeeping(store, config.message_ttl);

    let app = routes::build_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr())
        .await
        .map_err(|e| AppError::StartServer(format!("bind {}: {e}", config.bind_addr())))?;
    tracing::info!(addr = %config.bind_addr(), "listening");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    wait_for_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("server exited cleanly"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "server task panicked"),
        Err(_) => tracing::warn!("grace period elapsed, exiting with connections open"),
    }

    Ok(())
}

/// Periodically sweep messages past their retention age.
fn spawn_housekeeping(store: Store, ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match store.delete_older_than(ttl).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "swept expired messages"),
                Err(e) => tracing::error!(error = %e, "housekeeping sweep failed"),
            }
        }
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
