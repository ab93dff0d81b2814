use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotwise::auth::Authenticator;
use slotwise::clock::{Clock, SystemClock};
use slotwise::config::Config;
use slotwise::engine::Engine;
use slotwise::notify::NotifyHub;
use slotwise::{observability, reaper, wire};

const OPEN_ATTEMPTS: u32 = 5;

/// Open the journal, retrying transient failures with exponential backoff.
async fn open_engine(config: &Config, notify: Arc<NotifyHub>) -> std::io::Result<Engine> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut delay = Duration::from_millis(200);
    let mut attempt = 1;
    loop {
        match Engine::new(config.wal_path(), notify.clone(), clock.clone(), config.write_timeout) {
            Ok(engine) => return Ok(engine),
            Err(e) if attempt < OPEN_ATTEMPTS => {
                tracing::warn!("opening store failed (attempt {attempt}/{OPEN_ATTEMPTS}): {e}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_tracing();
    let config = Config::from_env();
    observability::init_metrics(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(open_engine(&config, notify).await?);
    if config.uses_default_operator_token() {
        tracing::warn!("SLOTWISE_OPERATOR_TOKEN is not set; the operator token is the built-in default");
    }
    let auth = Arc::new(Authenticator::new(config.operator_token.clone()));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    tokio::spawn(reaper::run_expiry_sweep(engine.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  sweep every {:?}, write timeout {:?}", config.sweep_interval, config.write_timeout);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let auth = auth.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, auth).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("slotwise stopped");
    Ok(())
}
