//! `prlens serve`: connector, router and HTTP server in one process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prlens_router::SessionRouter;
use prlens_server::{AppState, ShutdownCoordinator, build_router};
use prlens_settings::PrlensSettings;
use prlens_upstream::{OpencodeControl, UpstreamConfig, UpstreamConnector};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Run until ctrl-c. `config` is re-read on SIGHUP.
pub(crate) async fn run(settings: &PrlensSettings, config: PathBuf) -> Result<()> {
    let metrics =
        prlens_server::metrics::install_recorder().context("failed to install metrics recorder")?;

    let router = SessionRouter::new(settings.router.queue_capacity);
    let upstream = UpstreamConfig::from_settings(&settings.upstream);
    let connector = UpstreamConnector::new(upstream.clone(), router.clone())
        .context("failed to create upstream connector")?;
    let control = OpencodeControl::new(&upstream).context("failed to create control client")?;

    let state = AppState::new(router.clone(), Arc::new(control), connector.watch_state())
        .with_metrics(metrics);
    let shutdown = ShutdownCoordinator::new(router);

    let addr = settings.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, upstream = %upstream.base_url, "prlens serving");

    let token = shutdown.token();
    let connector_task = tokio::spawn(async move {
        match connector.run(token).await {
            Ok(()) => info!("upstream connector stopped"),
            Err(e) => error!(error = %e, kind = e.kind(), "upstream connector gave up"),
        }
    });
    let reload_task = spawn_reload_on_hangup(config, shutdown.clone())?;
    let mut server_task = tokio::spawn(prlens_server::serve(
        listener,
        build_router(state),
        shutdown.clone(),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received");
        }
        finished = &mut server_task => {
            shutdown.graceful_shutdown(vec![connector_task, reload_task], None).await;
            return finished.context("server task panicked")?.context("server failed");
        }
    }

    shutdown.graceful_shutdown(vec![connector_task, reload_task], None).await;
    match tokio::time::timeout(Duration::from_secs(10), server_task).await {
        Ok(finished) => finished.context("server task panicked")?.context("server failed")?,
        Err(_) => warn!("server did not stop in time"),
    }
    Ok(())
}

/// Reload the settings cache on SIGHUP until shutdown.
///
/// Handlers read the cache per request, so keep-alive and send-wait changes
/// apply to the next stream or message. Bind address and upstream URL need
/// a restart.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    config: PathBuf,
    shutdown: ShutdownCoordinator,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Err(e) = prlens_settings::reload_settings_from_path(&config) {
                        warn!(error = %e, path = %config.display(), "settings reload failed, keeping previous");
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _config: PathBuf,
    shutdown: ShutdownCoordinator,
) -> Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move { shutdown.wait().await }))
}
