use crate::config::GatewayConfig;
use crate::discovery::ConsulRegistry;
use crate::server;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`. Listen addresses given here win
/// over the config file.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
    pub cpu: server::runtime::CpuLimit,
}

/// Gateway lifecycle: init → discover → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    tracing::info!(
        "runtime: worker threads sized, threads={}, source={}",
        args.cpu.threads,
        args.cpu.source
    );

    // Phase 1: load config and build state.
    let mut config = GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.server.admin_listen = admin_listen;
    }
    let state = server::GatewayState::new(config)?;

    // Phase 2: initial membership before traffic. A failure here is not
    // fatal; requests fall back until the first successful poll.
    if let Some(ref consul) = state.consul {
        match consul.refresh().await {
            Ok(services) => {
                tracing::info!("discovery: consul: initial resolve completed, services={}", services)
            }
            Err(e) => tracing::error!("discovery: consul: initial resolve failed, error={}", e),
        }
    }

    // Phase 3: background loops and listeners.
    let shutdown = Arc::new(Notify::new());
    if let Some(ref consul) = state.consul {
        start_discovery_loop(
            consul.clone(),
            state.config.discovery.consul.poll_interval,
            &shutdown,
        );
    }
    start_admin_server(&state, &shutdown);

    tracing::info!("server: starting gateway, listen={}", state.config.server.listen);

    let mut proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            let listen = state.config.server.listen.clone();
            server::run_proxy_server(&listen, state, shutdown).await
        }
    });

    // Phase 4: block until a signal, or until the proxy fails on its own.
    tokio::select! {
        _ = wait_for_shutdown() => {}
        res = &mut proxy_handle => {
            shutdown.notify_waiters();
            return match res {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!("server: proxy task error: {e}")),
            };
        }
    }
    shutdown.notify_waiters();

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, but return `true` immediately if shutdown is signalled.
/// Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_discovery_loop(registry: Arc<ConsulRegistry>, interval: Duration, shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                tracing::info!("discovery: consul: poll loop stopped");
                return;
            }
            match registry.refresh().await {
                Ok(services) => {
                    tracing::debug!("discovery: consul: poll completed, services={}", services)
                }
                Err(e) => {
                    tracing::error!("discovery: consul: poll failed, keeping last snapshot, error={}", e)
                }
            }
        }
    });
}

fn start_admin_server(state: &server::GatewayState, shutdown: &Arc<Notify>) {
    let s = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let listen = s.config.server.admin_listen.clone();
        if let Err(e) = server::run_admin_server(&listen, s, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: SIGTERM handler not installed, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
