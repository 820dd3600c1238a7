use crate::config::GatewayConfig;
use crate::health::active::build_health_check_client;
use crate::l4::tcp::{run_tcp_listener, TcpRoute};
use crate::l4::udp::UdpProxy;
use crate::server::{self, GatewayState, ListenerHandle};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const STOP_DEADLINE: Duration = Duration::from_secs(35);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → build state → start listeners → serve →
/// drain on signal.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let state = GatewayState::new(config)?;

    // Health probes, outlier sweeps, and auto-started canaries.
    let health_client = build_health_check_client();
    state.start_background(&health_client);

    let cancel = CancellationToken::new();
    let mut handles: Vec<ListenerHandle> = Vec::new();

    // Admin server first so readiness is observable while listeners come up.
    {
        let listener = tokio::net::TcpListener::bind(&args.admin_listen).await?;
        let state = state.clone();
        let child = cancel.child_token();
        let fut_cancel = child.clone();
        handles.push(
            ListenerHandle::start("admin", child, async move {
                server::run_admin_server(listener, state, fut_cancel).await
            })
            .await?,
        );
    }

    // Configured listeners.
    let config = state.config.load_full();
    for listener_cfg in &config.listeners {
        let child = cancel.child_token();
        match listener_cfg.protocol.as_str() {
            "http" => {
                let listener = tokio::net::TcpListener::bind(&listener_cfg.listen).await?;
                let state = state.clone();
                let fut_cancel = child.clone();
                handles.push(
                    ListenerHandle::start(&listener_cfg.id, child, async move {
                        server::run_proxy_server(listener, state, fut_cancel).await
                    })
                    .await?,
                );
            }
            "tcp" => {
                let routes: Vec<Arc<TcpRoute>> = config
                    .tcp_routes
                    .iter()
                    .filter(|r| r.listener == listener_cfg.id)
                    .map(|r| TcpRoute::build(r))
                    .collect::<Result<_>>()?;
                let cfg = listener_cfg.clone();
                let fut_cancel = child.clone();
                handles.push(
                    ListenerHandle::start(&listener_cfg.id, child, async move {
                        run_tcp_listener(cfg, routes, fut_cancel).await
                    })
                    .await?,
                );
            }
            "udp" => {
                let Some(route) = config
                    .udp_routes
                    .iter()
                    .find(|r| r.listener == listener_cfg.id)
                else {
                    tracing::warn!(
                        "server: udp listener {} has no route, skipping",
                        listener_cfg.id
                    );
                    continue;
                };
                let proxy = UdpProxy::bind(listener_cfg, route, child.clone()).await?;
                handles.push(
                    ListenerHandle::start(&listener_cfg.id, child, async move {
                        proxy.run().await
                    })
                    .await?,
                );
            }
            other => {
                anyhow::bail!("listener {}: unknown protocol {}", listener_cfg.id, other)
            }
        }
    }

    // CLI override / extra HTTP listener.
    if let Some(ref listen) = args.listen {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        let state_clone = state.clone();
        let child = cancel.child_token();
        let fut_cancel = child.clone();
        handles.push(
            ListenerHandle::start("cli-http", child, async move {
                server::run_proxy_server(listener, state_clone, fut_cancel).await
            })
            .await?,
        );
    }

    tracing::info!("server: gateway up, listeners={}", handles.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("server: shutdown signal received");

    cancel.cancel();
    for handle in handles {
        handle.stop(STOP_DEADLINE).await;
    }
    state.shutdown();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
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

    std::mem::forget(guard);
}
