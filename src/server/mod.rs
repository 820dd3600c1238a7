mod admin;
pub mod bootstrap;
pub mod state;

pub use state::{GatewayState, RouteRuntime, RouteTable};

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A running listener of any protocol. `start` surfaces immediate failures
/// (bad bind address, port in use) synchronously; `stop` cancels and waits
/// up to a deadline for in-flight work to drain.
pub struct ListenerHandle {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ListenerHandle {
    /// Spawn a listener future. Failures within the first ~100 ms are
    /// returned from `start` itself instead of being lost in the task.
    pub async fn start<F>(id: &str, cancel: CancellationToken, fut: F) -> Result<Self>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut task = tokio::spawn(fut);
        tokio::select! {
            result = &mut task => {
                match result {
                    Ok(Ok(())) => anyhow::bail!("listener {} exited immediately", id),
                    Ok(Err(e)) => return Err(e.context(format!("listener {} failed to start", id))),
                    Err(e) => anyhow::bail!("listener {} panicked at start: {}", id, e),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        Ok(Self {
            id: id.to_string(),
            cancel,
            task,
        })
    }

    /// Cancel and wait up to `deadline` for the listener to drain; after
    /// that, force-abort and report.
    pub async fn stop(self, deadline: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(deadline, self.task).await {
            Ok(Ok(Ok(()))) => info!("server: listener stopped, id={}", self.id),
            Ok(Ok(Err(e))) => error!("server: listener error on stop, id={}, error={}", self.id, e),
            Ok(Err(e)) => error!("server: listener task join error, id={}, error={}", self.id, e),
            Err(_) => {
                error!(
                    "server: listener drain deadline exceeded, id={}, forcing close",
                    self.id
                );
            }
        }
    }
}

/// Run the main HTTP proxy server with graceful shutdown support.
///
/// When `cancel` fires the server stops accepting new connections and waits
/// up to `DRAIN_TIMEOUT` for in-flight requests to complete before
/// returning with stragglers reported.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: GatewayState,
    cancel: CancellationToken,
) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    let addr = listener.local_addr()?;
    info!("server: proxy listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "gateway_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!(
                    "gateway_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for all in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: proxy: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Run the admin server for health/readiness, metrics, and subsystem
/// snapshots.
pub async fn run_admin_server(
    listener: TcpListener,
    state: GatewayState,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => return Ok(()),
        };
        let (stream, _) = accepted?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
