use crate::balance::{round_robin, Backend, Balancer};
use crate::config::{L4RouteConfig, ListenerConfig};
use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

/// One client's flow through the proxy: a dedicated upstream socket plus a
/// reverse-path receiver writing responses back on the main listener socket.
struct UdpSession {
    upstream: Arc<UdpSocket>,
    last_active: Mutex<Instant>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().unwrap().elapsed()
    }
}

/// UDP listener with client-address session mapping. The backend is pinned
/// at session creation; a write failure or idle expiry drops the session
/// and the next datagram re-creates it.
pub struct UdpProxy {
    listener_id: String,
    socket: Arc<UdpSocket>,
    balancer: Arc<Balancer>,
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
    session_timeout: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
}

impl UdpProxy {
    pub async fn bind(
        cfg: &ListenerConfig,
        route: &L4RouteConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let backends = route
            .backends
            .iter()
            .map(|b| Backend::new(&format!("udp://{}", b.addr), b.weight))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("route {}: bad backend addr: {}", route.id, e))?;

        let socket = UdpSocket::bind(&cfg.listen).await?;
        info!("l4: udp listener up, id={}, addr={}", cfg.id, cfg.listen);
        Ok(Arc::new(Self {
            listener_id: cfg.id.clone(),
            socket: Arc::new(socket),
            balancer: round_robin(backends),
            sessions: Arc::new(DashMap::new()),
            session_timeout: Duration::from_secs(cfg.session_timeout.max(1)),
            cleanup_interval: Duration::from_secs(cfg.cleanup_interval.max(1)),
            cancel,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Receive loop plus the background sweeper. Returns when cancelled.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.start_sweeper();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, client_addr) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => result?,
                _ = self.cancel.cancelled() => {
                    info!("l4: udp listener stopping, id={}", self.listener_id);
                    self.sessions.clear();
                    return Ok(());
                }
            };
            self.forward(client_addr, &buf[..n]).await;
        }
    }

    /// Forward one inbound datagram, creating the session on first sight.
    async fn forward(self: &Arc<Self>, client_addr: SocketAddr, datagram: &[u8]) {
        let session = match self.sessions.get(&client_addr) {
            Some(entry) => entry.value().clone(),
            None => match self.create_session(client_addr).await {
                Some(s) => s,
                None => return,
            },
        };

        session.touch();
        if let Err(e) = session.upstream.send(datagram).await {
            warn!(
                "l4: udp upstream write failed, listener={}, client={}, error={}",
                self.listener_id, client_addr, e
            );
            self.sessions.remove(&client_addr);
        }
    }

    async fn create_session(self: &Arc<Self>, client_addr: SocketAddr) -> Option<Arc<UdpSession>> {
        let backend = match self.balancer.next() {
            Some(b) => b,
            None => {
                warn!("l4: udp no backend available, listener={}", self.listener_id);
                return None;
            }
        };
        let addr = backend.uri().authority()?.as_str().to_string();

        let upstream = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                warn!("l4: udp bind failed, error={}", e);
                return None;
            }
        };
        if let Err(e) = upstream.connect(&addr).await {
            warn!("l4: udp connect failed, upstream={}, error={}", addr, e);
            return None;
        }

        let session = Arc::new(UdpSession {
            upstream: Arc::new(upstream),
            last_active: Mutex::new(Instant::now()),
        });
        self.sessions.insert(client_addr, session.clone());
        metrics::gauge!("gateway_udp_sessions_active", "listener" => self.listener_id.clone())
            .set(self.sessions.len() as f64);
        debug!(
            "l4: udp session created, listener={}, client={}, upstream={}",
            self.listener_id, client_addr, addr
        );

        self.spawn_receiver(client_addr, session.clone());
        Some(session)
    }

    /// Reverse path: read from the upstream socket, write back to the client
    /// on the main listener socket. Expiry is checked on each read timeout;
    /// an expired session removes itself.
    fn spawn_receiver(self: &Arc<Self>, client_addr: SocketAddr, session: Arc<UdpSession>) {
        let proxy = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let recv = tokio::select! {
                    result = tokio::time::timeout(proxy.session_timeout, session.upstream.recv(&mut buf)) => result,
                    _ = proxy.cancel.cancelled() => return,
                };
                match recv {
                    Ok(Ok(n)) => {
                        session.touch();
                        if proxy.socket.send_to(&buf[..n], client_addr).await.is_err() {
                            proxy.remove_session(client_addr);
                            return;
                        }
                    }
                    Ok(Err(_)) => {
                        proxy.remove_session(client_addr);
                        return;
                    }
                    Err(_) => {
                        if session.idle_for() >= proxy.session_timeout {
                            debug!(
                                "l4: udp session expired, listener={}, client={}",
                                proxy.listener_id, client_addr
                            );
                            proxy.remove_session(client_addr);
                            return;
                        }
                    }
                }
            }
        });
    }

    fn remove_session(&self, client_addr: SocketAddr) {
        if self.sessions.remove(&client_addr).is_some() {
            metrics::gauge!("gateway_udp_sessions_active", "listener" => self.listener_id.clone())
                .set(self.sessions.len() as f64);
        }
    }

    /// Background sweeper: removing a session drops the map's reference; the
    /// per-session receiver notices on its next timeout and exits.
    fn start_sweeper(self: &Arc<Self>) {
        let proxy = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(proxy.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        proxy
                            .sessions
                            .retain(|_, s| s.idle_for() < proxy.session_timeout);
                    }
                    _ = proxy.cancel.cancelled() => return,
                }
            }
        });
    }
}
