use crate::balance::{round_robin, Backend, Balancer};
use crate::config::{L4PoolConfig, L4RouteConfig, ListenerConfig};
use crate::l4::sni::{peek_sni, sni_matches};
use anyhow::Result;
use ipnetwork::IpNetwork;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HALF_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A compiled L4 TCP route: SNI patterns, source CIDRs, and a round-robin
/// over its backends.
pub struct TcpRoute {
    pub id: String,
    sni_patterns: Vec<String>,
    cidrs: Vec<IpNetwork>,
    balancer: Arc<Balancer>,
    pool: Arc<TcpConnPool>,
}

impl TcpRoute {
    pub fn build(cfg: &L4RouteConfig) -> Result<Arc<Self>> {
        let backends = cfg
            .backends
            .iter()
            .map(|b| Backend::new(&format!("tcp://{}", b.addr), b.weight))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("route {}: bad backend addr: {}", cfg.id, e))?;
        let cidrs = cfg
            .matcher
            .source_cidr
            .iter()
            .map(|c| c.parse::<IpNetwork>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self {
            id: cfg.id.clone(),
            sni_patterns: cfg.matcher.sni.clone(),
            cidrs,
            balancer: round_robin(backends),
            pool: Arc::new(TcpConnPool::new(cfg.pool.clone())),
        }))
    }

    /// Route match: SNI patterns (when configured) and source CIDRs (when
    /// configured) must both hold.
    fn matches(&self, sni: &str, peer_ip: IpAddr) -> bool {
        if !self.sni_patterns.is_empty()
            && !self.sni_patterns.iter().any(|p| sni_matches(p, sni))
        {
            return false;
        }
        if !self.cidrs.is_empty() && !self.cidrs.iter().any(|c| c.contains(peer_ip)) {
            return false;
        }
        true
    }

    fn select_addr(&self) -> Option<String> {
        self.balancer
            .next()
            .and_then(|b| b.uri().authority().map(|a| a.as_str().to_string()))
    }
}

/// Run one TCP listener until cancelled, then let in-flight pipes finish on
/// their own tasks.
pub async fn run_tcp_listener(
    cfg: ListenerConfig,
    routes: Vec<Arc<TcpRoute>>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    info!("l4: tcp listener up, id={}, addr={}", cfg.id, cfg.listen);

    for route in &routes {
        route.pool.start_sweeper(cancel.clone());
    }

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => {
                info!("l4: tcp listener stopping, id={}", cfg.id);
                return Ok(());
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("l4: tcp accept failed, id={}, error={}", cfg.id, e);
                continue;
            }
        };
        metrics::counter!("gateway_l4_connections_total", "listener" => cfg.id.clone())
            .increment(1);

        let routes = routes.clone();
        let sni_routing = cfg.sni_routing;
        let idle_timeout = cfg.idle_timeout;
        let listener_id = cfg.id.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_conn(stream, peer_addr.ip(), &routes, sni_routing, idle_timeout).await
            {
                debug!(
                    "l4: tcp session ended with error, listener={}, peer={}, error={}",
                    listener_id, peer_addr, e
                );
            }
        });
    }
}

async fn handle_conn(
    client: TcpStream,
    peer_ip: IpAddr,
    routes: &[Arc<TcpRoute>],
    sni_routing: bool,
    idle_timeout: u64,
) -> Result<()> {
    // SNI peek reads nothing off the stream; a parse failure leaves the SNI
    // empty and routing continues.
    let sni = if sni_routing {
        match peek_sni(&client).await {
            Some(name) => name,
            None => {
                warn!("l4: sni parse failed, continuing with empty sni, peer={}", peer_ip);
                String::new()
            }
        }
    } else {
        String::new()
    };

    let Some(route) = routes.iter().find(|r| r.matches(&sni, peer_ip)) else {
        debug!("l4: no tcp route matched, peer={}, sni={}", peer_ip, sni);
        return Ok(());
    };

    let Some(addr) = route.select_addr() else {
        warn!("l4: no backend available, route={}", route.id);
        return Ok(());
    };

    let upstream = route.pool.get(&addr).await?;
    debug!(
        "l4: piping, route={}, peer={}, upstream={}, sni={}",
        route.id, peer_ip, addr, sni
    );
    let idle = if idle_timeout > 0 {
        Some(Duration::from_secs(idle_timeout))
    } else {
        None
    };
    let upstream = pipe(client, upstream, idle).await;

    // A cleanly-finished connection goes back to the pool; validation on the
    // next get discards it if the peer already tore it down.
    if let Some(stream) = upstream {
        route.pool.put(&addr, stream);
    }
    Ok(())
}

/// Pipe both directions, enforcing the listener's idle deadline per read.
/// On one side's EOF the peer's write half is shut down, and the opposite
/// direction gets a bounded grace period to finish.
async fn pipe(client: TcpStream, upstream: TcpStream, idle: Option<Duration>) -> Option<TcpStream> {
    let (mut cr, mut cw) = client.into_split();
    let (mut ur, mut uw) = upstream.into_split();

    {
        let c2u = async {
            let _ = copy_with_idle(&mut cr, &mut uw, idle).await;
            let _ = uw.shutdown().await;
        };
        let u2c = async {
            let _ = copy_with_idle(&mut ur, &mut cw, idle).await;
            let _ = cw.shutdown().await;
        };
        tokio::pin!(c2u);
        tokio::pin!(u2c);

        tokio::select! {
            _ = &mut c2u => {
                let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut u2c).await;
            }
            _ = &mut u2c => {
                let _ = tokio::time::timeout(HALF_CLOSE_GRACE, &mut c2u).await;
            }
        }
    }

    ur.reunite(uw).ok()
}

/// One-directional copy with an optional per-read idle deadline.
async fn copy_with_idle<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Option<Duration>,
) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let Some(idle) = idle else {
        return tokio::io::copy(reader, writer).await;
    };
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "idle timeout",
                ))
            }
        };
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Bounded idle pool of upstream TCP connections, keyed by "host:port".
pub struct TcpConnPool {
    config: L4PoolConfig,
    idle: Mutex<HashMap<String, VecDeque<PooledConn>>>,
    closed: AtomicBool,
}

struct PooledConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

impl TcpConnPool {
    pub fn new(config: L4PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Reuse a validated idle connection or dial a fresh one.
    pub async fn get(&self, addr: &str) -> Result<TcpStream> {
        loop {
            let candidate = {
                let mut idle = self.idle.lock().unwrap();
                idle.get_mut(addr).and_then(|q| q.pop_front())
            };
            let Some(conn) = candidate else { break };
            if self.validate(&conn).await {
                return Ok(conn.stream);
            }
            // Dead or stale: drop and try the next one.
        }
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Return a connection for reuse. Rejected after shutdown or when the
    /// queue for this address is full.
    pub fn put(&self, addr: &str, stream: TcpStream) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut idle = self.idle.lock().unwrap();
        let queue = idle.entry(addr.to_string()).or_default();
        if queue.len() >= self.config.max_idle {
            return false;
        }
        let now = Instant::now();
        queue.push_back(PooledConn {
            stream,
            created_at: now,
            last_used: now,
        });
        true
    }

    /// Age checks plus a zero-byte peek with a 1 ms deadline: a timeout
    /// means no pending data (alive); ready data or EOF means the
    /// connection is not safely reusable.
    async fn validate(&self, conn: &PooledConn) -> bool {
        let now = Instant::now();
        if now.duration_since(conn.last_used) >= Duration::from_secs(self.config.max_idle_time) {
            return false;
        }
        if now.duration_since(conn.created_at) >= Duration::from_secs(self.config.max_lifetime) {
            return false;
        }
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(1), conn.stream.peek(&mut probe)).await {
            Err(_) => true,          // nothing to read within 1ms: still idle
            Ok(Ok(0)) => false,      // EOF: peer closed
            Ok(Ok(_)) => false,      // unexpected data on an idle conn
            Ok(Err(_)) => false,     // RST or similar
        }
    }

    /// Periodically discard entries that aged out while idle.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.sweep(),
                    _ = cancel.cancelled() => {
                        pool.shutdown();
                        return;
                    }
                }
            }
        });
    }

    fn sweep(&self) {
        let max_idle_time = Duration::from_secs(self.config.max_idle_time);
        let max_lifetime = Duration::from_secs(self.config.max_lifetime);
        let now = Instant::now();
        let mut idle = self.idle.lock().unwrap();
        for queue in idle.values_mut() {
            queue.retain(|c| {
                now.duration_since(c.last_used) < max_idle_time
                    && now.duration_since(c.created_at) < max_lifetime
            });
        }
        idle.retain(|_, q| !q.is_empty());
    }

    /// Close the pool: drop every idle connection and reject future puts.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn idle_count(&self, addr: &str) -> usize {
        self.idle
            .lock()
            .unwrap()
            .get(addr)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn route_cfg(id: &str, sni: &[&str], cidr: &[&str], backend: &str) -> L4RouteConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "listener": "edge",
            "match": {"sni": sni, "source_cidr": cidr},
            "backends": [{"addr": backend}]
        }))
        .unwrap()
    }

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_route_matching() {
        let route = TcpRoute::build(&route_cfg(
            "mesh",
            &["*.internal.example.com"],
            &["10.0.0.0/8"],
            "10.1.0.1:9443",
        ))
        .unwrap();

        assert!(route.matches("api.internal.example.com", "10.3.4.5".parse().unwrap()));
        // Wrong source network.
        assert!(!route.matches("api.internal.example.com", "192.168.1.1".parse().unwrap()));
        // SNI too deep for a single-level wildcard.
        assert!(!route.matches("a.b.internal.example.com", "10.3.4.5".parse().unwrap()));
    }

    #[test]
    fn test_empty_matchers_match_everything() {
        let route = TcpRoute::build(&route_cfg("any", &[], &[], "10.1.0.1:9443")).unwrap();
        assert!(route.matches("", "192.0.2.1".parse().unwrap()));
        assert!(route.matches("whatever.example.com", "10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_end_to_end_pipe() {
        let echo = spawn_echo_server().await;
        let cfg: ListenerConfig = serde_json::from_value(serde_json::json!({
            "id": "edge",
            "protocol": "tcp",
            "listen": "127.0.0.1:0"
        }))
        .unwrap();
        // Bind ourselves so the test knows the port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let route = TcpRoute::build(&route_cfg("echo", &[], &[], &echo.to_string())).unwrap();
        let cancel = CancellationToken::new();
        let cancel_run = cancel.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                let routes = vec![route.clone()];
                let idle = cfg.idle_timeout;
                tokio::spawn(async move {
                    let _ = handle_conn(stream, peer.ip(), &routes, false, idle).await;
                });
                if cancel_run.is_cancelled() {
                    return;
                }
            }
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_pool_put_and_reuse() {
        let echo = spawn_echo_server().await;
        let pool = TcpConnPool::new(L4PoolConfig::default());
        let addr = echo.to_string();

        let conn = pool.get(&addr).await.unwrap();
        assert!(pool.put(&addr, conn));
        assert_eq!(pool.idle_count(&addr), 1);

        // The idle connection is still healthy: get reuses it.
        let _conn = pool.get(&addr).await.unwrap();
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_pool_rejects_when_full() {
        let echo = spawn_echo_server().await;
        let config = L4PoolConfig {
            max_idle: 1,
            ..L4PoolConfig::default()
        };
        let pool = TcpConnPool::new(config);
        let addr = echo.to_string();

        let c1 = pool.get(&addr).await.unwrap();
        let c2 = pool.get(&addr).await.unwrap();
        assert!(pool.put(&addr, c1));
        assert!(!pool.put(&addr, c2), "queue is bounded at max_idle");
    }

    #[tokio::test]
    async fn test_pool_rejects_after_shutdown() {
        let echo = spawn_echo_server().await;
        let pool = TcpConnPool::new(L4PoolConfig::default());
        let addr = echo.to_string();
        let conn = pool.get(&addr).await.unwrap();
        pool.shutdown();
        assert!(!pool.put(&addr, conn));
    }

    #[tokio::test]
    async fn test_pool_discards_closed_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client_side, server_side) = {
            let connect = TcpStream::connect(&addr);
            let (client, accepted) = tokio::join!(connect, listener.accept());
            (client.unwrap(), accepted.unwrap().0)
        };

        let pool = TcpConnPool::new(L4PoolConfig::default());
        assert!(pool.put(&addr, client_side));
        // Peer closes: the pooled connection is dead.
        drop(server_side);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // get() discards the dead conn and dials a fresh one (the listener
        // is still accepting).
        let _fresh = pool.get(&addr).await.unwrap();
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale() {
        let echo = spawn_echo_server().await;
        let config = L4PoolConfig {
            max_idle: 10,
            max_idle_time: 0,
            max_lifetime: 600,
        };
        let pool = TcpConnPool::new(config);
        let addr = echo.to_string();
        let conn = pool.get(&addr).await.unwrap();
        pool.put(&addr, conn);
        pool.sweep();
        assert_eq!(pool.idle_count(&addr), 0);
    }
}
