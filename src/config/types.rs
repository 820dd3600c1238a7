use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub listeners: Vec<ListenerConfig>,

    /// HTTP routes, matched by longest path prefix.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    /// L4 TCP routes, matched per listener by SNI / source CIDR.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tcp_routes: Vec<L4RouteConfig>,

    /// L4 UDP routes, matched per listener.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub udp_routes: Vec<L4RouteConfig>,

    /// Named upstream transports. Routes reference these by name; a built-in
    /// "default" transport is always available.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub transports: Vec<TransportConfig>,
}

/// A network listener. One socket, one protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub id: String,

    /// "http", "tcp", "udp".
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Bind address, e.g. "0.0.0.0:8080".
    pub listen: String,

    /// TCP: peek the TLS ClientHello to extract SNI for route matching.
    #[serde(default)]
    pub sni_routing: bool,

    /// TCP: per-connection idle deadline (seconds). 0 disables.
    #[serde(default = "default_l4_idle_timeout")]
    pub idle_timeout: u64,

    /// UDP: session expiry since last activity (seconds).
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// UDP: how often the sweeper scans for expired sessions (seconds).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_l4_idle_timeout() -> u64 {
    300
}

fn default_session_timeout() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    10
}

/// An HTTP route: path prefix in, traffic-managed upstream dispatch out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// Longest-prefix match against the request path. "/" catches all.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,

    /// Flat backend list. Ignored when `groups` is non-empty.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<BackendConfig>,

    /// Named traffic groups for weighted splits / progressive delivery.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub outlier: Option<OutlierConfig>,

    #[serde(default)]
    pub canary: Option<CanaryConfig>,

    #[serde(default)]
    pub blue_green: Option<BlueGreenConfig>,

    #[serde(default)]
    pub ab_test: Option<AbTestConfig>,

    #[serde(default)]
    pub backpressure: Option<BackpressureConfig>,

    #[serde(default)]
    pub active_health: Option<ActiveHealthConfig>,

    #[serde(default)]
    pub timeout: TimeoutPolicy,

    #[serde(default)]
    pub rewrite: Option<RewriteConfig>,

    /// Follow upstream redirects instead of passing 3xx to the client.
    #[serde(default)]
    pub redirect: Option<RedirectConfig>,

    /// Named transport from `[[transports]]`. Falls back to "default".
    #[serde(default)]
    pub transport: Option<String>,

    /// When the request carries this header and its value names a known,
    /// healthy backend URL, selection is bypassed in favor of that backend.
    #[serde(default)]
    pub backend_override_header: Option<String>,

    /// Header consulted by the versioned balancer.
    #[serde(default = "default_version_header")]
    pub version_header: String,

    /// Header consulted by the tenant-aware balancer.
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    /// Inject W3C trace-context headers on the upstream request.
    #[serde(default)]
    pub propagate_trace: bool,
}

fn default_path_prefix() -> String {
    "/".to_string()
}

fn default_version_header() -> String {
    "x-api-version".to_string()
}

fn default_tenant_header() -> String {
    "x-tenant-id".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Absolute upstream URL, e.g. "http://10.0.0.1:9000".
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A named subset of backends within a weighted split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,

    /// Share of the weighted-random range. Weights need not sum to 100.
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<BackendConfig>,

    /// When all listed headers match (case-insensitive values), this group is
    /// forced regardless of weights.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub match_headers: HashMap<String, String>,
}

/// Balancer selection contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// "round_robin", "weighted_round_robin", "least_conn",
    /// "least_response_time", "consistent_hash", "weighted", "versioned",
    /// "tenant".
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default)]
    pub consistent_hash: Option<ConsistentHashConfig>,

    #[serde(default)]
    pub sticky: Option<StickyConfig>,

    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,

    /// Per-version backend sets for the versioned wrapper.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub versions: Vec<VersionGroupConfig>,

    #[serde(default)]
    pub default_version: Option<String>,

    /// Per-tenant backend sets for the tenant-aware wrapper.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tenants: Vec<TenantGroupConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            consistent_hash: None,
            sticky: None,
            session_affinity: None,
            versions: Vec::new(),
            default_version: None,
            tenants: Vec::new(),
        }
    }
}

fn default_algorithm() -> String {
    "round_robin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistentHashConfig {
    /// "header:<name>", "cookie:<name>", "path", "ip".
    #[serde(default = "default_hash_key")]
    pub key: String,

    /// Virtual nodes per unit of weight.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

impl Default for ConsistentHashConfig {
    fn default() -> Self {
        Self {
            key: default_hash_key(),
            replicas: default_replicas(),
        }
    }
}

fn default_hash_key() -> String {
    "ip".to_string()
}

fn default_replicas() -> u32 {
    150
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickyConfig {
    /// "cookie", "header", "hash".
    #[serde(default = "default_sticky_mode")]
    pub mode: String,

    #[serde(default = "default_sticky_cookie")]
    pub cookie_name: String,

    /// Header hashed in "header"/"hash" modes.
    #[serde(default = "default_sticky_hash_key")]
    pub hash_key: String,

    /// Cookie TTL in seconds (mode "cookie").
    #[serde(default = "default_sticky_ttl")]
    pub ttl: u64,
}

fn default_sticky_mode() -> String {
    "cookie".to_string()
}

fn default_sticky_cookie() -> String {
    "janus_group".to_string()
}

fn default_sticky_hash_key() -> String {
    "x-request-id".to_string()
}

fn default_sticky_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAffinityConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_affinity_cookie")]
    pub cookie_name: String,

    /// Cookie TTL in seconds.
    #[serde(default = "default_sticky_ttl")]
    pub ttl: u64,

    #[serde(default = "default_cookie_path")]
    pub path: String,

    #[serde(default)]
    pub secure: bool,

    /// "Lax" (default), "Strict", "None".
    #[serde(default = "default_same_site")]
    pub same_site: String,
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_affinity_cookie(),
            ttl: default_sticky_ttl(),
            path: default_cookie_path(),
            secure: false,
            same_site: default_same_site(),
        }
    }
}

fn default_affinity_cookie() -> String {
    "janus_affinity".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_same_site() -> String {
    "Lax".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionGroupConfig {
    pub version: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantGroupConfig {
    pub tenant: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<BackendConfig>,
}

/// Retry with exponential backoff, gated by an optional sliding-window budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,

    /// Milliseconds before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,

    #[serde(default = "default_retryable_methods")]
    pub retryable_methods: Vec<String>,

    /// Per-attempt deadline in seconds. 0 disables.
    #[serde(default)]
    pub per_try_timeout: f64,

    #[serde(default)]
    pub budget: Option<BudgetConfig>,

    #[serde(default)]
    pub hedging: Option<HedgingConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_statuses: default_retryable_statuses(),
            retryable_methods: default_retryable_methods(),
            per_try_timeout: 0.0,
            budget: None,
            hedging: None,
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_retryable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()]
}

/// Sliding-window cap on the retry/request ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_ratio")]
    pub ratio: f64,

    /// Floor of always-allowed retries per second.
    #[serde(default = "default_min_retries")]
    pub min_retries: f64,

    /// Window length in seconds.
    #[serde(default = "default_budget_window")]
    pub window: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            ratio: default_budget_ratio(),
            min_retries: default_min_retries(),
            window: default_budget_window(),
        }
    }
}

fn default_budget_ratio() -> f64 {
    0.2
}

fn default_min_retries() -> f64 {
    10.0
}

fn default_budget_window() -> u64 {
    10
}

/// Speculative parallel requests for tail-latency reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Total concurrent attempts including the original. Clamped to >= 2.
    #[serde(default = "default_hedge_max_requests")]
    pub max_requests: u32,

    /// Milliseconds before each additional attempt launches.
    #[serde(default = "default_hedge_delay_ms")]
    pub delay_ms: u64,
}

impl Default for HedgingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: default_hedge_max_requests(),
            delay_ms: default_hedge_delay_ms(),
        }
    }
}

fn default_hedge_max_requests() -> u32 {
    2
}

fn default_hedge_delay_ms() -> u64 {
    100
}

/// Passive outlier detection: eject backends that deviate from the population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Detection tick interval in seconds.
    #[serde(default = "default_outlier_interval")]
    pub interval: f64,

    /// Stats window length in seconds.
    #[serde(default = "default_outlier_window")]
    pub window: f64,

    /// Minimum in-window requests for a backend to be evaluated.
    #[serde(default = "default_outlier_min_requests")]
    pub min_requests: u64,

    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    #[serde(default = "default_error_rate_multiplier")]
    pub error_rate_multiplier: f64,

    #[serde(default = "default_latency_multiplier")]
    pub latency_multiplier: f64,

    /// First-ejection duration in seconds; repeat offenders multiply it.
    #[serde(default = "default_base_ejection")]
    pub base_ejection_duration: f64,

    #[serde(default = "default_max_ejection")]
    pub max_ejection_duration: f64,

    /// Cap on simultaneously-ejected backends, percent of the backend set.
    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: u32,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_outlier_interval(),
            window: default_outlier_window(),
            min_requests: default_outlier_min_requests(),
            error_rate_threshold: default_error_rate_threshold(),
            error_rate_multiplier: default_error_rate_multiplier(),
            latency_multiplier: default_latency_multiplier(),
            base_ejection_duration: default_base_ejection(),
            max_ejection_duration: default_max_ejection(),
            max_ejection_percent: default_max_ejection_percent(),
        }
    }
}

fn default_outlier_interval() -> f64 {
    10.0
}

fn default_outlier_window() -> f64 {
    30.0
}

fn default_outlier_min_requests() -> u64 {
    10
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_error_rate_multiplier() -> f64 {
    2.0
}

fn default_latency_multiplier() -> f64 {
    3.0
}

fn default_base_ejection() -> f64 {
    30.0
}

fn default_max_ejection() -> f64 {
    300.0
}

fn default_max_ejection_percent() -> u32 {
    50
}

/// Multi-step canary rollout with automated analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Name of the canary traffic group.
    pub canary_group: String,

    #[serde(default)]
    pub auto_start: bool,

    #[serde(default)]
    pub rollback_on_error: bool,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub steps: Vec<CanaryStepConfig>,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryStepConfig {
    /// Canary weight for this step (share of 100).
    pub weight: u32,

    /// How long to hold this step before advancing (seconds).
    #[serde(default = "default_step_pause")]
    pub pause: f64,
}

fn default_step_pause() -> f64 {
    300.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Evaluation tick interval in seconds.
    #[serde(default = "default_analysis_interval")]
    pub interval: f64,

    #[serde(default = "default_analysis_min_requests")]
    pub min_requests: u64,

    /// Absolute error-rate ceiling. 0 disables the check.
    #[serde(default)]
    pub error_threshold: f64,

    /// Absolute p99 ceiling in milliseconds. 0 disables the check.
    #[serde(default)]
    pub latency_threshold: f64,

    /// Canary/baseline error-rate ratio ceiling. 0 disables.
    #[serde(default)]
    pub max_error_rate_increase: f64,

    /// Canary/baseline p99 ratio ceiling. 0 disables.
    #[serde(default)]
    pub max_latency_increase: f64,

    /// Consecutive failing ticks tolerated before rollback. 0 means rollback
    /// on the first failure.
    #[serde(default)]
    pub max_failures: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval: default_analysis_interval(),
            min_requests: default_analysis_min_requests(),
            error_threshold: 0.0,
            latency_threshold: 0.0,
            max_error_rate_increase: 0.0,
            max_latency_increase: 0.0,
            max_failures: 0,
        }
    }
}

fn default_analysis_interval() -> f64 {
    30.0
}

fn default_analysis_min_requests() -> u64 {
    10
}

/// Atomic two-group swap behind an observation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueGreenConfig {
    #[serde(default)]
    pub enabled: bool,

    pub active_group: String,
    pub inactive_group: String,

    #[serde(default)]
    pub rollback_on_error: bool,

    #[serde(default = "default_error_rate_threshold")]
    pub error_threshold: f64,

    #[serde(default = "default_analysis_min_requests")]
    pub min_requests: u64,

    /// Post-promotion watch period in seconds. 0 skips observation.
    #[serde(default)]
    pub observation_window: f64,
}

/// Passive A/B experiment metrics collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestConfig {
    #[serde(default)]
    pub enabled: bool,

    pub experiment_name: String,

    /// Stats window length in seconds.
    #[serde(default = "default_outlier_window")]
    pub window: f64,
}

/// Evict a backend that answers 429/503 until its Retry-After elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_backpressure_statuses")]
    pub status_codes: Vec<u16>,

    /// Fallback eviction delay in seconds when Retry-After is absent or bad.
    #[serde(default = "default_backpressure_delay")]
    pub default_delay: f64,

    /// Ceiling on any Retry-After value, in seconds.
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            status_codes: default_backpressure_statuses(),
            default_delay: default_backpressure_delay(),
            max_retry_after: default_max_retry_after(),
        }
    }
}

fn default_backpressure_statuses() -> Vec<u16> {
    vec![429, 503]
}

fn default_backpressure_delay() -> f64 {
    5.0
}

fn default_max_retry_after() -> f64 {
    60.0
}

/// Active HTTP probing of backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthConfig {
    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_interval")]
    pub interval: u64,

    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    /// Dedicated probe port; falls back to the backend's own port.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,

    /// Consecutive passes before an unhealthy backend is restored.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures before a healthy backend is evicted.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_health_concurrency")]
    pub concurrency: usize,
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200]
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_health_concurrency() -> usize {
    10
}

/// Layered deadlines, all in seconds. 0 means "unset".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Whole-request deadline. Falls back to the proxy default of 30s.
    #[serde(default)]
    pub request: f64,

    /// Per-try deadline when no retry policy supplies one.
    #[serde(default)]
    pub backend: f64,

    /// Idle timeout between response body reads.
    #[serde(default)]
    pub idle: f64,
}

/// Target URL resolution. Precedence: full URL override, prefix/regex
/// rewrite, legacy strip-prefix, plain path join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Replace the entire target URL (query included when it carries one).
    #[serde(default)]
    pub target_url: Option<String>,

    #[serde(default)]
    pub prefix_match: Option<String>,

    #[serde(default)]
    pub prefix_replacement: Option<String>,

    #[serde(default)]
    pub regex_match: Option<String>,

    #[serde(default)]
    pub regex_replacement: Option<String>,

    /// Legacy: drop this prefix from the path before joining.
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Override the outbound Host header.
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

fn default_max_redirects() -> u32 {
    10
}

/// Upstream connection-pool knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_name")]
    pub name: String,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,

    #[serde(default = "default_http2")]
    pub http2: bool,

    /// Default `false` — typical for internal services with self-signed certs.
    #[serde(default)]
    pub tls_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: default_transport_name(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_conn_timeout: default_idle_conn_timeout(),
            dial_timeout: default_dial_timeout(),
            http2: default_http2(),
            tls_verify: false,
        }
    }
}

fn default_transport_name() -> String {
    "default".to_string()
}

fn default_max_idle_per_host() -> usize {
    10
}

fn default_idle_conn_timeout() -> u64 {
    90
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_http2() -> bool {
    true
}

/// An L4 (TCP/UDP) route bound to a listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L4RouteConfig {
    pub id: String,

    /// Listener id this route belongs to.
    pub listener: String,

    #[serde(default, rename = "match")]
    pub matcher: L4MatchConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub backends: Vec<L4BackendConfig>,

    /// TCP upstream idle-pool knobs.
    #[serde(default)]
    pub pool: L4PoolConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L4MatchConfig {
    /// SNI patterns: exact or single-level wildcard ("*.example.com").
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub sni: Vec<String>,

    /// Source CIDRs, e.g. "10.0.0.0/8".
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_cidr: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L4BackendConfig {
    /// "host:port".
    pub addr: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L4PoolConfig {
    #[serde(default = "default_pool_max_idle")]
    pub max_idle: usize,

    /// Seconds an idle connection may sit before being discarded.
    #[serde(default = "default_pool_max_idle_time")]
    pub max_idle_time: u64,

    /// Seconds since creation after which a connection is never reused.
    #[serde(default = "default_pool_max_lifetime")]
    pub max_lifetime: u64,
}

impl Default for L4PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_pool_max_idle(),
            max_idle_time: default_pool_max_idle_time(),
            max_lifetime: default_pool_max_lifetime(),
        }
    }
}

fn default_pool_max_idle() -> usize {
    10
}

fn default_pool_max_idle_time() -> u64 {
    90
}

fn default_pool_max_lifetime() -> u64 {
    600
}
