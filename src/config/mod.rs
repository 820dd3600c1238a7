pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

const KNOWN_ALGORITHMS: &[&str] = &[
    "round_robin",
    "weighted_round_robin",
    "least_conn",
    "least_response_time",
    "consistent_hash",
    "weighted",
    "versioned",
    "tenant",
];

impl GatewayConfig {
    /// Load configuration from a file. When the file does not exist, built-in
    /// defaults are used — allowing the gateway to start with zero
    /// configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.validate()?;
        tracing::info!(
            "config: loaded, listeners={}, routes={}, tcp_routes={}, udp_routes={}",
            config.listeners.len(),
            config.routes.len(),
            config.tcp_routes.len(),
            config.udp_routes.len(),
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut listener_ids = HashSet::new();
        for l in &self.listeners {
            if !listener_ids.insert(l.id.as_str()) {
                anyhow::bail!("duplicate listener id: {}", l.id);
            }
            match l.protocol.as_str() {
                "http" | "tcp" | "udp" => {}
                other => anyhow::bail!("listener {}: unknown protocol {}", l.id, other),
            }
        }

        let mut route_ids = HashSet::new();
        for r in &self.routes {
            if !route_ids.insert(r.id.as_str()) {
                anyhow::bail!("duplicate route id: {}", r.id);
            }
            r.validate()?;
        }

        for r in self.tcp_routes.iter().chain(self.udp_routes.iter()) {
            if !self.listeners.iter().any(|l| l.id == r.listener) {
                anyhow::bail!("l4 route {}: unknown listener {}", r.id, r.listener);
            }
            for cidr in &r.matcher.source_cidr {
                cidr.parse::<ipnetwork::IpNetwork>()
                    .map_err(|e| anyhow::anyhow!("l4 route {}: bad cidr {}: {}", r.id, cidr, e))?;
            }
            for b in &r.backends {
                if b.weight == 0 {
                    anyhow::bail!("l4 route {}: backend {} has zero weight", r.id, b.addr);
                }
            }
        }

        let mut transport_names = HashSet::new();
        for t in &self.transports {
            if !transport_names.insert(t.name.as_str()) {
                anyhow::bail!("duplicate transport name: {}", t.name);
            }
        }
        for r in &self.routes {
            if let Some(ref name) = r.transport {
                if name != "default" && !transport_names.contains(name.as_str()) {
                    anyhow::bail!("route {}: unknown transport {}", r.id, name);
                }
            }
        }

        Ok(())
    }
}

impl RouteConfig {
    fn validate(&self) -> Result<()> {
        if !KNOWN_ALGORITHMS.contains(&self.balancer.algorithm.as_str()) {
            anyhow::bail!(
                "route {}: unknown balancer algorithm {}",
                self.id,
                self.balancer.algorithm
            );
        }

        for b in &self.backends {
            if b.weight == 0 {
                anyhow::bail!("route {}: backend {} has zero weight", self.id, b.url);
            }
            b.url
                .parse::<http::Uri>()
                .map_err(|e| anyhow::anyhow!("route {}: bad backend url {}: {}", self.id, b.url, e))?;
        }

        let mut group_names = HashSet::new();
        for g in &self.groups {
            if !group_names.insert(g.name.as_str()) {
                anyhow::bail!("route {}: duplicate group name {}", self.id, g.name);
            }
            for b in &g.backends {
                if b.weight == 0 {
                    anyhow::bail!("route {}: backend {} has zero weight", self.id, b.url);
                }
            }
        }

        if let Some(ref canary) = self.canary {
            if canary.enabled {
                if !group_names.contains(canary.canary_group.as_str()) {
                    anyhow::bail!(
                        "route {}: canary group {} not in groups",
                        self.id,
                        canary.canary_group
                    );
                }
                if canary.steps.is_empty() {
                    anyhow::bail!("route {}: canary enabled with no steps", self.id);
                }
                for s in &canary.steps {
                    if s.weight > 100 {
                        anyhow::bail!("route {}: canary step weight {} > 100", self.id, s.weight);
                    }
                }
            }
        }

        if let Some(ref bg) = self.blue_green {
            if bg.enabled {
                for name in [&bg.active_group, &bg.inactive_group] {
                    if !group_names.contains(name.as_str()) {
                        anyhow::bail!("route {}: blue/green group {} not in groups", self.id, name);
                    }
                }
            }
        }

        if let Some(ref rw) = self.rewrite {
            if let Some(ref re) = rw.regex_match {
                regex::Regex::new(re)
                    .map_err(|e| anyhow::anyhow!("route {}: bad rewrite regex: {}", self.id, e))?;
            }
        }

        if let Some(ref ch) = self.balancer.consistent_hash {
            let key = ch.key.as_str();
            let valid = key == "path"
                || key == "ip"
                || key.strip_prefix("header:").is_some_and(|n| !n.is_empty())
                || key.strip_prefix("cookie:").is_some_and(|n| !n.is_empty());
            if !valid {
                anyhow::bail!("route {}: bad consistent_hash key {}", self.id, key);
            }
        }

        Ok(())
    }
}
