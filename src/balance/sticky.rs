use super::{cookie_value, RequestKey};
use crate::config::StickyConfig;

/// Request → traffic-group pinning, stable for a given key.
pub struct StickyPolicy {
    mode: StickyMode,
    cookie_name: String,
    hash_key: String,
    ttl: u64,
}

enum StickyMode {
    Cookie,
    Header,
    Hash,
}

/// FNV-1a, 32 bit.
fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

impl StickyPolicy {
    pub fn new(config: &StickyConfig) -> Self {
        let mode = match config.mode.as_str() {
            "header" => StickyMode::Header,
            "hash" => StickyMode::Hash,
            _ => StickyMode::Cookie,
        };
        Self {
            mode,
            cookie_name: config.cookie_name.clone(),
            hash_key: config.hash_key.clone(),
            ttl: config.ttl,
        }
    }

    /// Resolve the pinned group for this request, if the policy can decide.
    /// `groups` is the ordered (name, weight) list of the parent split.
    pub fn resolve(&self, key: &RequestKey<'_>, groups: &[(String, u32)]) -> Option<String> {
        match self.mode {
            StickyMode::Cookie => {
                let value = cookie_value(key.headers, &self.cookie_name)?;
                groups
                    .iter()
                    .find(|(name, _)| *name == value)
                    .map(|(name, _)| name.clone())
            }
            StickyMode::Header => {
                let value = key.headers.get(self.hash_key.as_str())?.to_str().ok()?;
                hash_to_group(value.as_bytes(), groups)
            }
            StickyMode::Hash => {
                let owned;
                let value = match key
                    .headers
                    .get(self.hash_key.as_str())
                    .and_then(|v| v.to_str().ok())
                {
                    Some(v) => v,
                    None => {
                        owned = key.client_ip.to_string();
                        &owned
                    }
                };
                hash_to_group(value.as_bytes(), groups)
            }
        }
    }

    /// Whether a weighted-random fallback decision should be pinned with a
    /// cookie (cookie mode only).
    pub fn issues_cookie(&self) -> bool {
        matches!(self.mode, StickyMode::Cookie)
    }

    pub fn issue(&self, group: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name, group, self.ttl
        )
    }
}

/// FNV the value modulo total weight, then walk the groups to find the
/// containing interval.
fn hash_to_group(value: &[u8], groups: &[(String, u32)]) -> Option<String> {
    let total: u64 = groups.iter().map(|(_, w)| *w as u64).sum();
    if total == 0 {
        return None;
    }
    let mut point = (fnv32a(value) as u64) % total;
    for (name, weight) in groups {
        if point < *weight as u64 {
            return Some(name.clone());
        }
        point -= *weight as u64;
    }
    None
}
