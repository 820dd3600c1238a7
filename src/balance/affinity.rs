use super::{cookie_value, Balancer, RequestKey, Selection};
use crate::config::SessionAffinityConfig;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::sync::Arc;

/// Pins a client to a specific backend via a cookie whose value is the
/// base64url-encoded backend URL. Wraps any balancer: the first request (or
/// any request whose pinned backend went unhealthy) falls through to the
/// inner balancer and a fresh cookie is issued.
pub struct SessionAffinityBalancer {
    inner: Arc<Balancer>,
    config: SessionAffinityConfig,
}

impl SessionAffinityBalancer {
    pub fn new(inner: Arc<Balancer>, config: SessionAffinityConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &Arc<Balancer> {
        &self.inner
    }

    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        if let Some(raw) = cookie_value(key.headers, &self.config.cookie_name) {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(raw.as_bytes()) {
                if let Ok(url) = String::from_utf8(bytes) {
                    let pinned = self
                        .inner
                        .backends()
                        .into_iter()
                        .find(|b| b.url() == url && b.is_healthy());
                    if let Some(backend) = pinned {
                        return Some(Selection {
                            backend,
                            group: String::new(),
                            set_cookie: None,
                        });
                    }
                }
            }
        }

        let mut selection = self.inner.next_for_request(key)?;
        // Pin the fresh choice; an inner sticky cookie loses to the
        // affinity cookie (a backend is strictly narrower than a group).
        selection.set_cookie = Some(self.issue(selection.backend.url()));
        Some(selection)
    }

    fn issue(&self, backend_url: &str) -> String {
        let value = URL_SAFE_NO_PAD.encode(backend_url.as_bytes());
        let mut cookie = format!(
            "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite={}",
            self.config.cookie_name, value, self.config.path, self.config.ttl, self.config.same_site
        );
        if self.config.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}
