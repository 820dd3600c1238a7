use crate::config::RewriteConfig;
use anyhow::Result;

/// Pre-compiled target URL resolution for one route. Precedence per request:
/// full URL override, prefix rewrite, regex rewrite, legacy strip-prefix,
/// plain join of the backend base path and the request path.
pub struct RewriteRules {
    target_url: Option<String>,
    prefix: Option<(String, String)>,
    regex: Option<(regex::Regex, String)>,
    strip_prefix: Option<String>,
    host: Option<String>,
}

impl RewriteRules {
    pub fn compile(config: Option<&RewriteConfig>) -> Result<Self> {
        let Some(cfg) = config else {
            return Ok(Self::empty());
        };
        let regex = match (&cfg.regex_match, &cfg.regex_replacement) {
            (Some(pattern), Some(replacement)) => {
                Some((regex::Regex::new(pattern)?, replacement.clone()))
            }
            _ => None,
        };
        let prefix = match (&cfg.prefix_match, &cfg.prefix_replacement) {
            (Some(m), Some(r)) => Some((m.clone(), r.clone())),
            _ => None,
        };
        Ok(Self {
            target_url: cfg.target_url.clone(),
            prefix,
            regex,
            strip_prefix: cfg.strip_prefix.clone(),
            host: cfg.host.clone(),
        })
    }

    fn empty() -> Self {
        Self {
            target_url: None,
            prefix: None,
            regex: None,
            strip_prefix: None,
            host: None,
        }
    }

    /// Outbound Host header override, when configured.
    pub fn host_override(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Resolve the upstream URL for a request path and query against the
    /// selected backend's base URL.
    pub fn target(&self, backend: &http::Uri, path: &str, query: Option<&str>) -> String {
        // (a) full URL override. Its own query wins; otherwise the request's
        // query is preserved.
        if let Some(ref url) = self.target_url {
            if url.contains('?') {
                return url.clone();
            }
            return match query {
                Some(q) => format!("{}?{}", url, q),
                None => url.clone(),
            };
        }

        // (b) prefix rewrite, (c) regex rewrite, (d) legacy strip-prefix.
        let rewritten: String = if let Some((ref m, ref r)) = self.prefix {
            match path.strip_prefix(m.as_str()) {
                Some(rest) => format!("{}{}", r, rest),
                None => path.to_string(),
            }
        } else if let Some((ref re, ref replacement)) = self.regex {
            re.replace(path, replacement.as_str()).into_owned()
        } else if let Some(ref strip) = self.strip_prefix {
            match path.strip_prefix(strip.as_str()) {
                Some(rest) if rest.starts_with('/') => rest.to_string(),
                Some(rest) => format!("/{}", rest),
                None => path.to_string(),
            }
        } else {
            path.to_string()
        };

        let mut url = join_base(backend, &rewritten);
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

/// Join the backend base URL and a request path. If both sides carry a
/// slash, one is dropped; if neither does, one is inserted.
fn join_base(backend: &http::Uri, path: &str) -> String {
    let scheme = backend.scheme_str().unwrap_or("http");
    let authority = backend
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default();
    let base = backend.path().trim_end_matches('/');
    // base is now "" or "/x/y"; path joining is a plain concat with one
    // separating slash.
    if path.starts_with('/') {
        format!("{}://{}{}{}", scheme, authority, base, path)
    } else {
        format!("{}://{}{}/{}", scheme, authority, base, path)
    }
}
