use crate::config::TransportConfig;
use crate::proxy::context::BoxBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_verify: false` — the common case for internal
/// / mesh traffic where encryption is desired but upstream identity
/// verification is not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Named upstream transports with a built-in "default". Each transport owns
/// its hyper client and therefore its connection pool, so routes with
/// different pool knobs never share connections.
pub struct TransportPool {
    transports: HashMap<String, HttpClient>,
    default: HttpClient,
}

impl TransportPool {
    pub fn from_configs(configs: &[TransportConfig]) -> Self {
        let mut transports = HashMap::new();
        let mut default = None;
        for cfg in configs {
            let client = build_transport(cfg);
            if cfg.name == "default" {
                default = Some(client.clone());
            }
            transports.insert(cfg.name.clone(), client);
        }
        Self {
            transports,
            default: default.unwrap_or_else(|| build_transport(&TransportConfig::default())),
        }
    }

    pub fn get(&self, name: Option<&str>) -> &HttpClient {
        name.and_then(|n| self.transports.get(n))
            .unwrap_or(&self.default)
    }
}

/// Build a hyper `Client` that supports both HTTP and HTTPS upstreams.
///
/// - Plain `http://` connections go through the inner `HttpConnector`.
/// - `https://` connections are terminated with rustls (ring backend).
/// - HTTP/2 is negotiated via ALPN for TLS connections when enabled;
///   plain HTTP connections stay on HTTP/1.1.
pub fn build_transport(cfg: &TransportConfig) -> HttpClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(cfg.idle_conn_timeout)));
    http.set_connect_timeout(Some(Duration::from_secs(cfg.dial_timeout)));
    http.enforce_http(false);

    let builder = if cfg.tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
    };

    let https = if cfg.http2 {
        builder.enable_http1().enable_http2().wrap_connector(http)
    } else {
        builder.enable_http1().wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(cfg.idle_conn_timeout))
        .pool_max_idle_per_host(cfg.max_idle_per_host)
        .build(https)
}
