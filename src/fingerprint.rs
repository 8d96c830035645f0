//! Browser-like TLS client used when the default stack gets challenged.
//!
//! Anti-bot front ends score the ClientHello: cipher suite order, supported
//! groups and the ALPN offer. This client presents Chrome's ordering and
//! offers `h2` before `http/1.1`; when the server does not select `h2` the
//! connection continues over HTTP/1.1.

use std::time::Duration;

/// Whether this build can perform the fingerprint retry at all.
pub const FINGERPRINT_AVAILABLE: bool = cfg!(not(target_os = "ios"));

#[cfg(not(target_os = "ios"))]
pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let config = chrome_tls_config()?;
    let client = reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(30))
        .gzip(true)
        .brotli(true)
        .build()?;
    Ok(client)
}

/// The fingerprint path is structurally unavailable on this platform.
#[cfg(target_os = "ios")]
pub fn build_client(_timeout: Duration) -> anyhow::Result<reqwest::Client> {
    anyhow::bail!("TLS fingerprint client is not available on this platform")
}

#[cfg(not(target_os = "ios"))]
fn chrome_tls_config() -> anyhow::Result<rustls::ClientConfig> {
    use rustls::crypto::ring::{cipher_suite, default_provider, kx_group};
    use std::sync::Arc;

    let mut provider = default_provider();
    // Chrome's preference order
    provider.cipher_suites = vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ];
    provider.kx_groups = vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1];

    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(all(test, not(target_os = "ios")))]
mod tests {
    use super::*;

    #[test]
    fn config_prefers_h2_then_http11() {
        let config = chrome_tls_config().unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert!(FINGERPRINT_AVAILABLE);
    }
}
