//! Network failure diagnostics.
//!
//! Carrier and ISP level blocking tends to surface as a handful of recognisable
//! transport errors. Recognising them only affects what gets logged; the
//! original error is always returned to the caller unchanged.

use std::error::Error as StdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSignature {
    /// Name resolution failed or was answered with a bogus record
    DnsFailure,
    /// The connection was torn down mid-handshake or mid-request
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    /// A certificate for a different host was presented (transparent proxy)
    CertificateMismatch,
}

impl BlockSignature {
    pub fn hint(&self) -> &'static str {
        match self {
            BlockSignature::DnsFailure => {
                "DNS lookup failed; the ISP may be filtering this domain. Try a different DNS resolver"
            }
            BlockSignature::ConnectionReset => {
                "connection was reset; this is typical of deep packet inspection blocking"
            }
            BlockSignature::ConnectionRefused => "connection refused by the network path",
            BlockSignature::Timeout => {
                "request timed out; the host may be blackholed by the network provider"
            }
            BlockSignature::CertificateMismatch => {
                "certificate did not match the host; traffic may be intercepted"
            }
        }
    }
}

/// Flatten an error and all its sources into one lowercase-searchable line.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let inner_text = inner.to_string();
        if !text.contains(&inner_text) {
            text.push_str(": ");
            text.push_str(&inner_text);
        }
        source = inner.source();
    }
    text
}

pub fn classify_network_error(message: &str) -> Option<BlockSignature> {
    let msg = message.to_lowercase();

    if ["dns error", "failed to lookup address", "no such host", "name or service not known", "nodename nor servname"]
        .iter()
        .any(|m| msg.contains(m))
    {
        return Some(BlockSignature::DnsFailure);
    }
    if ["not valid for name", "certificate is not valid", "unknownissuer", "unknown issuer", "hostname mismatch", "invalid peer certificate"]
        .iter()
        .any(|m| msg.contains(m))
    {
        return Some(BlockSignature::CertificateMismatch);
    }
    if msg.contains("connection reset") || msg.contains("reset by peer") || msg.contains("broken pipe") {
        return Some(BlockSignature::ConnectionReset);
    }
    if msg.contains("connection refused") {
        return Some(BlockSignature::ConnectionRefused);
    }
    if msg.contains("timed out") || msg.contains("timeout") || msg.contains("deadline has elapsed") {
        return Some(BlockSignature::Timeout);
    }
    None
}

/// Log a hint when an unrecovered failure looks like network-level blocking.
pub fn check_and_log_isp_blocking(message: &str, url: &str, tag: &str) -> Option<BlockSignature> {
    let signature = classify_network_error(message)?;
    log_warn!(
        "[{}] possible ISP blocking for {} ({:?}): {} [{}]",
        tag,
        url,
        signature,
        signature.hint(),
        message
    );
    Some(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_common_signatures() {
        assert_eq!(
            classify_network_error("error sending request: dns error: failed to lookup address information"),
            Some(BlockSignature::DnsFailure)
        );
        assert_eq!(
            classify_network_error("Connection reset by peer (os error 104)"),
            Some(BlockSignature::ConnectionReset)
        );
        assert_eq!(
            classify_network_error("invalid peer certificate: NotValidForName"),
            Some(BlockSignature::CertificateMismatch)
        );
        assert_eq!(classify_network_error("HTTP 404"), None);
    }

    #[test]
    fn error_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "inner cause");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, io);
        assert!(error_chain(&outer).contains("inner cause"));
    }
}
