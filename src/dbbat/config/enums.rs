use serde::{Deserialize, Serialize};

/// TLS preference for the connection between DBBat and the upstream server.
/// There is no verify-ca/verify-full: the proxy does not validate upstream
/// certificates (see DangerousCertificateNonverifier).
#[derive(Deserialize, Serialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never use TLS
    Disable,
    /// Use TLS when the server permits it, fall back to plaintext otherwise
    Prefer,
    /// Require TLS, fail the session if the server refuses
    Require,
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Prefer
    }
}
