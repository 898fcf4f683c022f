use serde::{Deserialize, Serialize};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub rtp: RtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Path to the browser client static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
}

/// Connection settings for the media-processing server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// WebSocket URI of the media server JSON-RPC endpoint
    #[serde(default = "default_backend_uri")]
    pub uri: String,
    /// Per-RPC response timeout in seconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

/// Optional RTP forwarding of negotiated media to an external receiver.
///
/// When enabled, each negotiated session additionally feeds its media into
/// an RTP endpoint pointed at `address:port` (recvonly H.264).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Receiver IPv4 address
    #[serde(default = "default_rtp_address")]
    pub address: String,
    /// Receiver RTP port
    #[serde(default = "default_rtp_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            web_root: default_web_root(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            uri: default_backend_uri(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl Default for RtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_rtp_address(),
            port: default_rtp_port(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- TLS cert/key ---
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {} // Fine — auto-generated
        }

        // --- Port ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        // --- Backend URI ---
        if !self.backend.uri.starts_with("ws://") && !self.backend.uri.starts_with("wss://") {
            issues.push(format!(
                "ERROR: backend.uri '{}' must start with 'ws://' or 'wss://'. \
                 Example: ws://localhost:8888/kurento",
                self.backend.uri
            ));
        }

        // --- Response timeout ---
        if self.backend.response_timeout_secs == 0 {
            issues.push(
                "ERROR: backend.response_timeout_secs must be >= 1. \
                 A zero timeout would fail every media server call."
                    .to_string(),
            );
        } else if self.backend.response_timeout_secs > 300 {
            issues.push(format!(
                "WARNING: backend.response_timeout_secs is {}s — stalled negotiations \
                 will hold client sessions open for that long. Typical values: 5-30.",
                self.backend.response_timeout_secs
            ));
        }

        // --- RTP forwarding ---
        if self.rtp.enabled {
            if self.rtp.address.trim().is_empty() {
                issues.push("ERROR: rtp.address must be set when rtp.enabled is true.".to_string());
            }
            if self.rtp.port == 0 {
                issues.push("ERROR: rtp.port must be between 1 and 65535, got 0.".to_string());
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_web_root() -> String {
    "static".to_string()
}
fn default_backend_uri() -> String {
    "ws://localhost:8888/kurento".to_string()
}
fn default_response_timeout() -> u64 {
    10
}
fn default_rtp_address() -> String {
    "127.0.0.1".to_string()
}
fn default_rtp_port() -> u16 {
    15000
}
