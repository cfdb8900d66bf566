use eyre::WrapErr;
use std::net::SocketAddr;
use std::time::Duration;

/// Relay sessions idle for longer than this are evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the idle sweep on every tunnel connection.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Startup parameters of the frontend (UDP-facing) role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendConfig {
    /// Local UDP bind host for real clients.
    pub host: String,
    pub port: u16,
    /// Backend TCP endpoint the tunnel connects to.
    pub backend_host: String,
    pub backend_port: u16,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            host: "0.0.0.0".to_string(),
            port: 9999,
            backend_host: "127.0.0.1".to_string(),
            backend_port: 8888,
        }
    }
}

impl FrontendConfig {
    pub fn backend_endpoint(&self) -> String {
        endpoint(&self.backend_host, self.backend_port)
    }
}

/// Startup parameters of the backend (origin-facing) role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Local TCP bind host accepting frontend tunnels.
    pub host: String,
    pub port: u16,
    /// Origin UDP service every relay socket talks to.
    pub origin_host: String,
    pub origin_port: u16,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            host: "0.0.0.0".to_string(),
            port: 8888,
            origin_host: "127.0.0.1".to_string(),
            origin_port: 8211,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl BackendConfig {
    /// Resolves the origin once; the first address returned is used for
    /// every relay socket.
    pub async fn resolve_origin(&self) -> eyre::Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.origin_host.as_str(), self.origin_port))
            .await
            .wrap_err_with(|| format!("resolve origin {}", endpoint(&self.origin_host, self.origin_port)))?;
        match addrs.next() {
            Some(addr) => Ok(addr),
            None => eyre::bail!(
                "origin {} did not resolve to any address",
                endpoint(&self.origin_host, self.origin_port)
            ),
        }
    }
}

/// `host:port`, bracketing bare IPv6 literals.
fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
