use std::{env, fmt};

use crate::error::{HarnessErr, Result};

const TCP_SCHEME: &str = "tcp://";
const ENV_SCHEME: &str = "env://";

/// A parsed rendezvous address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMethod {
    host: String,
    port: u16,
}

impl InitMethod {
    /// Parses `tcp://host:port`, or `env://` which reads `MASTER_ADDR` and `MASTER_PORT`.
    ///
    /// # Returns
    /// A `Config` error for any other scheme or a malformed address.
    pub fn parse(address: &str) -> Result<Self> {
        if let Some(rest) = address.strip_prefix(TCP_SCHEME) {
            let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
                HarnessErr::Config(format!("rendezvous address {address} has no port"))
            })?;

            return Self::new(host, port);
        }

        if address == ENV_SCHEME {
            let host = env::var("MASTER_ADDR")
                .map_err(|e| HarnessErr::Config(format!("env:// needs MASTER_ADDR: {e}")))?;
            let port = env::var("MASTER_PORT")
                .map_err(|e| HarnessErr::Config(format!("env:// needs MASTER_PORT: {e}")))?;

            return Self::new(&host, &port);
        }

        Err(HarnessErr::Config(format!(
            "unsupported rendezvous address {address}, expected {TCP_SCHEME}host:port or {ENV_SCHEME}"
        )))
    }

    fn new(host: &str, port: &str) -> Result<Self> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(HarnessErr::Config("rendezvous host is empty".to_string()));
        }

        let port = port
            .parse()
            .map_err(|e| HarnessErr::Config(format!("invalid rendezvous port {port}: {e}")))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` form accepted by the socket APIs.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TCP_SCHEME}{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_addresses() {
        let init = InitMethod::parse("tcp://localhost:1640").unwrap();
        assert_eq!(init.host(), "localhost");
        assert_eq!(init.port(), 1640);
        assert_eq!(init.socket_addr(), "localhost:1640");
        assert_eq!(init.to_string(), "tcp://localhost:1640");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let init = InitMethod::parse("tcp://[::1]:29500").unwrap();
        assert_eq!(init.host(), "::1");
        assert_eq!(init.socket_addr(), "[::1]:29500");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["localhost:1640", "tcp://localhost", "tcp://:1640", "tcp://h:port", "udp://h:1"] {
            assert!(
                matches!(InitMethod::parse(bad), Err(HarnessErr::Config(_))),
                "{bad} should be rejected"
            );
        }
    }
}
