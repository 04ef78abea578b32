//! Gateway configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use faasgate_common::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address all three listeners bind to.
    pub listen_addr: IpAddr,
    /// Port reserved for backend engine connections.
    pub engine_conn_port: u16,
    /// Port for client HTTP traffic.
    pub http_port: u16,
    /// Port for gRPC-mapped traffic, if served.
    pub grpc_port: Option<u16>,
    pub num_io_workers: usize,
    pub socket_listen_backlog: u32,
    /// Hostname published for engines to connect back to.
    pub hostname: String,
    pub func_config_file: PathBuf,
    /// Where to publish the ephemeral gateway-address record, if anywhere.
    pub registry_file: Option<PathBuf>,
    /// Default per-node in-flight cap per function when the function config
    /// carries no `max_workers` hint. Zero means unlimited.
    pub default_func_capacity: u32,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_io_workers == 0 {
            return Err(GatewayError::Config(
                "num_io_workers must be positive".to_string(),
            ));
        }
        if self.hostname.is_empty() {
            return Err(GatewayError::Config("hostname must be set".to_string()));
        }
        Ok(())
    }

    pub fn engine_conn_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.engine_conn_port)
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.http_port)
    }

    pub fn grpc_addr(&self) -> Option<SocketAddr> {
        self.grpc_port
            .map(|port| SocketAddr::new(self.listen_addr, port))
    }

    /// The record engines read to find this gateway.
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.engine_conn_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            listen_addr: IpAddr::from([127, 0, 0, 1]),
            engine_conn_port: 10007,
            http_port: 8080,
            grpc_port: None,
            num_io_workers: 2,
            socket_listen_backlog: 64,
            hostname: "gateway.local".to_string(),
            func_config_file: PathBuf::from("func_config.json"),
            registry_file: None,
            default_func_capacity: 0,
        }
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut no_workers = config();
        no_workers.num_io_workers = 0;
        assert!(no_workers.validate().is_err());

        let mut no_hostname = config();
        no_hostname.hostname.clear();
        assert!(no_hostname.validate().is_err());
    }

    #[test]
    fn test_addrs() {
        let config = config();
        assert_eq!(config.engine_conn_addr().port(), 10007);
        assert_eq!(config.http_addr().port(), 8080);
        assert!(config.grpc_addr().is_none());
        assert_eq!(config.gateway_addr(), "gateway.local:10007");
    }
}
