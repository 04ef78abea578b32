//! # faasgate entry point
//!
//! Starts the FaaS gateway: three listeners (engine connections, client
//! HTTP, optional gRPC), the dispatch core, and the service-discovery
//! record.
//!
//! ## Usage
//!
//! ```bash
//! faasgate --engine-conn-port 10007 --http-port 8080 \
//!     --func-config-file func_config.json \
//!     --hostname gateway.internal --num-io-workers 4
//! ```
//!
//! Exit code is zero on orderly shutdown (SIGINT) and nonzero on any fatal
//! initialization failure (bad config, bind failure, discovery failure).

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use faasgate_gateway::{GatewayConfig, GatewayService};

/// FaaS gateway: accepts function invocations over HTTP/gRPC and dispatches
/// them to engine nodes.
#[derive(FromArgs)]
struct Args {
    /// address to bind the listening sockets to
    #[argh(option, default = "IpAddr::from([0, 0, 0, 0])")]
    listen_addr: IpAddr,

    /// port reserved for backend engine connections
    #[argh(option)]
    engine_conn_port: u16,

    /// port for client HTTP traffic
    #[argh(option)]
    http_port: u16,

    /// optional port for gRPC-mapped traffic
    #[argh(option)]
    grpc_port: Option<u16>,

    /// number of IO worker threads
    #[argh(option, default = "2")]
    num_io_workers: usize,

    /// TCP listen backlog for all listeners
    #[argh(option, default = "64")]
    socket_listen_backlog: u32,

    /// hostname published for engines to connect back to
    #[argh(option, default = "\"127.0.0.1\".to_string()")]
    hostname: String,

    /// path to the function config JSON file
    #[argh(option)]
    func_config_file: PathBuf,

    /// optional path for the ephemeral gateway-address record
    #[argh(option)]
    registry_file: Option<PathBuf>,

    /// default per-node in-flight cap per function (0 = unlimited)
    #[argh(option, default = "0")]
    default_func_capacity: u32,
}

impl Args {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            listen_addr: self.listen_addr,
            engine_conn_port: self.engine_conn_port,
            http_port: self.http_port,
            grpc_port: self.grpc_port,
            num_io_workers: self.num_io_workers,
            socket_listen_backlog: self.socket_listen_backlog,
            hostname: self.hostname,
            func_config_file: self.func_config_file,
            registry_file: self.registry_file,
            default_func_capacity: self.default_func_capacity,
        }
    }
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    // Default log level INFO; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = args.into_config();
    tracing::info!("Start {} IO workers", config.num_io_workers);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_io_workers)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async {
        let service = GatewayService::new(config)?;
        service.run().await
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["faasgate"], args).unwrap()
    }

    #[test]
    fn test_parse_minimal() {
        let args = parse(&[
            "--engine-conn-port",
            "10007",
            "--http-port",
            "8080",
            "--func-config-file",
            "funcs.json",
        ]);
        assert_eq!(args.engine_conn_port, 10007);
        assert_eq!(args.http_port, 8080);
        assert_eq!(args.func_config_file, PathBuf::from("funcs.json"));
        assert_eq!(args.listen_addr, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(args.num_io_workers, 2);
        assert_eq!(args.socket_listen_backlog, 64);
        assert!(args.grpc_port.is_none());
        assert!(args.registry_file.is_none());
        assert_eq!(args.default_func_capacity, 0);
    }

    #[test]
    fn test_parse_full() {
        let args = parse(&[
            "--listen-addr",
            "127.0.0.1",
            "--engine-conn-port",
            "10007",
            "--http-port",
            "8080",
            "--grpc-port",
            "50051",
            "--num-io-workers",
            "8",
            "--socket-listen-backlog",
            "128",
            "--hostname",
            "gw.internal",
            "--func-config-file",
            "funcs.json",
            "--registry-file",
            "/tmp/gateway_addr",
            "--default-func-capacity",
            "16",
        ]);
        assert_eq!(args.listen_addr, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(args.grpc_port, Some(50051));
        assert_eq!(args.num_io_workers, 8);
        assert_eq!(args.hostname, "gw.internal");
        assert_eq!(args.default_func_capacity, 16);

        let config = args.into_config();
        assert_eq!(config.gateway_addr(), "gw.internal:10007");
    }

    #[test]
    fn test_missing_required_flag_fails() {
        assert!(Args::from_args(&["faasgate"], &["--http-port", "8080"]).is_err());
    }
}
