//! Gateway assembly: config loading, listeners, discovery, shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use faasgate_common::{FuncConfig, GatewayError, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinError;
use tracing::info;

use crate::config::GatewayConfig;
use crate::discovery;
use crate::dispatcher::Dispatcher;
use crate::engine;
use crate::http_server;
use crate::node_manager::NodeManager;

pub struct GatewayService {
    config: GatewayConfig,
    dispatcher: Arc<Dispatcher>,
}

impl GatewayService {
    /// Loads the function config and wires up the dispatch core.
    ///
    /// # Arguments
    /// * `config` - The gateway configuration, usually built from flags
    ///
    /// # Returns
    /// A service ready to [`run`](Self::run), or a fatal error for an
    /// invalid configuration or an unreadable function config file
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let func_config = Arc::new(FuncConfig::load_from_file(&config.func_config_file)?);
        info!(
            "Loaded {} functions from {}",
            func_config.entries().len(),
            config.func_config_file.display()
        );
        let node_manager = Arc::new(NodeManager::new(
            func_config.clone(),
            config.default_func_capacity,
        ));
        let dispatcher = Arc::new(Dispatcher::new(func_config, node_manager));
        Ok(Self { config, dispatcher })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds the listeners, publishes the discovery record, and serves.
    ///
    /// # Returns
    /// - `Ok(())` - Orderly shutdown on SIGINT
    /// - `Err(...)` - A bind, discovery, or serve failure
    ///
    /// # Behavior
    /// - Binds the engine, HTTP, and (if configured) gRPC listeners with
    ///   the configured backlog
    /// - Publishes the ephemeral gateway-address record, removed on the way
    ///   out
    /// - Runs until a listener fails or a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let backlog = self.config.socket_listen_backlog;

        let engine_listener = bind_listener(self.config.engine_conn_addr(), backlog)?;
        info!(
            "Listen on {} for engine connections",
            self.config.engine_conn_addr()
        );
        let http_listener = bind_listener(self.config.http_addr(), backlog)?;
        info!("Listen on {} for HTTP requests", self.config.http_addr());
        let grpc_listener = match self.config.grpc_addr() {
            Some(addr) => {
                let listener = bind_listener(addr, backlog)?;
                info!("Listen on {addr} for gRPC requests");
                Some(listener)
            }
            None => None,
        };

        // Held for the lifetime of the server; dropping it on the way out
        // removes the record.
        let _discovery = match &self.config.registry_file {
            Some(path) => Some(discovery::publish(path, &self.config.gateway_addr())?),
            None => None,
        };

        let engine_task = tokio::spawn(engine::run_engine_listener(
            engine_listener,
            self.dispatcher.clone(),
        ));
        let http_app = http_server::client_router(self.dispatcher.clone());
        let http_task = tokio::spawn(async move {
            axum::serve(http_listener, http_app)
                .await
                .map_err(GatewayError::Io)
        });
        let grpc_task = match grpc_listener {
            Some(listener) => {
                let grpc_app = http_server::grpc_router(self.dispatcher.clone());
                tokio::spawn(async move {
                    axum::serve(listener, grpc_app)
                        .await
                        .map_err(GatewayError::Io)
                })
            }
            None => tokio::spawn(std::future::pending::<Result<()>>()),
        };

        tokio::select! {
            result = engine_task => flatten_join("Engine listener", result),
            result = http_task => flatten_join("HTTP server", result),
            result = grpc_task => flatten_join("gRPC server", result),
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let bind = || -> std::io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    };
    bind().map_err(|e| GatewayError::Connection(format!("Failed to listen on {}: {}", addr, e)))
}

fn flatten_join(
    what: &str,
    result: std::result::Result<Result<()>, JoinError>,
) -> Result<()> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(GatewayError::Connection(format!("{what} task failed: {e}"))),
    }
}
