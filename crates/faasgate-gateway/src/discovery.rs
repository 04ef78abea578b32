//! Ephemeral service-discovery record.
//!
//! On startup the gateway publishes `hostname:engine_conn_port` so engines
//! can find it and connect back; the record is removed again on orderly
//! shutdown. Publish failure at startup is fatal.

use std::fs;
use std::path::{Path, PathBuf};

use faasgate_common::{GatewayError, Result};
use tracing::{info, warn};

/// A published gateway-address record, removed when dropped.
#[derive(Debug)]
pub struct DiscoveryRecord {
    path: PathBuf,
}

pub fn publish(path: &Path, gateway_addr: &str) -> Result<DiscoveryRecord> {
    fs::write(path, gateway_addr).map_err(|e| {
        GatewayError::Config(format!(
            "Failed to publish gateway address to {}: {}",
            path.display(),
            e
        ))
    })?;
    info!("Published gateway address {gateway_addr} to {}", path.display());
    Ok(DiscoveryRecord {
        path: path.to_path_buf(),
    })
}

impl Drop for DiscoveryRecord {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove discovery record {}: {e}", self.path.display());
        }
    }
}
