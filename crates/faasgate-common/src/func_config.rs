//! Function configuration: the read-only lookup resolving user-facing
//! function names to the numeric ids used on the wire.
//!
//! The config is a JSON array loaded once at startup:
//!
//! ```json
//! [
//!   { "func_name": "hello", "func_id": 7 },
//!   { "func_name": "Greeter", "func_id": 8, "grpc_service": true,
//!     "grpc_methods": ["SayHello", "SayBye"], "max_workers": 4 }
//! ]
//! ```
//!
//! gRPC method ids are positional: the first listed method gets id 0.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::protocol::error::{GatewayError, Result};

#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
    func_name: String,
    func_id: u16,
    #[serde(default)]
    grpc_service: bool,
    #[serde(default)]
    grpc_methods: Vec<String>,
    #[serde(default)]
    min_workers: u32,
    #[serde(default)]
    max_workers: u32,
}

/// One configured function.
#[derive(Debug, Clone)]
pub struct FuncEntry {
    pub func_name: String,
    pub func_id: u16,
    pub is_grpc_service: bool,
    /// Method name -> method id; empty unless `is_grpc_service`.
    pub grpc_method_ids: HashMap<String, u16>,
    /// Scheduling hints; zero means unset.
    pub min_workers: u32,
    pub max_workers: u32,
}

/// Immutable name/id lookup over the configured functions.
#[derive(Debug, Default)]
pub struct FuncConfig {
    entries: Vec<FuncEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<u16, usize>,
}

impl FuncConfig {
    /// Parses the JSON config, validating that names and ids are unique.
    ///
    /// # Arguments
    ///
    /// * `json` - The contents of the function config file
    ///
    /// # Returns
    ///
    /// The loaded lookup table
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The input is not a valid JSON array of entries
    /// - A name or id is empty, zero, or duplicated
    /// - gRPC methods are listed for a non-gRPC function
    ///
    /// # Example
    ///
    /// ```
    /// use faasgate_common::FuncConfig;
    ///
    /// let config = FuncConfig::load(
    ///     r#"[ { "func_name": "hello", "func_id": 7 } ]"#,
    /// ).unwrap();
    /// assert_eq!(config.find_by_name("hello").unwrap().func_id, 7);
    /// ```
    pub fn load(json: &str) -> Result<Self> {
        let raw: Vec<RawEntry> = serde_json::from_str(json)?;
        let mut config = Self::default();
        for entry in raw {
            if entry.func_name.is_empty() {
                return Err(GatewayError::Config("Empty func_name".to_string()));
            }
            if entry.func_id == 0 {
                return Err(GatewayError::Config(format!(
                    "func_id must be nonzero: {}",
                    entry.func_name
                )));
            }
            if config.by_name.contains_key(&entry.func_name) {
                return Err(GatewayError::Config(format!(
                    "Duplicate func_name: {}",
                    entry.func_name
                )));
            }
            if config.by_id.contains_key(&entry.func_id) {
                return Err(GatewayError::Config(format!(
                    "Duplicate func_id: {}",
                    entry.func_id
                )));
            }
            if !entry.grpc_service && !entry.grpc_methods.is_empty() {
                return Err(GatewayError::Config(format!(
                    "grpc_methods given for non-gRPC function {}",
                    entry.func_name
                )));
            }
            let grpc_method_ids = entry
                .grpc_methods
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i as u16))
                .collect::<HashMap<_, _>>();
            if grpc_method_ids.len() != entry.grpc_methods.len() {
                return Err(GatewayError::Config(format!(
                    "Duplicate gRPC method on {}",
                    entry.func_name
                )));
            }
            let index = config.entries.len();
            config.by_name.insert(entry.func_name.clone(), index);
            config.by_id.insert(entry.func_id, index);
            config.entries.push(FuncEntry {
                func_name: entry.func_name,
                func_id: entry.func_id,
                is_grpc_service: entry.grpc_service,
                grpc_method_ids,
                min_workers: entry.min_workers,
                max_workers: entry.max_workers,
            });
        }
        Ok(config)
    }

    /// Reads and parses the config file at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the function config JSON file
    ///
    /// # Returns
    ///
    /// The loaded lookup table, or a config error naming the file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::load(&contents)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&FuncEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn find_by_id(&self, func_id: u16) -> Option<&FuncEntry> {
        self.by_id.get(&func_id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[FuncEntry] {
        &self.entries
    }
}
