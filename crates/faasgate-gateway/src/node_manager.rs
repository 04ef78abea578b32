//! Engine-node liveness and load tracking.
//!
//! The node manager owns the sending half of every engine link and decides
//! which node serves a new invocation. The default policy is round-robin
//! across connected nodes with a per-node, per-function in-flight cap (the
//! function's `max_workers` hint when set, otherwise a configurable default;
//! zero means unlimited). Every successful [`NodeManager::pick`] reserves one
//! slot that a matching [`NodeManager::finished`] releases, whatever the
//! outcome of the call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use faasgate_common::{FuncCall, FuncConfig, GatewayMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sending half of one engine link. The receiving end is drained by the
/// link's writer task, so pushing here never blocks.
pub type EngineSender = mpsc::UnboundedSender<(GatewayMessage, Bytes)>;

#[derive(Debug)]
struct EngineLinkHandle {
    conn_id: u16,
    sender: EngineSender,
}

#[derive(Debug, Default)]
struct NodeState {
    links: Vec<EngineLinkHandle>,
    next_link: usize,
    inflight: u32,
    per_func_inflight: HashMap<u16, u32>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<u16, NodeState>,
    rr_cursor: usize,
}

pub struct NodeManager {
    func_config: Arc<FuncConfig>,
    default_func_capacity: u32,
    inner: Mutex<Inner>,
}

impl NodeManager {
    /// Creates a node manager with no connected nodes.
    ///
    /// # Arguments
    /// * `func_config` - Used for per-function `max_workers` capacity hints
    /// * `default_func_capacity` - Per-node in-flight cap for functions
    ///   without a hint; zero means unlimited
    pub fn new(func_config: Arc<FuncConfig>, default_func_capacity: u32) -> Self {
        Self {
            func_config,
            default_func_capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers one connection of an engine node.
    ///
    /// Idempotent: re-registering an existing `(node_id, conn_id)` replaces
    /// the stale sender.
    ///
    /// # Arguments
    /// * `node_id` - The engine node the connection belongs to
    /// * `conn_id` - The connection's id within the node
    /// * `sender` - The sending half of the link's writer channel
    ///
    /// # Returns
    /// `true` when this is the node's first live connection
    pub fn register_link(&self, node_id: u16, conn_id: u16, sender: EngineSender) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.nodes.entry(node_id).or_default();
        let new_node = node.links.is_empty();
        if let Some(link) = node.links.iter_mut().find(|l| l.conn_id == conn_id) {
            debug!("Replacing engine link (node_id={node_id}, conn_id={conn_id})");
            link.sender = sender;
        } else {
            node.links.push(EngineLinkHandle { conn_id, sender });
        }
        if new_node {
            info!("Engine node {node_id} connected");
        }
        new_node
    }

    /// Removes one connection; the node is retired when its last link goes.
    ///
    /// In-flight calls attributed to a retired node are not reassigned; the
    /// engine's failure messages (or their absence) settle them. Idempotent.
    ///
    /// # Arguments
    /// * `node_id` - The engine node the connection belonged to
    /// * `conn_id` - The connection's id within the node
    pub fn unregister_link(&self, node_id: u16, conn_id: u16) {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(&node_id) else {
            return;
        };
        node.links.retain(|l| l.conn_id != conn_id);
        if node.links.is_empty() {
            inner.nodes.remove(&node_id);
            info!("Engine node {node_id} retired");
        }
    }

    /// Picks a node for a new invocation, reserving one in-flight slot on it.
    ///
    /// Every `Some` result must be balanced by a matching
    /// [`Self::finished`], whatever the outcome of the call.
    ///
    /// # Arguments
    /// * `func_call` - The invocation to place; only `func_id` matters here
    ///
    /// # Returns
    /// - `Some(node_id)` - A node with capacity, its reservation counted
    /// - `None` - No connected node has capacity for `func_call.func_id`
    pub fn pick(&self, func_call: &FuncCall) -> Option<u16> {
        let cap = self.func_capacity(func_call.func_id);
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.is_empty() {
            return None;
        }
        let node_ids: Vec<u16> = inner.nodes.keys().copied().collect();
        let start = inner.rr_cursor;
        for offset in 0..node_ids.len() {
            let node_id = node_ids[(start + offset) % node_ids.len()];
            let Some(node) = inner.nodes.get_mut(&node_id) else {
                continue;
            };
            let func_inflight = node
                .per_func_inflight
                .get(&func_call.func_id)
                .copied()
                .unwrap_or(0);
            if cap > 0 && func_inflight >= cap {
                continue;
            }
            node.inflight += 1;
            *node.per_func_inflight.entry(func_call.func_id).or_insert(0) += 1;
            inner.rr_cursor = (start + offset + 1) % node_ids.len();
            return Some(node_id);
        }
        None
    }

    /// Releases the reservation taken by a successful [`Self::pick`].
    ///
    /// # Arguments
    /// * `func_call` - The invocation the reservation was taken for
    /// * `node_id` - The node [`Self::pick`] returned for it
    pub fn finished(&self, func_call: &FuncCall, node_id: u16) {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(&node_id) else {
            // Node already retired; its accounting went with it.
            debug!("finished() for retired node {node_id}");
            return;
        };
        node.inflight = node.inflight.saturating_sub(1);
        if let Some(count) = node.per_func_inflight.get_mut(&func_call.func_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                node.per_func_inflight.remove(&func_call.func_id);
            }
        }
    }

    /// Sends one envelope to a node over any of its live links.
    ///
    /// Non-blocking: the frame is pushed onto the link's writer channel.
    /// Dead links found on the way are pruned.
    ///
    /// # Arguments
    /// * `node_id` - The target node
    /// * `message` - The envelope header; `payload_size` is filled on write
    /// * `payload` - The inline payload
    ///
    /// # Returns
    /// - `true` - The frame was queued on a live link
    /// - `false` - The node is gone or all of its links are dead
    pub fn send_message(&self, node_id: u16, message: GatewayMessage, payload: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(&node_id) else {
            warn!("send_message to unknown node {node_id}");
            return false;
        };
        while !node.links.is_empty() {
            let index = node.next_link % node.links.len();
            node.next_link = node.next_link.wrapping_add(1);
            match node.links[index]
                .sender
                .send((message, payload.clone()))
            {
                Ok(()) => return true,
                Err(_) => {
                    let conn_id = node.links[index].conn_id;
                    warn!("Engine link (node_id={node_id}, conn_id={conn_id}) is dead, pruning");
                    node.links.remove(index);
                }
            }
        }
        false
    }

    /// Gets the number of connected nodes.
    ///
    /// # Returns
    /// The number of nodes with at least one live link
    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Current in-flight count on a node.
    ///
    /// # Arguments
    /// * `node_id` - The node to inspect
    ///
    /// # Returns
    /// The node's reserved in-flight count, zero when the node is unknown
    pub fn inflight(&self, node_id: u16) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(&node_id)
            .map(|n| n.inflight)
            .unwrap_or(0)
    }

    fn func_capacity(&self, func_id: u16) -> u32 {
        match self.func_config.find_by_id(func_id) {
            Some(entry) if entry.max_workers > 0 => entry.max_workers,
            _ => self.default_func_capacity,
        }
    }
}
