//! The dispatch state machine.
//!
//! Three event kinds drive it, all arriving from connection tasks:
//! a client submits an invocation ([`Dispatcher::on_new_call`]), an engine
//! node becomes available ([`Dispatcher::on_node_available`]), or an engine
//! reports an invocation's outcome ([`Dispatcher::on_engine_message`]).
//! Internally every path takes the call-table mutex for a short critical
//! section and never holds it across a send.
//!
//! Failure semantics: the only retried condition is "no node pickable" (the
//! pending queue). An engine send failure surfaces to the client as
//! `NotFound`; an engine-reported failure surfaces as `Failed`; late or
//! duplicate engine replies are logged and dropped.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use faasgate_common::time::monotonic_micros;
use faasgate_common::{FuncCall, FuncConfig, GatewayMessage, MessageType};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::call_table::{CallTable, FuncCallState};
use crate::context::{CallStatus, ClientHandle, ClientKind, FuncCallContext};
use crate::node_manager::NodeManager;
use crate::stats::StatsSnapshot;

pub struct Dispatcher {
    func_config: Arc<FuncConfig>,
    node_manager: Arc<NodeManager>,
    table: Mutex<CallTable>,
    next_call_id: AtomicU32,
    next_connection_id: AtomicU64,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty call table.
    ///
    /// # Arguments
    /// * `func_config` - The immutable function lookup loaded at startup
    /// * `node_manager` - The shared engine-node tracker used for picking
    ///
    /// # Returns
    /// A new Dispatcher with `next_call_id` starting at 1
    pub fn new(func_config: Arc<FuncConfig>, node_manager: Arc<NodeManager>) -> Self {
        Self {
            func_config,
            node_manager,
            table: Mutex::new(CallTable::new()),
            next_call_id: AtomicU32::new(1),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn func_config(&self) -> &Arc<FuncConfig> {
        &self.func_config
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.node_manager
    }

    /// Registers a client connection.
    ///
    /// # Arguments
    /// * `kind` - Which protocol surface (HTTP or gRPC) owns the connection
    ///
    /// # Returns
    /// The new connection id and the receiving end of the connection's
    /// completion channel; finished call contexts arrive there
    pub fn register_connection(
        &self,
        kind: ClientKind,
    ) -> (u64, mpsc::UnboundedReceiver<FuncCallContext>) {
        let conn_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = ClientHandle::channel(kind);
        self.table.lock().unwrap().connections.insert(conn_id, handle);
        (conn_id, rx)
    }

    /// Removes a client connection.
    ///
    /// Callers discard any outstanding call (via [`Self::discard_call`])
    /// before removing the connection.
    ///
    /// # Arguments
    /// * `conn_id` - The id returned by [`Self::register_connection`]
    pub fn unregister_connection(&self, conn_id: u64) {
        self.table.lock().unwrap().connections.remove(&conn_id);
    }

    /// Marks an outstanding call as no longer wanted: its result will be
    /// dropped on arrival.
    ///
    /// The pending/running entry stays where it is; the normal completion or
    /// drain path reaps it, keeping node-manager accounting balanced.
    /// Idempotent.
    ///
    /// # Arguments
    /// * `func_call` - The identifier returned by [`Self::on_new_call`]
    pub fn discard_call(&self, func_call: FuncCall) {
        let mut table = self.table.lock().unwrap();
        table.discarded.insert(func_call.full_call_id());
    }

    /// A client connection has produced an invocation.
    ///
    /// The context either comes back through the connection's completion
    /// channel with a terminal status, or (for a synchronous call that is
    /// parked or dispatched) stays in the call table until the engine
    /// replies.
    ///
    /// # Arguments
    /// * `parent_conn_id` - The submitting connection's id
    /// * `ctx` - The parsed invocation; ownership moves into the dispatcher
    ///
    /// # Returns
    /// The assigned [`FuncCall`] when a synchronous call remains outstanding
    /// (the caller uses it for [`Self::discard_call`] on client disconnect),
    /// `None` when the call already reached a terminal status
    pub fn on_new_call(&self, parent_conn_id: u64, mut ctx: FuncCallContext) -> Option<FuncCall> {
        let Some(entry) = self.func_config.find_by_name(&ctx.func_name) else {
            return self.reject_not_found(parent_conn_id, ctx);
        };
        let method_id = match &ctx.method_name {
            Some(method) => {
                if !entry.is_grpc_service {
                    return self.reject_not_found(parent_conn_id, ctx);
                }
                match entry.grpc_method_ids.get(method.as_str()) {
                    Some(&id) => id,
                    None => return self.reject_not_found(parent_conn_id, ctx),
                }
            }
            None => 0,
        };

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed) as u16;
        let func_call = FuncCall::with_method(entry.func_id, method_id, 0, call_id);
        ctx.set_func_call(func_call);
        debug!("on_new_call: {func_call}");

        let is_async = ctx.is_async;
        let mut state = FuncCallState {
            func_call,
            connection_id: if is_async { None } else { Some(parent_conn_id) },
            context: None,
            recv_timestamp: 0,
            dispatch_timestamp: 0,
            owned_input: None,
        };

        let Some(node_id) = self.node_manager.pick(&func_call) else {
            // No node pickable: park in the pending queue.
            let mut table = self.table.lock().unwrap();
            Self::stamp_incoming(&mut table, &mut state);
            if is_async {
                // The client's buffer is not retained; keep our own copy.
                state.owned_input = Some(ctx.input.clone());
                table.pending.push_back(state);
                drop(table);
                // Async calls surface success on accept, not on completion.
                ctx.set_status(CallStatus::Success);
                self.finish_func_call(parent_conn_id, ctx);
                return None;
            }
            state.context = Some(ctx);
            table.pending.push_back(state);
            return Some(func_call);
        };

        {
            let mut table = self.table.lock().unwrap();
            Self::stamp_incoming(&mut table, &mut state);
        }

        let input = ctx.input.clone();
        let dispatched = self.dispatch_to_node(func_call, input, node_id);
        if is_async {
            ctx.set_status(if dispatched {
                CallStatus::Success
            } else {
                CallStatus::NotFound
            });
            self.finish_func_call(parent_conn_id, ctx);
            if dispatched {
                self.record_running(state);
            }
            None
        } else if dispatched {
            state.context = Some(ctx);
            self.record_running(state);
            Some(func_call)
        } else {
            ctx.set_status(CallStatus::NotFound);
            self.finish_func_call(parent_conn_id, ctx);
            None
        }
    }

    /// Handles one inbound engine message.
    ///
    /// Only `FuncCallComplete` and `FuncCallFailed` are meaningful here;
    /// anything else is logged and ignored.
    ///
    /// # Arguments
    /// * `node_id` - The node the message arrived from
    /// * `message` - The decoded envelope header
    /// * `payload` - The inline payload (the call output, when complete)
    pub fn on_engine_message(&self, node_id: u16, message: &GatewayMessage, payload: Bytes) {
        let complete = match message.message_type() {
            Some(MessageType::FuncCallComplete) => true,
            Some(MessageType::FuncCallFailed) => false,
            _ => {
                error!("Unknown engine message type {}", message.message_type);
                return;
            }
        };
        let func_call = message.func_call();
        self.node_manager.finished(&func_call, node_id);

        let full_id = func_call.full_call_id();
        let mut callback: Option<(ClientHandle, FuncCallContext)> = None;
        let mut failed_async_func: Option<u16> = None;
        {
            let mut table = self.table.lock().unwrap();
            let Some(mut state) = table.running.remove(&full_id) else {
                // Late or duplicate reply; benign, and no stats move here.
                error!("Cannot find running FuncCall: {func_call}");
                return;
            };
            let async_call = state.connection_id.is_none();
            let was_discarded = table.discarded.remove(&full_id);

            let now = monotonic_micros();
            let overhead = (now - state.dispatch_timestamp - message.processing_time as i64).max(0);
            table.stats.dispatch_overhead.add_sample(overhead as f64);
            if async_call && complete {
                let delay = (now - state.recv_timestamp) as f64;
                table
                    .per_func_stats(func_call.func_id)
                    .end2end_delay
                    .add_sample(delay);
            }

            if async_call {
                if !complete {
                    failed_async_func = Some(func_call.func_id);
                }
            } else if !was_discarded {
                if let Some(conn_id) = state.connection_id {
                    if let Some(handle) = table.connections.get(&conn_id) {
                        if let Some(ctx) = state.context.take() {
                            callback = Some((handle.clone(), ctx));
                        }
                    }
                }
            }
            // A discarded state drops here, result payload and all.
        }

        if let Some(func_id) = failed_async_func {
            match self.func_config.find_by_id(func_id) {
                Some(entry) => warn!("Async call of {} failed", entry.func_name),
                None => warn!("Async call of func_id {func_id} failed"),
            }
        }
        if let Some((handle, mut ctx)) = callback {
            if complete {
                ctx.set_status(CallStatus::Success);
                ctx.append_output(&payload);
            } else {
                ctx.set_status(CallStatus::Failed);
            }
            handle.finish(ctx);
        }
        self.drain_pending();
    }

    /// A new engine connection finished its handshake (or anything else
    /// happened that may unblock the queue).
    ///
    /// # Arguments
    /// * `node_id` - The node that became available
    pub fn on_node_available(&self, node_id: u16) {
        debug!("Node {node_id} available, draining pending calls");
        self.drain_pending();
    }

    /// Takes a snapshot of the current statistics, for the metrics endpoint.
    ///
    /// # Returns
    /// A serializable copy of the global counters, latency windows, and
    /// per-function entries at the time of the call
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let table = self.table.lock().unwrap();
        StatsSnapshot::capture(&table.stats, &table.per_func_stats)
    }

    fn drain_pending(&self) {
        // Bound the loop by the queue length seen at entry: arrivals during
        // the drain wait for the next trigger.
        let mut remaining = self.table.lock().unwrap().pending.len();
        while remaining > 0 {
            remaining -= 1;
            let state = {
                let mut table = self.table.lock().unwrap();
                let Some(state) = table.pending.pop_front() else {
                    break;
                };
                let full_id = state.func_call.full_call_id();
                if table.discarded.remove(&full_id) {
                    continue;
                }
                if let Some(conn_id) = state.connection_id {
                    if !table.connections.contains_key(&conn_id) {
                        // Client gone before a node freed up; drop silently.
                        continue;
                    }
                }
                state
            };

            let Some(node_id) = self.node_manager.pick(&state.func_call) else {
                // Still no capacity: the head goes back to the front.
                self.table.lock().unwrap().pending.push_front(state);
                break;
            };
            let dispatched = self.dispatch_to_node(state.func_call, state.input(), node_id);

            let failed_sync = {
                let mut table = self.table.lock().unwrap();
                let mut state = state;
                state.dispatch_timestamp = monotonic_micros();
                table
                    .stats
                    .queueing_delay
                    .add_sample((state.dispatch_timestamp - state.recv_timestamp) as f64);
                if dispatched {
                    let full_id = state.func_call.full_call_id();
                    table.running.insert(full_id, state);
                    let running = table.running.len();
                    table.stats.running_requests.add_sample(running as f64);
                    None
                } else if let Some(conn_id) = state.connection_id {
                    warn!("Failed to dispatch queued call {}", state.func_call);
                    state.context.take().map(|ctx| (conn_id, ctx))
                } else {
                    warn!("Failed to dispatch queued async call {}", state.func_call);
                    None
                }
            };
            if let Some((conn_id, mut ctx)) = failed_sync {
                ctx.set_status(CallStatus::NotFound);
                self.finish_func_call(conn_id, ctx);
            }
        }
    }

    /// Sends the dispatch envelope; on send failure the node reservation is
    /// released so `pick`/`finished` stay balanced.
    fn dispatch_to_node(&self, func_call: FuncCall, input: Bytes, node_id: u16) -> bool {
        let message = GatewayMessage::dispatch_func_call(func_call);
        let sent = self.node_manager.send_message(node_id, message, input);
        if !sent {
            self.node_manager.finished(&func_call, node_id);
        }
        sent
    }

    fn record_running(&self, mut state: FuncCallState) {
        let mut table = self.table.lock().unwrap();
        state.dispatch_timestamp = state.recv_timestamp;
        let full_id = state.func_call.full_call_id();
        table.running.insert(full_id, state);
        let running = table.running.len();
        table.stats.running_requests.add_sample(running as f64);
    }

    /// Stamps `recv_timestamp` and updates the arrival-rate stats; called
    /// once per new call, under the table lock.
    fn stamp_incoming(table: &mut CallTable, state: &mut FuncCallState) {
        let now = monotonic_micros();
        state.recv_timestamp = now;
        let adjusted = table.stats.tick_incoming(now);
        table
            .per_func_stats(state.func_call.func_id)
            .tick_incoming(adjusted);
        let inflight = table.pending.len() + table.running.len();
        table.stats.inflight_requests.add_sample(inflight as f64);
    }

    fn reject_not_found(&self, conn_id: u64, mut ctx: FuncCallContext) -> Option<FuncCall> {
        ctx.set_status(CallStatus::NotFound);
        self.finish_func_call(conn_id, ctx);
        None
    }

    /// Hands a finished context back through the parent connection's channel.
    /// A missing connection means the client is gone; the result is dropped.
    fn finish_func_call(&self, conn_id: u64, ctx: FuncCallContext) {
        let handle = self.table.lock().unwrap().connections.get(&conn_id).cloned();
        match handle {
            Some(handle) => handle.finish(ctx),
            None => debug!("Connection {conn_id} gone; dropping call result"),
        }
    }
}
