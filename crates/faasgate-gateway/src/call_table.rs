//! The authoritative in-memory state of pending and running invocations.
//!
//! One `std::sync::Mutex<CallTable>` (owned by the dispatcher) protects all
//! of it; critical sections are short and never span a send or an `.await`.
//! The stats block lives in the same table so that timestamped samples keep
//! their strictly-increasing semantics without a second lock.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use faasgate_common::FuncCall;

use crate::context::{ClientHandle, FuncCallContext};
use crate::stats::{PerFuncStats, StatsBlock};

/// Lifecycle record for one invocation, owned by the call table.
#[derive(Debug)]
pub struct FuncCallState {
    pub func_call: FuncCall,
    /// `None` for async (fire-and-forget) calls.
    pub connection_id: Option<u64>,
    /// Present while a synchronous call is pending or running; moved back to
    /// the client when the call finishes.
    pub context: Option<FuncCallContext>,
    pub recv_timestamp: i64,
    pub dispatch_timestamp: i64,
    /// Owned copy of the input, populated only for async calls parked in the
    /// pending queue (the client's buffer is not retained).
    pub owned_input: Option<Bytes>,
}

impl FuncCallState {
    /// The input bytes to put on the wire for this call.
    pub fn input(&self) -> Bytes {
        if let Some(ctx) = &self.context {
            ctx.input.clone()
        } else {
            self.owned_input.clone().unwrap_or_default()
        }
    }
}

/// Invariants, maintained by the dispatcher:
/// - `pending` and `running` are disjoint on `full_call_id`.
/// - every id in `discarded` is still in `pending`/`running` or in flight
///   with an engine, awaiting its reply.
/// - `connections` membership is authoritative for "is this client still
///   interested"; callers discard outstanding calls before removing an entry.
#[derive(Debug)]
pub struct CallTable {
    pub pending: VecDeque<FuncCallState>,
    pub running: HashMap<u64, FuncCallState>,
    pub discarded: HashSet<u64>,
    pub connections: HashMap<u64, ClientHandle>,
    pub stats: StatsBlock,
    pub per_func_stats: HashMap<u16, PerFuncStats>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            running: HashMap::new(),
            discarded: HashSet::new(),
            connections: HashMap::new(),
            stats: StatsBlock::new(),
            per_func_stats: HashMap::new(),
        }
    }

    /// Per-function stats entry, created lazily on first use.
    pub fn per_func_stats(&mut self, func_id: u16) -> &mut PerFuncStats {
        self.per_func_stats.entry(func_id).or_default()
    }
}
