//! Narrow trait boundaries for every component this crate puts out of
//! scope: config/checkpoint file I/O, log formatting and placement,
//! validator network transport, IPC primitives, RNG algorithm choice,
//! and trading-decision logic. Each trait ships one obvious default
//! implementation so the core engine runs standalone — in tests, in
//! benchmarks, and as a library embedded in something that supplies
//! its own — without any of them.
//!
//! One trait per concern, each paired with a standard-library-backed
//! default implementation alongside it.

use crate::config::{Checkpoint, SimulationConfig};
use crate::decimal::Decimal;
use crate::error::{EngineError, EngineResult};
use crate::ids::{BookId, Timestamp};
use crate::message::Message;
use crate::simulation::{BlockState, RemoteNotice};
use std::sync::Mutex;

/// Parses a configuration document's bytes into the typed
/// [`SimulationConfig`] tree. The wire format (XML in the original,
/// left to the implementation here) is the out-of-scope part; the
/// resulting tree is not.
pub trait ConfigLoader {
    fn load(&self, bytes: &[u8]) -> EngineResult<SimulationConfig>;
}

/// `serde_json`-backed loader — the typed config surface deserializes
/// through `serde_json` regardless of what a deployment's source
/// format is.
#[derive(Debug, Default)]
pub struct JsonConfigLoader;

impl ConfigLoader for JsonConfigLoader {
    fn load(&self, bytes: &[u8]) -> EngineResult<SimulationConfig> {
        serde_json::from_slice(bytes).map_err(|e| EngineError::Config(e.to_string()))
    }
}

/// One L2 book-state row: `Date,Time,Symbol,Market,BidVol,BidPrice,
/// AskVol,AskPrice,,,,BidLevels,AskLevels` (§6). Row formatting and
/// file placement are deployment concerns; only the fields are ambient.
pub trait L2Logger: Send {
    #[allow(clippy::too_many_arguments)]
    fn log_l2(&mut self, book_id: BookId, at: Timestamp, bid_vol: Decimal, bid_price: Decimal, ask_vol: Decimal, ask_price: Decimal, bid_levels: u32, ask_levels: u32);
}

/// One L3 event row: `date,time,<json event>` (§6). Fed directly from
/// [`crate::record::L3Record`]'s entries.
pub trait L3Logger: Send {
    fn log_l3(&mut self, book_id: BookId, at: Timestamp, event: &serde_json::Value);
}

/// One fee accrual, for the `FeeLog` child node.
pub trait FeeLogger: Send {
    fn log_fee(&mut self, book_id: BookId, agent: &str, maker_fee: Decimal, taker_fee: Decimal);
}

/// One balance snapshot, used for debug-mode balance tracing around
/// every match.
pub trait BalanceLogger: Send {
    fn log_balance(&mut self, at: Timestamp, agent: &str, base: Decimal, quote: Decimal);
}

/// In-memory default for every logger trait above: appends rather than
/// writing anywhere, useful for tests that only want to assert on what
/// would have been logged.
#[derive(Debug, Default)]
pub struct MemoryLog<T> {
    pub entries: Vec<T>,
}

impl L2Logger for MemoryLog<(BookId, Timestamp, Decimal, Decimal, Decimal, Decimal, u32, u32)> {
    fn log_l2(&mut self, book_id: BookId, at: Timestamp, bid_vol: Decimal, bid_price: Decimal, ask_vol: Decimal, ask_price: Decimal, bid_levels: u32, ask_levels: u32) {
        self.entries.push((book_id, at, bid_vol, bid_price, ask_vol, ask_price, bid_levels, ask_levels));
    }
}

impl L3Logger for MemoryLog<(BookId, Timestamp, serde_json::Value)> {
    fn log_l3(&mut self, book_id: BookId, at: Timestamp, event: &serde_json::Value) {
        self.entries.push((book_id, at, event.clone()));
    }
}

impl FeeLogger for MemoryLog<(BookId, String, Decimal, Decimal)> {
    fn log_fee(&mut self, book_id: BookId, agent: &str, maker_fee: Decimal, taker_fee: Decimal) {
        self.entries.push((book_id, agent.to_string(), maker_fee, taker_fee));
    }
}

impl BalanceLogger for MemoryLog<(Timestamp, String, Decimal, Decimal)> {
    fn log_balance(&mut self, at: Timestamp, agent: &str, base: Decimal, quote: Decimal) {
        self.entries.push((at, agent.to_string(), base, quote));
    }
}

/// Persists/restores a [`Checkpoint`]. File naming and truncating
/// already-written logs to the checkpointed byte offsets are out of
/// scope; only the typed shape and the save/load boundary are ambient.
pub trait CheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> EngineResult<()>;
    fn load(&self) -> EngineResult<Checkpoint>;
}

/// In-memory `CheckpointStore`. Useful for tests and for embedding the
/// engine somewhere that wants checkpoint/resume semantics without a
/// filesystem.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slot: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        *self.slot.lock().unwrap() = Some(checkpoint.clone());
        Ok(())
    }

    fn load(&self) -> EngineResult<Checkpoint> {
        self.slot.lock().unwrap().clone().ok_or_else(|| EngineError::Io("no checkpoint saved".to_string()))
    }
}

/// File-backed `CheckpointStore`: JSON on disk, written through a
/// temp-file-then-rename so a crash mid-write never leaves a
/// half-written checkpoint behind (§7's I/O error policy). Truncating
/// the log files named in `Checkpoint::log_truncation` back to their
/// recorded offsets is left to the caller — this only owns the
/// checkpoint document itself.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    pub path: std::path::PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        FileCheckpointStore { path: path.into() }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(checkpoint).map_err(|e| EngineError::Io(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|e| EngineError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(())
    }

    fn load(&self) -> EngineResult<Checkpoint> {
        let bytes = std::fs::read(&self.path).map_err(|e| EngineError::Io(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| EngineError::Io(e.to_string()))
    }
}

/// Publishes a [`crate::simulation::SimulationManager`] step's
/// aggregated state and returns whatever remote notices come back —
/// the role `/bookStateEndpoint` plays in the source. Bounded timeouts
/// and retry/backoff on the actual network call belong to the
/// implementation, not this boundary.
pub trait ValidatorTransport {
    fn publish_state(&self, states: &[BlockState]) -> EngineResult<Vec<RemoteNotice>>;
}

/// No-op transport for single-process runs: nothing is remote, so
/// every publish round returns no notices.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl ValidatorTransport for NoopTransport {
    fn publish_state(&self, _states: &[BlockState]) -> EngineResult<Vec<RemoteNotice>> {
        Ok(Vec::new())
    }
}

/// One inbound/outbound channel to another process. The primitive
/// behind it (named pipe, Unix socket, shared-memory ring) is out of
/// scope; only this send/receive boundary is.
pub trait IpcPrimitive: Send {
    fn send(&mut self, message: &Message) -> EngineResult<()>;
    fn try_recv(&mut self) -> EngineResult<Option<Message>>;
}

/// Deterministic pseudo-random source for the `Balances` generators
/// (§6's `pareto`/`pareto-50`) and any future stochastic process. The
/// algorithm is out of scope; only this seed/next boundary is ambient,
/// so tests can swap in a fixed sequence without touching callers.
pub trait RngSource {
    fn seed(&mut self, seed: u64);
    fn next_u64(&mut self) -> u64;
}

/// `splitmix64`: adequate for tests and for any caller that doesn't
/// need a specific published distribution.
#[derive(Debug, Default)]
pub struct CounterRng(u64);

impl RngSource for CounterRng {
    fn seed(&mut self, seed: u64) {
        self.0 = seed;
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

/// Trading-decision logic: given every message a step delivered to
/// this agent, returns the messages it wants to send next. The
/// thinnest trait in this module on purpose — decision logic is the
/// one piece of the whole system spec.md rules out of scope.
pub trait TraderAgent: Send {
    fn name(&self) -> &str;
    fn on_messages(&mut self, at: Timestamp, inbox: &[Message]) -> Vec<Message>;
}

/// An agent that never acts on what it receives. Useful as a
/// placeholder for agents whose balances matter (margin-call sweeps,
/// subscriptions) but whose order flow a test drives directly instead.
#[derive(Debug)]
pub struct SilentAgent(pub String);

impl TraderAgent for SilentAgent {
    fn name(&self) -> &str {
        &self.0
    }

    fn on_messages(&mut self, _at: Timestamp, _inbox: &[Message]) -> Vec<Message> {
        Vec::new()
    }
}
