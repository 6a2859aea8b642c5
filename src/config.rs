//! Serde-deserializable configuration tree (§6).
//!
//! The wire format a real deployment parses from (XML in the original)
//! is a `collaborators::ConfigLoader` concern; this module only owns
//! the typed shape everything else in the crate consumes, and
//! deserializes it through `serde_json` (the ambient config surface
//! isn't excluded by the parser-implementation non-goal, only the
//! parsing itself is).

use crate::clearing::ExchangeParams;
use crate::decimal::Decimal;
use crate::fees::FeeTier;
use crate::ids::{AgentId, BookId, OrderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unit `start`/`duration`/`step` are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timescale {
    S,
    Ms,
    Us,
    Ns,
}

impl Default for Timescale {
    fn default() -> Self {
        Timescale::Ms
    }
}

/// Top-level document: `start`, `duration`, `step`, `timescale`,
/// `seed?`, `debug?`, plus one nested node per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub start: u64,
    pub duration: u64,
    pub step: u64,
    #[serde(default)]
    pub timescale: Timescale,
    pub seed: Option<u64>,
    #[serde(default)]
    pub debug: bool,
    pub agents: Vec<AgentConfig>,
    pub exchange: ExchangeConfig,
    pub books: BooksConfig,
    pub fee_policy: FeePolicyConfig,
    pub balances: BalancesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// One registered agent. `remote` mirrors `AgentId::is_remote`: a
/// remote agent's orders arrive distributed-wrapped and are routed
/// through a validator proxy rather than decided locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub remote: bool,
}

/// Static exchange-wide parameters shared by every book in a block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeConfig {
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub base_decimals: u32,
    pub quote_decimals: u32,
    pub max_leverage: Decimal,
    pub max_loan: Decimal,
    pub maintenance_margin: Decimal,
    pub initial_price: Decimal,
}

impl ExchangeConfig {
    /// Narrows to the subset `ClearingManager::new` actually needs.
    /// `max_open_orders` isn't an `Exchange` field in the wire document
    /// (it sits on `Books` alongside the other per-instance limits); the
    /// caller supplies it here rather than this type assuming a default.
    pub fn to_params(self, max_open_orders: usize) -> ExchangeParams {
        ExchangeParams {
            price_decimals: self.price_decimals,
            volume_decimals: self.volume_decimals,
            max_leverage: self.max_leverage,
            maintenance_margin: self.maintenance_margin,
            max_open_orders,
        }
    }
}

/// Exogenous process declaration (§6 Books' `Processes[]`) — e.g. a
/// zero-intelligence order-flow generator. Trading-decision logic is
/// out of scope, so this is carried as an opaque, named parameter bag
/// rather than a typed variant per process kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooksConfig {
    pub instance_count: u32,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub max_depth: u32,
    pub detailed_depth: u32,
    /// Active-order cap per (agent, book); validation's
    /// `activeOrders[bookId].size >= maxOpenOrders` rejection.
    pub max_open_orders: usize,
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

fn default_algorithm() -> String {
    "PriceTime".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTierConfig {
    pub volume_required: Decimal,
    pub maker: Decimal,
    pub taker: Decimal,
}

impl From<FeeTierConfig> for FeeTier {
    fn from(t: FeeTierConfig) -> Self {
        FeeTier { volume_required: t.volume_required, maker_rate: t.maker, taker_rate: t.taker }
    }
}

/// One agent's pinned rate, independent of its rolling volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFeeOverride {
    pub agent: String,
    pub maker: Decimal,
    pub taker: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePolicyConfig {
    pub tiers: Vec<FeeTierConfig>,
    #[serde(default)]
    pub window: u64,
    #[serde(default)]
    pub agent_overrides: Vec<AgentFeeOverride>,
}

impl FeePolicyConfig {
    pub fn tiers(&self) -> Vec<FeeTier> {
        self.tiers.iter().cloned().map(FeeTier::from).collect()
    }

    /// Resolves each override's agent name against `agent_ids`, skipping
    /// any name the caller hasn't registered. Applied to a fresh
    /// `FeePolicy` via `FeePolicy::set_override` after construction.
    pub fn resolved_overrides(&self, agent_ids: &HashMap<String, AgentId>) -> Vec<(AgentId, FeeTier)> {
        self.agent_overrides
            .iter()
            .filter_map(|o| {
                let id = *agent_ids.get(&o.agent)?;
                Some((id, FeeTier { volume_required: Decimal::ZERO, maker_rate: o.maker, taker_rate: o.taker }))
            })
            .collect()
    }
}

/// Initial balance assignment: either a fixed `(base, quote)` pair for
/// every agent, or a Pareto-distributed draw (`"pareto"` draws once per
/// agent; `"pareto-50"` additionally floors every draw at the median of
/// the distribution, matching the source's two named generators).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BalancesConfig {
    Fixed { base: Decimal, quote: Decimal },
    Pareto { base: Decimal, quote: Decimal, alpha: Decimal },
    Pareto50 { base: Decimal, quote: Decimal, alpha: Decimal },
}

impl BalancesConfig {
    /// Materializes one `(base, quote)` pair per book for a single
    /// agent, consulting `rng` only for the Pareto variants. The RNG
    /// algorithm itself is a collaborator concern
    /// ([`crate::collaborators::RngSource`]); this only defines what the
    /// draw is used for.
    pub fn generate(&self, num_books: usize, rng: &mut dyn crate::collaborators::RngSource) -> Vec<(Decimal, Decimal)> {
        match self {
            BalancesConfig::Fixed { base, quote } => vec![(*base, *quote); num_books],
            BalancesConfig::Pareto { base, quote, alpha } => (0..num_books).map(|_| (pareto_draw(*base, *alpha, rng), pareto_draw(*quote, *alpha, rng))).collect(),
            BalancesConfig::Pareto50 { base, quote, alpha } => (0..num_books)
                .map(|_| (pareto_draw(*base, *alpha, rng).max(*base), pareto_draw(*quote, *alpha, rng).max(*quote)))
                .collect(),
        }
    }
}

/// `scale / u^(1/alpha)` for `u` uniform on `(0, 1]`, the standard
/// inverse-CDF Pareto draw, scaled so the distribution's minimum is
/// `scale`.
fn pareto_draw(scale: Decimal, alpha: Decimal, rng: &mut dyn crate::collaborators::RngSource) -> Decimal {
    let u = ((rng.next_u64() >> 11) as f64) / ((1u64 << 53) as f64);
    let u = u.max(f64::MIN_POSITIVE);
    let alpha = alpha.to_f64().max(0.01);
    let factor = u.powf(-1.0 / alpha);
    Decimal::from_f64(scale.to_f64() * factor)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2LogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L3LogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub start_date: Option<String>,
    #[serde(default)]
    pub l2: L2LogConfig,
    #[serde(default)]
    pub l3: L3LogConfig,
    #[serde(default)]
    pub fee_log: FeeLogConfig,
    #[serde(default)]
    pub replay: ReplayLogConfig,
}

/// Block-coordination parameters `SimulationManager::fromConfig` reads
/// off the same document: how many blocks, how many books per block
/// (the dimension `BookIdCanon` canonicalizes against), how long to
/// wait past `duration` before tearing the run down, and the optional
/// validator endpoints online mode publishes state to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    #[serde(default)]
    pub grace_period: u64,
    pub network: Option<NetworkConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig { block_count: default_block_count(), grace_period: 0, network: None }
    }
}

fn default_block_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub book_state_endpoint: String,
    pub general_msg_endpoint: String,
}

/// Checkpoint document (§6): enough to resume a block without
/// replaying its entire message history. `collaborators::CheckpointStore`
/// owns turning this into/out of bytes on disk; this is only the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// The original configuration, with every monotonic id counter
    /// patched to its checkpointed value (§6: "`id`/`current` patched").
    pub config: SimulationConfig,
    pub books: Vec<BookCheckpoint>,
    /// Byte offset each log file had been truncated to when the
    /// checkpoint was taken, keyed by path.
    pub log_truncation: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookCheckpoint {
    pub book_id: BookId,
    pub next_order_id: u64,
    pub next_trade_id: u64,
    /// Orders open at checkpoint time, re-placed in init-mode
    /// (matching disabled) on resume, per (agent, order id).
    pub active_orders: Vec<(AgentId, OrderId)>,
}
