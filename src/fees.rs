//! Tiered maker/taker fee schedule with a rolling volume window (§4.4, C5).

use crate::decimal::Decimal;
use crate::ids::{AgentId, BookId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One rate tier: agents whose rolling volume reaches `volume_required`
/// (and falls short of the next tier's) pay `maker_rate`/`taker_rate`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeTier {
    pub volume_required: Decimal,
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

/// A single traded-volume contribution, timestamped so it can expire out
/// of the rolling window.
#[derive(Debug, Clone, Copy)]
struct VolumeEntry {
    at: Timestamp,
    volume: Decimal,
}

/// Tiered maker/taker fee schedule, tracked per `(book, agent)` against a
/// rolling trailing-volume window shared by every account.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    /// Ascending by `volume_required`; index 0 is the base (lowest) tier.
    tiers: Vec<FeeTier>,
    window: u64,
    history: HashMap<(BookId, AgentId), Vec<VolumeEntry>>,
    /// Per-agent rate overrides (§6 Config's `FeePolicy.Tiers[] + per-agent
    /// overrides`), checked ahead of the tier ladder. An overridden agent
    /// still accrues rolling volume normally — the override only changes
    /// which rate `rates` returns, not tier bookkeeping.
    overrides: HashMap<AgentId, FeeTier>,
}

impl FeePolicy {
    /// `tiers` need not be pre-sorted; this constructor sorts them
    /// ascending by `volume_required` and keeps the lowest tier as the
    /// default.
    pub fn new(mut tiers: Vec<FeeTier>, window: u64) -> Self {
        tiers.sort_by(|a, b| a.volume_required.partial_cmp(&b.volume_required).unwrap());
        FeePolicy {
            tiers,
            window,
            history: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Pins `agent`'s maker/taker rates regardless of its rolling volume.
    /// `tier.volume_required` is ignored for an override; it's only
    /// consulted for the normal tier ladder.
    pub fn set_override(&mut self, agent: AgentId, tier: FeeTier) {
        self.overrides.insert(agent, tier);
    }

    pub fn clear_override(&mut self, agent: AgentId) {
        self.overrides.remove(&agent);
    }

    fn rolling_volume(&self, book: BookId, agent: AgentId) -> Decimal {
        self.history
            .get(&(book, agent))
            .map(|entries| entries.iter().fold(Decimal::ZERO, |acc, e| acc + e.volume))
            .unwrap_or(Decimal::ZERO)
    }

    /// Highest tier whose `volume_required <= rollingVolume`, or the base
    /// tier if none qualifies (or no tiers are configured at all, in which
    /// case rates are zero).
    pub fn rates(&self, book: BookId, agent: AgentId) -> FeeTier {
        if let Some(tier) = self.overrides.get(&agent) {
            return *tier;
        }
        let volume = self.rolling_volume(book, agent);
        self.tiers
            .iter()
            .rev()
            .find(|t| t.volume_required <= volume)
            .copied()
            .or_else(|| self.tiers.first().copied())
            .unwrap_or(FeeTier {
                volume_required: Decimal::ZERO,
                maker_rate: Decimal::ZERO,
                taker_rate: Decimal::ZERO,
            })
    }

    /// Records a fill's volume against `(book, agent)`'s rolling history,
    /// used for the next tier lookup.
    pub fn record_volume(&mut self, book: BookId, agent: AgentId, at: Timestamp, volume: Decimal) {
        self.history
            .entry((book, agent))
            .or_default()
            .push(VolumeEntry { at, volume });
    }

    /// `updateFeeTiers`: expires history entries older than the rolling
    /// window relative to `cutoff`.
    pub fn update_fee_tiers(&mut self, cutoff: Timestamp) {
        let window = self.window;
        for entries in self.history.values_mut() {
            entries.retain(|e| cutoff.0.saturating_sub(e.at.0) < window);
        }
        self.history.retain(|_, entries| !entries.is_empty());
    }

    /// `resetHistory`: erases rolling volume for the given agents across
    /// all books, used by `RESET_AGENT`.
    pub fn reset_history(&mut self, agents: &[AgentId]) {
        self.history.retain(|(_, agent), _| !agents.contains(agent));
    }
}
