//! Message-ordering priority queue and step-loop delivery (§4.6, C10).
//!
//! Owned exclusively by one `Simulation` — no other code ever sees the
//! pending queue directly. Orders by `(arrival, secondaryPriority)`;
//! within identical keys, FIFO of issuance (§5 ordering guarantees).

use crate::ids::Timestamp;
use crate::message::Message;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug)]
struct QueuedMessage {
    arrival: Timestamp,
    secondary_priority: u64,
    /// Issuance order, used to break ties at identical
    /// `(arrival, secondary_priority)` — FIFO per §5.
    sequence: u64,
    message: Message,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueuedMessage {}

impl QueuedMessage {
    fn key(&self) -> (Timestamp, u64, u64) {
        (self.arrival, self.secondary_priority, self.sequence)
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; wrap in `Reverse` at the call site so
        // the earliest `(arrival, secondaryPriority, sequence)` pops first.
        self.key().cmp(&other.key())
    }
}

/// Priority queue of not-yet-delivered messages, plus the monotonic
/// sequence/secondary-priority counters the scheduler hands out on
/// `queue_message`.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Reverse<QueuedMessage>>,
    current: Timestamp,
    next_sequence: u64,
}

impl Scheduler {
    pub fn new(start: Timestamp) -> Self {
        Scheduler {
            queue: BinaryHeap::new(),
            current: start,
            next_sequence: 0,
        }
    }

    pub fn current(&self) -> Timestamp {
        self.current
    }

    /// Enqueues `message`, assigning it the next issuance sequence number
    /// for FIFO tie-breaking.
    pub fn queue_message(&mut self, message: Message) {
        let arrival = message.arrival;
        let secondary_priority = message.secondary_priority;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push(Reverse(QueuedMessage { arrival, secondary_priority, sequence, message }));
    }

    /// `step()`: advances time to `current + step_size`, draining every
    /// message with `arrival < cutoff` in `(arrival, secondaryPriority,
    /// issuance)` order, then sets `current = max(current, cutoff)`.
    pub fn step(&mut self, step_size: u64) -> Vec<Message> {
        let cutoff = self.current.checked_add(step_size);
        let mut drained = Vec::new();
        while let Some(Reverse(top)) = self.queue.peek() {
            if top.arrival >= cutoff {
                break;
            }
            let Some(Reverse(queued)) = self.queue.pop() else { break };
            drained.push(queued.message);
        }
        self.current = Timestamp(self.current.0.max(cutoff.0));
        drained
    }

    /// `RESET_AGENT`: drops every queued message whose `source` names the
    /// reset agent, so none of its stale intents execute after reset.
    pub fn drop_agent_messages(&mut self, agent_name: &str) {
        let remaining: Vec<Reverse<QueuedMessage>> =
            self.queue.drain().filter(|Reverse(q)| q.message.source != agent_name).collect();
        self.queue = remaining.into_iter().collect();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Expands a message's `targets` list against the set of known agent
/// names, resolving `"*"` (self + all agents), `"EXCHANGE"` (the
/// exchange itself, passed through unchanged), and `"PREFIX*"` wildcard
/// entries; anything else is an exact agent name, passed through
/// unchanged for the caller to match.
pub fn resolve_targets<'a>(targets: &'a [String], known_agents: &'a [String]) -> Vec<&'a str> {
    let mut resolved = Vec::new();
    for target in targets {
        if target == "*" {
            resolved.extend(known_agents.iter().map(String::as_str));
        } else if let Some(prefix) = target.strip_suffix('*') {
            resolved.extend(known_agents.iter().map(String::as_str).filter(|a| a.starts_with(prefix)));
        } else {
            resolved.push(target.as_str());
        }
    }
    resolved
}
