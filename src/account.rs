//! Agent identity and per-agent, per-book balance/active-order bookkeeping
//! (§3, C4).
//!
//! `AccountRegistry` exclusively owns every agent's [`Balances`] vector —
//! the rest of the engine only ever borrows through it.

use crate::balances::{Balances, RoundParams};
use crate::decimal::Decimal;
use crate::error::{EngineError, EngineResult};
use crate::ids::{AgentId, BookId, OrderId};
use std::collections::{HashMap, HashSet};

/// One agent's state across every book in a block: a `Balances` per book
/// and the set of that agent's currently-resting order ids per book.
#[derive(Debug, Clone)]
pub struct Account {
    pub agent_id: AgentId,
    balances: Vec<Balances>,
    active_orders: Vec<HashSet<OrderId>>,
}

impl Account {
    fn new(agent_id: AgentId, num_books: usize, initial: &[(Decimal, Decimal)], round_params: &[RoundParams]) -> Self {
        let balances = (0..num_books)
            .map(|i| {
                let (base, quote) = initial.get(i).copied().unwrap_or((Decimal::ZERO, Decimal::ZERO));
                let rp = round_params.get(i).copied().unwrap_or(RoundParams { base_decimals: 8, quote_decimals: 8 });
                Balances::new(base, quote, rp)
            })
            .collect();
        Account {
            agent_id,
            balances,
            active_orders: (0..num_books).map(|_| HashSet::new()).collect(),
        }
    }

    pub fn balances(&self, book: BookId) -> Option<&Balances> {
        self.balances.get(book.0 as usize)
    }

    pub fn balances_mut(&mut self, book: BookId) -> Option<&mut Balances> {
        self.balances.get_mut(book.0 as usize)
    }

    pub fn active_orders(&self, book: BookId) -> Option<&HashSet<OrderId>> {
        self.active_orders.get(book.0 as usize)
    }

    pub fn active_order_count(&self, book: BookId) -> usize {
        self.active_orders(book).map(HashSet::len).unwrap_or(0)
    }

    /// `orderCreated`: §4.2.
    pub fn register_active_order(&mut self, book: BookId, id: OrderId) {
        if let Some(set) = self.active_orders.get_mut(book.0 as usize) {
            set.insert(id);
        }
    }

    /// `unregister`: §4.2.
    pub fn unregister_active_order(&mut self, book: BookId, id: OrderId) {
        if let Some(set) = self.active_orders.get_mut(book.0 as usize) {
            set.remove(&id);
        }
    }

    /// Cancels every open order across all books by releasing reservations
    /// and clearing the active-order sets. Used by `RESET_AGENT` and
    /// `CLOSE_POSITIONS` (the caller is responsible for also emitting
    /// `CANCEL_ORDERS` against each book's own order state).
    pub fn release_all_reservations(&mut self) {
        for (book_idx, orders) in self.active_orders.iter_mut().enumerate() {
            let Some(balances) = self.balances.get_mut(book_idx) else { continue };
            for id in orders.drain() {
                balances.release_reservation(id);
            }
        }
    }

    /// `RESET_AGENT`: restores every book's balances to a saved snapshot
    /// and clears active-order bookkeeping. Queued-message filtering is
    /// the scheduler's responsibility (§5).
    pub fn reset(&mut self, snapshot: Vec<Balances>) {
        self.balances = snapshot;
        for set in &mut self.active_orders {
            set.clear();
        }
    }
}

/// Maps agent identity (both local and remote) to a numeric index and owns
/// every agent's per-book [`Balances`] and active-order sets.
#[derive(Debug, Default)]
pub struct AccountRegistry {
    num_books: usize,
    round_params: Vec<RoundParams>,
    index_of: HashMap<AgentId, usize>,
    accounts: Vec<Account>,
}

impl AccountRegistry {
    pub fn new(num_books: usize, round_params: Vec<RoundParams>) -> Self {
        AccountRegistry {
            num_books,
            round_params,
            index_of: HashMap::new(),
            accounts: Vec::new(),
        }
    }

    pub fn num_books(&self) -> usize {
        self.num_books
    }

    /// Registers a new agent with `initial[i] = (base, quote)` starting
    /// balances for book `i`; re-registering an existing agent is a no-op
    /// that returns its existing index.
    pub fn register(&mut self, agent_id: AgentId, initial: &[(Decimal, Decimal)]) -> usize {
        if let Some(&idx) = self.index_of.get(&agent_id) {
            return idx;
        }
        let idx = self.accounts.len();
        self.accounts.push(Account::new(agent_id, self.num_books, initial, &self.round_params));
        self.index_of.insert(agent_id, idx);
        idx
    }

    pub fn get(&self, agent_id: AgentId) -> EngineResult<&Account> {
        self.index_of
            .get(&agent_id)
            .and_then(|&idx| self.accounts.get(idx))
            .ok_or_else(|| EngineError::UnknownTarget(agent_id.to_string()))
    }

    pub fn get_mut(&mut self, agent_id: AgentId) -> EngineResult<&mut Account> {
        let idx = *self
            .index_of
            .get(&agent_id)
            .ok_or_else(|| EngineError::UnknownTarget(agent_id.to_string()))?;
        self.accounts.get_mut(idx).ok_or_else(|| EngineError::UnknownTarget(agent_id.to_string()))
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.accounts.iter().map(|a| a.agent_id)
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn accounts_mut(&mut self) -> &mut [Account] {
        &mut self.accounts
    }
}
