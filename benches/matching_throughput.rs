//! Matching-engine throughput, timed by hand since this target runs
//! with `harness = false`. Populates a book with resting orders across
//! a spread of price levels, then times a batch of crossing orders
//! that walk the book and measures fills/sec.

use std::hint::black_box;
use std::time::Instant;
use taosim_exchange::clearing::ExchangeParams;
use taosim_exchange::decimal::Decimal;
use taosim_exchange::exchange::{BookConfig, MultiBookExchange};
use taosim_exchange::fees::FeeTier;
use taosim_exchange::ids::{AgentId, BookId, Timestamp};
use taosim_exchange::message::{MessagePayload, PlaceOrderLimitPayload};
use taosim_exchange::order::{Currency, Direction, SettleFlag, StpFlag, TimeInForce};

fn params() -> ExchangeParams {
    ExchangeParams {
        price_decimals: 4,
        volume_decimals: 4,
        max_leverage: Decimal::ZERO,
        maintenance_margin: Decimal::ZERO,
        max_open_orders: 1_000_000,
    }
}

fn resting_limit(direction: Direction, volume: f64, price: f64) -> MessagePayload {
    MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
        book_id: BookId(0),
        direction,
        volume: Decimal::from_f64(volume),
        price: Decimal::from_f64(price),
        leverage: Decimal::ZERO,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::None,
        post_only: false,
        time_in_force: TimeInForce::Gtc,
        expiry_period: None,
        currency: Currency::Base,
        client_order_id: None,
    })
}

/// Builds a book with `depth` resting sell orders spread one tick apart
/// above 100, each from a distinct maker agent.
fn populate_resting_book(depth: u64) -> MultiBookExchange {
    let mut ex = MultiBookExchange::new(
        vec![BookConfig { price_decimals: 4, volume_decimals: 4, params: params() }],
        vec![FeeTier { volume_required: Decimal::ZERO, maker_rate: Decimal::ZERO, taker_rate: Decimal::ZERO }],
        86_400,
    );
    ex.register_agent("taker", AgentId(-1), &[(Decimal::from_int(1_000_000), Decimal::from_int(1_000_000_000))]);
    for i in 0..depth {
        let maker = AgentId(-(2 + i as i64));
        ex.register_agent(format!("maker-{i}"), maker, &[(Decimal::from_int(1_000_000), Decimal::from_int(1_000_000_000))]);
        ex.handle(Timestamp(0), &format!("maker-{i}"), &resting_limit(Direction::Sell, 1.0, 100.0 + i as f64 * 0.01));
    }
    ex
}

fn bench_matching_throughput(depth: u64, rounds: u64) {
    let mut ex = populate_resting_book(depth);
    let start = Instant::now();
    for round in 0..rounds {
        let outs = ex.handle(Timestamp(round + 1), "taker", &resting_limit(Direction::Buy, 1.0, 100.0 + (round % depth) as f64 * 0.01));
        black_box(outs);
    }
    let elapsed = start.elapsed();
    let per_op = elapsed / rounds.max(1) as u32;
    println!(
        "matching_throughput depth={depth:>6} rounds={rounds:>6} total={elapsed:>10?} per_op={per_op:>10?} ops/sec={:>12.0}",
        rounds as f64 / elapsed.as_secs_f64()
    );
}

fn bench_resting_order_insertion(depth: u64) {
    let mut ex = MultiBookExchange::new(
        vec![BookConfig { price_decimals: 4, volume_decimals: 4, params: params() }],
        vec![FeeTier { volume_required: Decimal::ZERO, maker_rate: Decimal::ZERO, taker_rate: Decimal::ZERO }],
        86_400,
    );
    ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(1_000_000), Decimal::from_int(1_000_000_000))]);

    let start = Instant::now();
    for i in 0..depth {
        let outs = ex.handle(Timestamp(i), "maker", &resting_limit(Direction::Sell, 1.0, 100.0 + i as f64 * 0.01));
        black_box(outs);
    }
    let elapsed = start.elapsed();
    println!(
        "resting_order_insertion depth={depth:>6} total={elapsed:>10?} ops/sec={:>12.0}",
        depth as f64 / elapsed.as_secs_f64()
    );
}

fn main() {
    for &depth in &[100u64, 1_000, 10_000] {
        bench_resting_order_insertion(depth);
    }
    for &depth in &[100u64, 1_000, 10_000] {
        bench_matching_throughput(depth, 10_000);
    }
}
