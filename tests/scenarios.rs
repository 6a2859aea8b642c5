//! End-to-end scenario tests driven directly against `MultiBookExchange`,
//! one per named behavior in the matching/clearing walkthrough.

use taosim_exchange::clearing::ExchangeParams;
use taosim_exchange::decimal::Decimal;
use taosim_exchange::exchange::{BookConfig, MultiBookExchange};
use taosim_exchange::fees::FeeTier;
use taosim_exchange::ids::{AgentId, BookId, OrderId, Timestamp};
use taosim_exchange::message::*;
use taosim_exchange::order::{Currency, Direction, SettleFlag, StpFlag, TimeInForce};
use taosim_exchange::record::{EventPayload, TradeCause};

fn params(max_leverage: f64, maintenance: f64) -> ExchangeParams {
    ExchangeParams {
        price_decimals: 4,
        volume_decimals: 4,
        max_leverage: Decimal::from_f64(max_leverage),
        maintenance_margin: Decimal::from_f64(maintenance),
        max_open_orders: 100,
    }
}

fn zero_fee_exchange(max_leverage: f64, maintenance: f64) -> MultiBookExchange {
    MultiBookExchange::new(
        vec![BookConfig { price_decimals: 4, volume_decimals: 4, params: params(max_leverage, maintenance) }],
        vec![FeeTier { volume_required: Decimal::ZERO, maker_rate: Decimal::ZERO, taker_rate: Decimal::ZERO }],
        86_400,
    )
}

fn limit(direction: Direction, volume: f64, price: f64, leverage: f64, stp_flag: StpFlag, settle_flag: SettleFlag, post_only: bool, time_in_force: TimeInForce, currency: Currency) -> MessagePayload {
    MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
        book_id: BookId(0),
        direction,
        volume: Decimal::from_f64(volume),
        price: Decimal::from_f64(price),
        leverage: Decimal::from_f64(leverage),
        stp_flag,
        settle_flag,
        post_only,
        time_in_force,
        expiry_period: None,
        currency,
        client_order_id: None,
    })
}

fn gtc_limit(direction: Direction, volume: f64, price: f64) -> MessagePayload {
    limit(direction, volume, price, 0.0, StpFlag::None, SettleFlag::None, false, TimeInForce::Gtc, Currency::Base)
}

fn place_ok(ex: &mut MultiBookExchange, at: u64, source: &str, payload: MessagePayload) -> OrderId {
    let outs = ex.handle(Timestamp(at), source, &payload);
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!("expected an order-placed ack, got {:?}", outs[0].payload) };
    assert!(resp.error.is_valid(), "expected a valid placement, got {:?}", resp.error);
    resp.order_id
}

/// S1 — simple match: A buys 1@100, B sells 1@100; both fully filled at
/// that price with no residue.
#[test]
fn s1_simple_match() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10_000), Decimal::from_int(10_000))]);
    ex.register_agent("b", AgentId(-2), &[(Decimal::from_int(10_000), Decimal::from_int(10_000))]);

    place_ok(&mut ex, 0, "a", gtc_limit(Direction::Buy, 1.0, 100.0));
    let outs = ex.handle(Timestamp(1), "b", &gtc_limit(Direction::Sell, 1.0, 100.0));
    assert!(outs.iter().any(|o| matches!(o.payload, MessagePayload::OrderPlacedResponse(_))));

    let book = ex.order_book(BookId(0)).unwrap();
    assert!(book.best_bid().is_zero());
    assert!(book.best_ask().is_zero());

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert_eq!(a.base.free().to_f64(), 10_001.0);
    assert_eq!(a.quote.free().to_f64(), 9_900.0);

    let b = ex.accounts().get(AgentId(-2)).unwrap().balances(BookId(0)).unwrap();
    assert_eq!(b.base.free().to_f64(), 9_999.0);
    assert_eq!(b.quote.free().to_f64(), 10_100.0);
}

/// S2 — partial fill leaves a residue resting at the same price, with the
/// unmatched remainder still reserved.
#[test]
fn s2_partial_fill_with_residue() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10_000), Decimal::from_int(10_000))]);
    ex.register_agent("b", AgentId(-2), &[(Decimal::from_int(10_000), Decimal::from_int(10_000))]);

    place_ok(&mut ex, 0, "a", gtc_limit(Direction::Buy, 5.0, 100.0));
    ex.handle(Timestamp(1), "b", &gtc_limit(Direction::Sell, 2.0, 100.0));

    let book = ex.order_book(BookId(0)).unwrap();
    assert_eq!(book.best_bid().to_f64(), 100.0);

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert_eq!(a.quote.reservation(OrderId::new(0)).unwrap().to_f64(), 300.0);
    assert_eq!(a.quote.free().to_f64(), 9_500.0);
}

/// S3 — price-time priority: the earlier-registered resting order at the
/// same price is matched first.
#[test]
fn s3_price_time_priority() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("b", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("c", AgentId(-3), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    let a_order = place_ok(&mut ex, 0, "a", gtc_limit(Direction::Buy, 1.0, 100.0));
    place_ok(&mut ex, 1, "b", gtc_limit(Direction::Buy, 1.0, 100.0));
    let outs = ex.handle(Timestamp(2), "c", &gtc_limit(Direction::Sell, 1.0, 100.0));

    let trade = outs.iter().find_map(|o| match &o.payload {
        MessagePayload::TradeResponse(t) => Some(t),
        _ => None,
    });
    assert!(trade.is_none(), "fills are only broadcast to trade subscribers, not returned directly to the aggressor");

    // `a`'s order rested first, so it is the one consumed; `b`'s order
    // (still at the same price) must remain on the book afterward.
    let book = ex.order_book(BookId(0)).unwrap();
    assert!(book.best_bid().to_f64() == 100.0);
    assert!(book.get_order(a_order).is_none(), "a's order should be fully matched and removed");
}

/// S4 — a post-only order that would cross the book is rejected outright,
/// leaving the book untouched.
#[test]
fn s4_post_only_rejected() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("taker", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    place_ok(&mut ex, 0, "maker", gtc_limit(Direction::Sell, 1.0, 101.0));

    let outs = ex.handle(
        Timestamp(1),
        "taker",
        &limit(Direction::Buy, 1.0, 101.0, 0.0, StpFlag::None, SettleFlag::None, true, TimeInForce::Gtc, Currency::Base),
    );
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!("expected an ack") };
    assert!(!resp.error.is_valid());

    let book = ex.order_book(BookId(0)).unwrap();
    assert_eq!(book.best_ask().to_f64(), 101.0);
    assert!(book.best_bid().is_zero());
}

/// S5 — an IOC order matches what it can and cancels the unfilled
/// remainder immediately, reclaiming that reservation.
#[test]
fn s5_ioc_leaves_no_residue() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("taker", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    place_ok(&mut ex, 0, "maker", gtc_limit(Direction::Sell, 1.0, 101.0));
    let taker_order = place_ok(
        &mut ex,
        1,
        "taker",
        limit(Direction::Buy, 2.0, 101.0, 0.0, StpFlag::None, SettleFlag::None, false, TimeInForce::Ioc, Currency::Base),
    );

    let book = ex.order_book(BookId(0)).unwrap();
    assert!(book.best_ask().is_zero());
    assert!(book.best_bid().is_zero(), "the unfilled second unit must not rest");

    let taker = ex.accounts().get(AgentId(-2)).unwrap().balances(BookId(0)).unwrap();
    assert!(taker.quote.reservation(taker_order).is_none(), "the unmatched reservation must be reclaimed");
}

/// S6 — a leveraged position is closed by the engine's own margin-call
/// sweep once the book's touch crosses the fixed margin-call price.
#[test]
fn s6_margin_buy_liquidation() {
    let mut ex = zero_fee_exchange(5.0, 0.2);
    ex.register_agent("a", AgentId(-1), &[(Decimal::ZERO, Decimal::from_int(200))]);
    ex.register_agent("b", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("liquidity", AgentId(-3), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    let a_order = place_ok(&mut ex, 0, "a", limit(Direction::Buy, 2.0, 100.0, 1.0, StpFlag::None, SettleFlag::None, false, TimeInForce::Gtc, Currency::Base));
    ex.handle(Timestamp(1), "b", &gtc_limit(Direction::Sell, 2.0, 100.0));

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert_eq!(a.base.free().to_f64(), 2.0);
    assert!(a.quote_loan().to_f64() > 0.0);
    assert!(a.loan(a_order).is_some());

    // Drop the book's touch to 60, below the 70 margin-call price
    // (`100 * (1 - 1/(1+1) + 0.2)`), by resting a new low bid.
    place_ok(&mut ex, 2, "liquidity", gtc_limit(Direction::Buy, 1.0, 60.0));
    assert_eq!(ex.order_book(BookId(0)).unwrap().best_bid().to_f64(), 60.0);

    ex.evaluate_margin_calls(Timestamp(3));

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert!(a.loan(a_order).is_none(), "the margin-called loan must be fully closed");
    assert_eq!(a.quote_loan().to_f64(), 0.0);

    let record = ex.l3_record(BookId(0)).unwrap();
    let margin_call_trade = record
        .events()
        .iter()
        .find_map(|event| match &event.payload {
            EventPayload::Trade(trade) if matches!(trade.cause, TradeCause::MarginCall { .. }) => Some(trade),
            _ => None,
        })
        .expect("the event log must show a margin-call trade with an _MC cause");
    assert!(matches!(margin_call_trade.cause, TradeCause::MarginCall { priority } if priority == 0), "the first margin call dispatched must carry priority 0");
}

/// S7 — self-trade prevention CancelOld: an incoming order that would
/// cross the same agent's own resting order cancels the resting one and
/// rests instead.
#[test]
fn s7_stp_cancel_old_cancels_resting_self_order() {
    let mut ex = zero_fee_exchange(0.0, 0.0);
    ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    let resting = place_ok(&mut ex, 0, "a", gtc_limit(Direction::Buy, 1.0, 100.0));
    let incoming = place_ok(
        &mut ex,
        1,
        "a",
        limit(Direction::Sell, 1.0, 100.0, 0.0, StpFlag::CancelOld, SettleFlag::None, false, TimeInForce::Gtc, Currency::Base),
    );

    let book = ex.order_book(BookId(0)).unwrap();
    assert!(book.get_order(resting).is_none(), "the resting buy must be cancelled by STP");
    assert!(book.get_order(incoming).is_some(), "the new sell must rest untouched");
    assert_eq!(book.best_ask().to_f64(), 100.0);
    assert!(book.best_bid().is_zero());
}
