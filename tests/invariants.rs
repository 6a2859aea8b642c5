//! Property tests for the testable invariants: balance bookkeeping (P1,
//! P2), conservation (P3), event-id monotonicity (P4), determinism (P5),
//! price-time priority (P6), and order-type semantics (P7).

use proptest::prelude::*;
use taosim_exchange::balance::Balance;
use taosim_exchange::clearing::ExchangeParams;
use taosim_exchange::decimal::Decimal;
use taosim_exchange::exchange::{BookConfig, MultiBookExchange};
use taosim_exchange::fees::FeeTier;
use taosim_exchange::ids::{AgentId, BookId, OrderId, Timestamp};
use taosim_exchange::message::*;
use taosim_exchange::order::{Currency, Direction, SettleFlag, StpFlag, TimeInForce};
use taosim_exchange::record::{EventPayload, L3Record, OrderEvent};

fn params() -> ExchangeParams {
    ExchangeParams {
        price_decimals: 4,
        volume_decimals: 4,
        max_leverage: Decimal::ZERO,
        maintenance_margin: Decimal::ZERO,
        max_open_orders: 100,
    }
}

fn exchange_with_fees(taker_rate: f64, maker_rate: f64) -> MultiBookExchange {
    MultiBookExchange::new(
        vec![BookConfig { price_decimals: 4, volume_decimals: 4, params: params() }],
        vec![FeeTier { volume_required: Decimal::ZERO, maker_rate: Decimal::from_f64(maker_rate), taker_rate: Decimal::from_f64(taker_rate) }],
        86_400,
    )
}

fn gtc_limit(direction: Direction, volume: f64, price: f64) -> MessagePayload {
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

// P1: for any sequence of reservation operations, `free >= 0`, `reserved
// >= 0`, and `total == free + reserved` always hold.
proptest! {
    #[test]
    fn p1_balance_never_goes_negative_and_total_holds(
        initial in 0i64..1_000_000,
        ops in prop::collection::vec((0u64..3, 0i64..1_000_000), 0..50),
    ) {
        let mut balance = Balance::new(Decimal::from_int(initial));
        let id = OrderId::new(1);
        for (kind, amount) in ops {
            let amount = Decimal::from_int(amount);
            match kind {
                0 => { let _ = balance.make_reservation(id, amount); }
                1 => { let _ = balance.free_reservation(id, Some(amount)); }
                _ => { balance.void_reservation(id, amount); }
            }
            prop_assert!(!balance.free().is_negative());
            prop_assert!(!balance.reserved().is_negative());
            prop_assert_eq!(balance.total(), balance.free() + balance.reserved());
        }
    }
}

/// P2: while an order has open reserved volume its reservation sum is
/// positive; once it is cancelled in full, no reservation remains.
#[test]
fn p2_reservation_emptied_after_full_cancel() {
    let mut ex = exchange_with_fees(0.0, 0.0);
    ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

    let outs = ex.handle(Timestamp(0), "a", &gtc_limit(Direction::Buy, 1.0, 100.0));
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!() };
    let order_id = resp.order_id;

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert!(a.quote.reservation(order_id).unwrap().to_f64() > 0.0, "an open order must hold a positive reservation");

    let cancel = MessagePayload::CancelOrders(CancelOrdersPayload { book_id: BookId(0), orders: vec![(order_id, None)] });
    ex.handle(Timestamp(1), "a", &cancel);

    let a = ex.accounts().get(AgentId(-1)).unwrap().balances(BookId(0)).unwrap();
    assert!(a.quote.reservation(order_id).is_none(), "a fully cancelled order must hold no reservation");
}

/// P3: with zero fees, `base.total() + quote.total()/price` summed across
/// agents is unchanged by a trade; with a nonzero taker fee the same sum
/// strictly decreases by the fee collected.
#[test]
fn p3_conservation_holds_fee_free_and_decreases_with_fees() {
    fn total_value(ex: &MultiBookExchange, agents: &[AgentId], price: Decimal) -> Decimal {
        agents.iter().fold(Decimal::ZERO, |acc, &agent| {
            let balances = ex.accounts().get(agent).unwrap().balances(BookId(0)).unwrap();
            acc + balances.base.total() + balances.quote.total() / price
        })
    }

    let agents = [AgentId(-1), AgentId(-2)];
    let price = Decimal::from_int(100);

    let mut fee_free = exchange_with_fees(0.0, 0.0);
    fee_free.register_agent("a", agents[0], &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    fee_free.register_agent("b", agents[1], &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    let before = total_value(&fee_free, &agents, price);
    fee_free.handle(Timestamp(0), "a", &gtc_limit(Direction::Buy, 1.0, 100.0));
    fee_free.handle(Timestamp(1), "b", &gtc_limit(Direction::Sell, 1.0, 100.0));
    let after = total_value(&fee_free, &agents, price);
    assert_eq!(before, after, "fee-free trades must conserve total value");

    let mut with_fees = exchange_with_fees(0.01, 0.0);
    with_fees.register_agent("a", agents[0], &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    with_fees.register_agent("b", agents[1], &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    let before = total_value(&with_fees, &agents, price);
    with_fees.handle(Timestamp(0), "a", &gtc_limit(Direction::Buy, 1.0, 100.0));
    with_fees.handle(Timestamp(1), "b", &gtc_limit(Direction::Sell, 1.0, 100.0));
    let after = total_value(&with_fees, &agents, price);
    assert!(after < before, "a taker fee must strictly reduce the conserved total");
}

/// P4: event ids are strictly increasing within a record, and `clear`
/// empties the event buffer without rewinding the id counter.
#[test]
fn p4_event_ids_monotonic_and_survive_clear() {
    let mut record = L3Record::default();
    let mut ids = Vec::new();
    for i in 0..5 {
        let id = record.push(
            Timestamp(i),
            EventPayload::Order(OrderEvent {
                order_id: OrderId::new(i),
                agent_id: AgentId(-1),
                direction: Direction::Buy,
                volume: Decimal::ONE,
                price: Some(Decimal::from_int(100)),
            }),
        );
        ids.push(id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "event ids must strictly increase");
    assert_eq!(record.events().len(), 5);

    let next_id_before_clear = record.next_id();
    record.clear();
    assert!(record.events().is_empty(), "clear must empty the event buffer");
    assert_eq!(record.next_id(), next_id_before_clear, "clear must not rewind the id counter");

    let id = record.push(
        Timestamp(5),
        EventPayload::Order(OrderEvent { order_id: OrderId::new(5), agent_id: AgentId(-1), direction: Direction::Buy, volume: Decimal::ONE, price: Some(Decimal::from_int(100)) }),
    );
    assert!(id > *ids.last().unwrap(), "ids must keep increasing across a clear boundary");
}

/// P5: replaying the identical message trace against two independently
/// constructed exchanges yields byte-identical L3 records and balances.
#[test]
fn p5_identical_trace_is_deterministic() {
    fn run() -> (Vec<u8>, Vec<u8>) {
        let mut ex = exchange_with_fees(0.01, 0.005);
        ex.register_agent("a", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
        ex.register_agent("b", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
        ex.register_agent("c", AgentId(-3), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);

        ex.handle(Timestamp(0), "a", &gtc_limit(Direction::Buy, 2.0, 100.0));
        ex.handle(Timestamp(1), "b", &gtc_limit(Direction::Buy, 1.0, 99.0));
        ex.handle(Timestamp(2), "c", &gtc_limit(Direction::Sell, 3.0, 99.0));

        let record_bytes = serde_json::to_vec(ex.l3_record(BookId(0)).unwrap()).unwrap();
        let balances: Vec<_> = ex
            .accounts()
            .accounts()
            .iter()
            .map(|account| (account.agent_id, serde_json::to_value(account.balances(BookId(0)).unwrap()).unwrap()))
            .collect();
        let accounts_bytes = serde_json::to_vec(&balances).unwrap();
        (record_bytes, accounts_bytes)
    }

    let (record_a, balances_a) = run();
    let (record_b, balances_b) = run();
    assert_eq!(record_a, record_b, "identical traces must produce byte-identical L3 records");
    assert_eq!(balances_a, balances_b, "identical traces must produce byte-identical final balances");
}

/// P6: of two resting orders at the same price, the one registered first
/// is matched in full before any volume is taken from the second.
#[test]
fn p6_price_time_priority_holds_across_many_price_levels() {
    for level in [50.0, 100.0, 250.0, 999.5] {
        let mut ex = exchange_with_fees(0.0, 0.0);
        ex.register_agent("first", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(100_000))]);
        ex.register_agent("second", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(100_000))]);
        ex.register_agent("taker", AgentId(-3), &[(Decimal::from_int(10), Decimal::from_int(100_000))]);

        let outs = ex.handle(Timestamp(0), "first", &gtc_limit(Direction::Buy, 1.0, level));
        let MessagePayload::OrderPlacedResponse(first_resp) = &outs[0].payload else { panic!() };
        let first_id = first_resp.order_id;
        ex.handle(Timestamp(1), "second", &gtc_limit(Direction::Buy, 1.0, level));
        ex.handle(Timestamp(2), "taker", &gtc_limit(Direction::Sell, 1.0, level));

        let book = ex.order_book(BookId(0)).unwrap();
        assert!(book.get_order(first_id).is_none(), "the earlier order at price {level} must be consumed first");
        assert_eq!(book.best_bid().to_f64(), level, "the later order must remain resting at price {level}");
    }
}

/// P7a: a post-only order that would cross the book is rejected and the
/// book is left untouched.
#[test]
fn p7_post_only_never_crosses() {
    let mut ex = exchange_with_fees(0.0, 0.0);
    ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("taker", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.handle(Timestamp(0), "maker", &gtc_limit(Direction::Sell, 1.0, 101.0));

    let payload = MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
        book_id: BookId(0),
        direction: Direction::Buy,
        volume: Decimal::from_f64(1.0),
        price: Decimal::from_f64(101.0),
        leverage: Decimal::ZERO,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::None,
        post_only: true,
        time_in_force: TimeInForce::Gtc,
        expiry_period: None,
        currency: Currency::Base,
        client_order_id: None,
    });
    let outs = ex.handle(Timestamp(1), "taker", &payload);
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!() };
    assert!(!resp.error.is_valid());
    assert_eq!(ex.order_book(BookId(0)).unwrap().best_ask().to_f64(), 101.0);
    assert!(ex.order_book(BookId(0)).unwrap().best_bid().is_zero());
}

/// P7b: an IOC order never leaves residual resting volume, whether it
/// fully matches, partially matches, or matches nothing at all.
#[test]
fn p7_ioc_never_rests() {
    for ask_volume in [0.0, 0.5, 2.0] {
        let mut ex = exchange_with_fees(0.0, 0.0);
        ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
        ex.register_agent("taker", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
        if ask_volume > 0.0 {
            ex.handle(Timestamp(0), "maker", &gtc_limit(Direction::Sell, ask_volume, 101.0));
        }

        let payload = MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
            book_id: BookId(0),
            direction: Direction::Buy,
            volume: Decimal::from_f64(1.0),
            price: Decimal::from_f64(101.0),
            leverage: Decimal::ZERO,
            stp_flag: StpFlag::None,
            settle_flag: SettleFlag::None,
            post_only: false,
            time_in_force: TimeInForce::Ioc,
            expiry_period: None,
            currency: Currency::Base,
            client_order_id: None,
        });
        ex.handle(Timestamp(1), "taker", &payload);
        assert!(ex.order_book(BookId(0)).unwrap().best_bid().is_zero(), "IOC must never leave a resting bid (ask volume {ask_volume})");
    }
}

/// P7c: a fill-or-kill order either fully matches or leaves the book
/// completely unchanged.
#[test]
fn p7_fok_all_or_nothing() {
    let mut ex = exchange_with_fees(0.0, 0.0);
    ex.register_agent("maker", AgentId(-1), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.register_agent("taker", AgentId(-2), &[(Decimal::from_int(10), Decimal::from_int(10_000))]);
    ex.handle(Timestamp(0), "maker", &gtc_limit(Direction::Sell, 1.0, 101.0));

    // Insufficient resting volume: FOK must not touch the book at all.
    let unfillable = MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
        book_id: BookId(0),
        direction: Direction::Buy,
        volume: Decimal::from_f64(2.0),
        price: Decimal::from_f64(101.0),
        leverage: Decimal::ZERO,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::None,
        post_only: false,
        time_in_force: TimeInForce::Fok,
        expiry_period: None,
        currency: Currency::Base,
        client_order_id: None,
    });
    let outs = ex.handle(Timestamp(1), "taker", &unfillable);
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!() };
    assert!(!resp.error.is_valid(), "an unfillable FOK must be rejected");
    assert_eq!(ex.order_book(BookId(0)).unwrap().best_ask().to_f64(), 101.0, "the resting maker order must be untouched");
    assert!(ex.order_book(BookId(0)).unwrap().best_bid().is_zero());

    // Exactly fillable: FOK fully matches and leaves nothing resting.
    let fillable = MessagePayload::PlaceOrderLimit(PlaceOrderLimitPayload {
        book_id: BookId(0),
        direction: Direction::Buy,
        volume: Decimal::from_f64(1.0),
        price: Decimal::from_f64(101.0),
        leverage: Decimal::ZERO,
        stp_flag: StpFlag::None,
        settle_flag: SettleFlag::None,
        post_only: false,
        time_in_force: TimeInForce::Fok,
        expiry_period: None,
        currency: Currency::Base,
        client_order_id: None,
    });
    let outs = ex.handle(Timestamp(2), "taker", &fillable);
    let MessagePayload::OrderPlacedResponse(resp) = &outs[0].payload else { panic!() };
    assert!(resp.error.is_valid(), "a fully fillable FOK must be accepted");
    assert!(ex.order_book(BookId(0)).unwrap().best_ask().is_zero());
    assert!(ex.order_book(BookId(0)).unwrap().best_bid().is_zero());
}
