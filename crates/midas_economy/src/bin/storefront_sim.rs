//! # Storefront Load Simulation
//!
//! THE HOUSE UNDER FIRE:
//!
//! Deposit → Purchase → Slots → Arcade → Settle, from many buyer threads
//! at once, all against one journal-backed house.
//!
//! The run fails if any invariant breaks:
//! - tokens are conserved (deposits - charges + credits == balances)
//! - stock never oversells
//! - the raffle never overfills
//! - every vault item traces back to a paid order or a drawn prize
//! - the ledger reconciles

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use midas_economy::{
    Catalog, EngineError, GameType, HouseConfig, MemoryVault, SessionEvent, SettlementOutcome,
    TheHouse,
};

const BUYERS: u64 = 8;
const ROUNDS_PER_BUYER: u64 = 150;
const BANKROLL: u64 = 50_000;
const CONSOLATION_TOKENS: u64 = 8;

const SIM_CATALOG: &str = r#"
    [[sku]]
    id = 1
    name = "Neon Booster"
    price_tokens = 100
    total_units = 400

    [[sku.prize]]
    tier = "S"
    item = 101
    weight = 80.0

    [[sku.prize]]
    tier = "SS"
    item = 102
    weight = 15.0

    [[sku.prize]]
    tier = "SSS"
    item = 103
    weight = 5.0

    [[sku]]
    id = 2
    name = "Foil Box"
    price_tokens = 250
    total_units = 300
    guaranteed_all = true

    [[sku.prize]]
    tier = "A"
    item = 201
    weight = 1.0

    [[sku.prize]]
    tier = "SSS"
    item = 202
    weight = 1.0

    [[raffle]]
    id = 1
    name = "Crown Jewel Raffle"
    total_slots = 120
    tokens_per_slot = 40
    consolation_tokens = 8

    [[raffle.prize]]
    position = 1
    item = 901
    tier = "SSS"

    [[raffle.prize]]
    position = 2
    item = 902
    tier = "SS"

    [[raffle.prize]]
    position = 3
    item = 903
    tier = "SS"
"#;

/// Counters shared across buyer threads.
#[derive(Default)]
struct SimTallies {
    deposited: AtomicU64,
    charged: AtomicU64,
    rewarded: AtomicU64,
    sku1_units: AtomicU64,
    sku2_units: AtomicU64,
    slots_bought: AtomicU64,
    purchases_ok: AtomicU64,
    stock_exhausted: AtomicU64,
    slot_orders_ok: AtomicU64,
    board_full: AtomicU64,
    sessions_played: AtomicU64,
    unexpected: AtomicU64,
    op_count: AtomicU64,
    op_micros: AtomicU64,
}

/// One buyer's session against the house.
fn run_buyer(house: &TheHouse, tallies: &SimTallies, user: u64) {
    house
        .deposit_tokens(user, BANKROLL, user)
        .expect("deposit failed");
    tallies.deposited.fetch_add(BANKROLL, Ordering::Relaxed);

    for round in 0..ROUNDS_PER_BUYER {
        let order = user * 100_000 + round;
        let op_start = Instant::now();
        let mut acted = true;

        if round % 3 == 0 {
            // Chase the booster stock until it runs dry.
            let quantity = 1 + ((round / 3) % 3) as u32;
            match house.purchase(user, 1, quantity, order) {
                Ok(receipt) => {
                    tallies.charged.fetch_add(receipt.cost, Ordering::Relaxed);
                    tallies
                        .sku1_units
                        .fetch_add(u64::from(receipt.quantity), Ordering::Relaxed);
                    tallies.purchases_ok.fetch_add(1, Ordering::Relaxed);
                }
                Err(EngineError::StockExhausted { .. }) => {
                    tallies.stock_exhausted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    eprintln!("buyer {user} round {round}: {e}");
                    tallies.unexpected.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if round % 5 == 0 {
            match house.purchase(user, 2, 1, order) {
                Ok(receipt) => {
                    tallies.charged.fetch_add(receipt.cost, Ordering::Relaxed);
                    tallies
                        .sku2_units
                        .fetch_add(u64::from(receipt.quantity), Ordering::Relaxed);
                    tallies.purchases_ok.fetch_add(1, Ordering::Relaxed);
                }
                Err(EngineError::StockExhausted { .. }) => {
                    tallies.stock_exhausted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    eprintln!("buyer {user} round {round}: {e}");
                    tallies.unexpected.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if round % 4 == 1 {
            let count = 1 + ((round / 4) % 2) as u32;
            match house.buy_slots(user, 1, count, order) {
                Ok(receipt) => {
                    tallies.charged.fetch_add(receipt.cost, Ordering::Relaxed);
                    tallies
                        .slots_bought
                        .fetch_add(u64::from(receipt.count), Ordering::Relaxed);
                    tallies.slot_orders_ok.fetch_add(1, Ordering::Relaxed);
                }
                Err(
                    EngineError::RaffleNotOpen { .. }
                    | EngineError::SlotsExhausted { .. }
                    // A contended board that exhausted its retries is an
                    // expected outcome under load, not a failure.
                    | EngineError::Busy(_),
                ) => {
                    tallies.board_full.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    eprintln!("buyer {user} round {round}: {e}");
                    tallies.unexpected.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if round % 25 == 2 {
            // A quick icon hunt: three icons is an A-tier run.
            let session = house.start_session(user, GameType::IconHunt);
            for _ in 0..3 {
                house
                    .record_event(session, SessionEvent::IconFound)
                    .expect("event rejected");
            }
            let outcome = house.submit_session(session).expect("submit failed");
            tallies.rewarded.fetch_add(outcome.tokens, Ordering::Relaxed);
            tallies.sessions_played.fetch_add(1, Ordering::Relaxed);
        } else {
            acted = false;
        }

        if acted {
            tallies.op_count.fetch_add(1, Ordering::Relaxed);
            tallies
                .op_micros
                .fetch_add(op_start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
    }
}

#[allow(clippy::too_many_lines)]
fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           STOREFRONT LOAD SIMULATION                             ║");
    println!("║           {BUYERS} buyers × {ROUNDS_PER_BUYER} rounds, one house                        ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let path = std::env::temp_dir().join(format!(
        "storefront_sim_{}.journal",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));

    let catalog = Catalog::from_toml_str(SIM_CATALOG).expect("catalog rejected");
    let house = Arc::new(
        TheHouse::open(
            catalog,
            HouseConfig::new(&path),
            Arc::new(MemoryVault::new()),
        )
        .expect("failed to open the house"),
    );
    let tallies = Arc::new(SimTallies::default());

    println!("Running {} buyer threads...", BUYERS);
    let run_start = Instant::now();

    let handles: Vec<_> = (1..=BUYERS)
        .map(|user| {
            let house = Arc::clone(&house);
            let tallies = Arc::clone(&tallies);
            std::thread::spawn(move || run_buyer(&house, &tallies, user))
        })
        .collect();
    for handle in handles {
        handle.join().expect("buyer thread panicked");
    }

    let run_duration = run_start.elapsed();

    // Settle the raffle. A full board closed itself; a short board gets
    // closed by hand first.
    let snapshot = house.raffle_snapshot(1).expect("raffle missing");
    if snapshot.remaining > 0 {
        house.close_raffle(1).expect("close failed");
    }
    let settlement = house.settle_raffle(1).expect("settle failed");
    let settlement_credits = match settlement.outcome {
        SettlementOutcome::Drawn => u64::from(settlement.consolations) * CONSOLATION_TOKENS,
        SettlementOutcome::Cancelled => settlement.refunded_total,
    };

    // Gather the books.
    let deposited = tallies.deposited.load(Ordering::Relaxed);
    let charged = tallies.charged.load(Ordering::Relaxed);
    let rewarded = tallies.rewarded.load(Ordering::Relaxed);
    let sku1_units = tallies.sku1_units.load(Ordering::Relaxed);
    let sku2_units = tallies.sku2_units.load(Ordering::Relaxed);
    let slots_bought = tallies.slots_bought.load(Ordering::Relaxed);
    let op_count = tallies.op_count.load(Ordering::Relaxed);
    let op_micros = tallies.op_micros.load(Ordering::Relaxed);
    let unexpected = tallies.unexpected.load(Ordering::Relaxed);

    let balances: u64 = (1..=BUYERS).map(|user| house.balance_of(user)).sum();
    let items_held: u64 = (1..=BUYERS)
        .map(|user| house.holdings(user).len() as u64)
        .sum();
    let expected_balances = deposited - charged + settlement_credits + rewarded;
    let expected_items = sku1_units + 2 * sku2_units + settlement.winners.len() as u64;

    let sku1_sold = 400 - u64::from(house.remaining_units(1).unwrap_or(0));
    let raffle_filled = u64::from(settlement.filled);
    let broken_accounts = house.reconcile_all();
    let stats = house.stats().expect("stats unavailable");
    let events = house.drain_events();

    let conservation_ok = balances == expected_balances;
    let stock_ok = sku1_sold == sku1_units;
    let raffle_ok = raffle_filled == slots_bought && raffle_filled <= 120;
    let vault_ok = items_held == expected_items;
    let ledger_ok = broken_accounts.is_empty();
    let errors_ok = unexpected == 0;
    let all_ok = conservation_ok && stock_ok && raffle_ok && vault_ok && ledger_ok && errors_ok;

    println!();
    println!("┌─ THROUGHPUT ────────────────────────────────────────────────────┐");
    println!("│ Wall time:          {:.2}s", run_duration.as_secs_f64());
    println!(
        "│ Operations/sec:     {:.0}",
        op_count as f64 / run_duration.as_secs_f64()
    );
    println!(
        "│ Avg op latency:     {:.3} ms",
        op_micros as f64 / op_count as f64 / 1000.0
    );
    println!("│ Journal commits:    {}", stats.journal.commits);
    println!("│ Journal bytes:      {}", stats.journal_bytes);
    println!("│ Draws resolved:     {}", stats.total_draws);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ OUTCOME MIX ───────────────────────────────────────────────────┐");
    println!(
        "│ Pack orders:        {} ok, {} stock-exhausted",
        tallies.purchases_ok.load(Ordering::Relaxed),
        tallies.stock_exhausted.load(Ordering::Relaxed)
    );
    println!(
        "│ Slot orders:        {} ok, {} board-full",
        tallies.slot_orders_ok.load(Ordering::Relaxed),
        tallies.board_full.load(Ordering::Relaxed)
    );
    println!(
        "│ Arcade sessions:    {}",
        tallies.sessions_played.load(Ordering::Relaxed)
    );
    println!(
        "│ Raffle settled:     {:?}, {} winners, {} consolations",
        settlement.outcome,
        settlement.winners.len(),
        settlement.consolations
    );
    println!("│ Events emitted:     {}", events.len());
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ INVARIANTS ────────────────────────────────────────────────────┐");
    println!(
        "│ {} Token conservation: {} == {}",
        mark(conservation_ok),
        balances,
        expected_balances
    );
    println!(
        "│ {} Stock honest:       {} sold == {} granted",
        mark(stock_ok),
        sku1_sold,
        sku1_units
    );
    println!(
        "│ {} Raffle honest:      {} filled == {} bought (cap 120)",
        mark(raffle_ok),
        raffle_filled,
        slots_bought
    );
    println!(
        "│ {} Vault honest:       {} held == {} expected",
        mark(vault_ok),
        items_held,
        expected_items
    );
    println!(
        "│ {} Ledger reconciles:  {} broken accounts",
        mark(ledger_ok),
        broken_accounts.len()
    );
    println!(
        "│ {} No unexpected errors: {}",
        mark(errors_ok),
        unexpected
    );
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    drop(house);
    std::fs::remove_file(&path).ok();

    if all_ok {
        println!("✅ STOREFRONT SIMULATION PASSED");
        std::process::exit(0);
    } else {
        println!("❌ STOREFRONT SIMULATION FAILED");
        std::process::exit(1);
    }
}

const fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}
