// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Concurrency tests using parking_lot's built-in deadlock detector.
//!
//! These tests hammer the engine from many threads and verify that the
//! locking patterns never deadlock, never oversell, and apply one-shot
//! transitions exactly once.
//!
//! Row locks are parking_lot mutexes, so the `deadlock_detection` feature
//! enabled for tests watches the real lock graph.

use flash_reserve_rs::{
    Engine, EngineConfig, ErrorKind, OrderStatus, PaymentEvent, PaymentStatus, ReconcileOutcome,
    ReservationError, RetryPolicy,
};
use parking_lot::deadlock;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// === Deadlock Detection Infrastructure ===

struct DeadlockDetector {
    running: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// Starts a background thread that checks for deadlocks.
fn start_deadlock_detector() -> DeadlockDetector {
    let running = Arc::new(AtomicBool::new(true));
    let found = Arc::new(AtomicBool::new(false));
    let (running_clone, found_clone) = (running.clone(), found.clone());

    let thread = thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                found_clone.store(true, Ordering::SeqCst);
            }
        }
    });

    DeadlockDetector {
        running,
        found,
        thread,
    }
}

/// Stops the detector and fails the test if it saw a deadlock.
fn stop_deadlock_detector(detector: DeadlockDetector) {
    detector.running.store(false, Ordering::SeqCst);
    detector.thread.join().expect("Detector thread panicked");
    assert!(
        !detector.found.load(Ordering::SeqCst),
        "Deadlock detected! See output above for details."
    );
}

fn config() -> EngineConfig {
    let fast = Duration::from_millis(1);
    EngineConfig::default()
        .with_reserve_retry(RetryPolicy::contention().with_base_delay(fast))
        .with_webhook_retry(RetryPolicy::out_of_order().with_base_delay(fast))
}

/// Runs `f` on `threads` threads released together.
fn race<T, F>(threads: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(threads));
    let f = Arc::new(f);
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let barrier = barrier.clone();
            let f = f.clone();
            thread::spawn(move || {
                barrier.wait();
                f(i)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|handle| handle.join().expect("Thread panicked"))
        .collect()
}

// === Tests ===

/// Ten buyers, one unit: one hold, nine refusals.
#[test]
fn last_unit_goes_to_exactly_one_buyer() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::with_config(config()));
    let product = engine.add_product("Last Pair", dec!(199.99), 1);

    let results = {
        let engine = engine.clone();
        race(10, move |_| engine.reserve(product.id, 1))
    };

    stop_deadlock_detector(detector);

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(ReservationError::InsufficientStock { .. })))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(refused, 9);
    assert_eq!(engine.available_stock(product.id).unwrap(), 0);
}

/// More buyers than units never oversells.
#[test]
fn no_overselling_under_contention() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::with_config(config()));
    let product = engine.add_product("Hoodie", dec!(49.50), 25);

    const BUYERS: usize = 64;
    let results = {
        let engine = engine.clone();
        race(BUYERS, move |i| engine.reserve(product.id, (i % 3 + 1) as u32))
    };

    stop_deadlock_detector(detector);

    let reserved: u32 = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|hold| hold.quantity)
        .sum();
    assert!(reserved <= 25, "Reserved {} of 25 units", reserved);
    for result in &results {
        if let Err(err) = result {
            assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        }
    }
    assert_eq!(
        engine.available_stock(product.id).unwrap(),
        25 - u64::from(reserved)
    );
}

/// Concurrent conversions of one hold create one order.
#[test]
fn exactly_one_conversion_per_hold() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::with_config(config()));
    let product = engine.add_product("Cap", dec!(15), 10);
    let hold = engine.reserve(product.id, 2).unwrap();

    let results = {
        let engine = engine.clone();
        race(20, move |_| engine.convert(hold.id))
    };

    stop_deadlock_detector(detector);

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| *err == ReservationError::HoldAlreadyUsed(hold.id))
    );
    assert_eq!(engine.available_stock(product.id).unwrap(), 8);
}

/// Concurrent deliveries of one payment take stock out once.
#[test]
fn concurrent_duplicate_webhooks_apply_once() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::with_config(config()));
    let product = engine.add_product("Cap", dec!(15), 10);
    let hold = engine.reserve(product.id, 3).unwrap();
    let order = engine.convert(hold.id).unwrap();

    let results = {
        let engine = engine.clone();
        race(20, move |_| {
            engine.reconcile(PaymentEvent::new("pay-1", order.id, PaymentStatus::Success))
        })
    };

    stop_deadlock_detector(detector);

    let fresh = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Ok(ReconcileOutcome::Processed(reconciliation)) if !reconciliation.already_processed
            )
        })
        .count();
    assert_eq!(fresh, 1);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(engine.order(order.id).unwrap().status, OrderStatus::Paid);
    assert_eq!(engine.product(product.id).unwrap().stock, 7);
    assert_eq!(engine.available_stock(product.id).unwrap(), 7);
}

/// Every operation at once across a few products, with the sweeper running.
#[test]
fn no_deadlock_mixed_operations() {
    let detector = start_deadlock_detector();
    let engine = Arc::new(Engine::with_config(
        config()
            .with_hold_ttl(chrono::TimeDelta::milliseconds(20))
            .with_sweep_interval(Duration::from_millis(5)),
    ));
    let products: Vec<_> = (0..3)
        .map(|i| engine.add_product(format!("Item {}", i), dec!(5), 200))
        .collect();
    let sweeper = engine.spawn_sweeper().unwrap();
    let paid_units = Arc::new(AtomicUsize::new(0));

    const THREADS: usize = 16;
    const ROUNDS: usize = 40;
    {
        let engine = engine.clone();
        let products = products.clone();
        let paid_units = paid_units.clone();
        race(THREADS, move |t| {
            for round in 0..ROUNDS {
                let product = &products[(t + round) % products.len()];
                let Ok(hold) = engine.reserve(product.id, 1) else {
                    continue;
                };
                if round % 4 == 0 {
                    // Left to lapse and be swept.
                    continue;
                }
                let Ok(order) = engine.convert(hold.id) else {
                    continue;
                };
                let status = if round % 3 == 0 {
                    PaymentStatus::Failure
                } else {
                    PaymentStatus::Success
                };
                let key = format!("pay-{}-{}", t, round);
                for _ in 0..2 {
                    let event = PaymentEvent::new(key.clone(), order.id, status);
                    if let Ok(ReconcileOutcome::Processed(r)) = engine.reconcile(event) {
                        if !r.already_processed && r.order_status == OrderStatus::Paid {
                            paid_units.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }
        });
    }

    sweeper.stop();
    stop_deadlock_detector(detector);

    let total_stock: u64 = products
        .iter()
        .map(|p| engine.product(p.id).unwrap().stock)
        .sum();
    assert_eq!(
        total_stock,
        600 - paid_units.load(Ordering::SeqCst) as u64,
        "Stock should drop by exactly the paid units"
    );
    for snapshot in engine.snapshots() {
        assert!(snapshot.available_stock <= snapshot.stock);
    }
}
