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

//! Property-based tests for the reservation engine.
//!
//! These tests verify invariants that should hold for any sequence of
//! reservations, conversions, payments, clock moves and sweeps.

use chrono::{TimeDelta, TimeZone, Utc};
use flash_reserve_rs::{
    Clock, Engine, EngineConfig, ErrorKind, Hold, HoldStatus, ManualClock, Order, OrderStatus,
    PaymentEvent, PaymentStatus, Product, ReconcileOutcome, RetryPolicy,
};
use proptest::prelude::*;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Reserve { product: usize, quantity: u32 },
    Convert { hold: usize },
    Pay { order: usize, key: u8, success: bool },
    Advance { seconds: i64 },
    Sweep,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3, 0u32..=12).prop_map(|(product, quantity)| Op::Reserve { product, quantity }),
        3 => (0usize..64).prop_map(|hold| Op::Convert { hold }),
        3 => (0usize..64, 0u8..8, any::<bool>())
            .prop_map(|(order, key, success)| Op::Pay { order, key, success }),
        2 => (0i64..=90).prop_map(|seconds| Op::Advance { seconds }),
        1 => Just(Op::Sweep),
    ]
}

fn arb_stock() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..=30, 3)
}

// =============================================================================
// Harness
// =============================================================================

struct Sale {
    engine: Engine,
    clock: Arc<ManualClock>,
    products: Vec<Product>,
    holds: Vec<Hold>,
    orders: Vec<Order>,
}

impl Sale {
    fn new(stock: &[u64]) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        // No read cache, so every read is exact.
        let config = EngineConfig::default()
            .with_cache_ttl(TimeDelta::zero())
            .with_webhook_retry(RetryPolicy::once());
        let engine = Engine::with_clock(config, clock.clone());
        let products = stock
            .iter()
            .enumerate()
            .map(|(i, &units)| engine.add_product(format!("Item {}", i), dec!(9.99), units))
            .collect();
        Sale {
            engine,
            clock,
            products,
            holds: Vec::new(),
            orders: Vec::new(),
        }
    }

    fn apply(&mut self, op: &Op) {
        match *op {
            Op::Reserve { product, quantity } => {
                let product = &self.products[product];
                match self.engine.reserve(product.id, quantity) {
                    Ok(hold) => self.holds.push(hold),
                    Err(err) => assert!(matches!(
                        err.kind(),
                        ErrorKind::Validation | ErrorKind::InsufficientStock
                    )),
                }
            }
            Op::Convert { hold } => {
                let Some(hold) = self.holds.get(hold % self.holds.len().max(1)) else {
                    return;
                };
                match self.engine.convert(hold.id) {
                    Ok(order) => self.orders.push(order),
                    Err(err) => assert!(matches!(
                        err.kind(),
                        ErrorKind::AlreadyUsed | ErrorKind::InvalidOrExpired
                    )),
                }
            }
            Op::Pay {
                order,
                key,
                success,
            } => {
                let Some(order) = self.orders.get(order % self.orders.len().max(1)) else {
                    return;
                };
                let status = if success {
                    PaymentStatus::Success
                } else {
                    PaymentStatus::Failure
                };
                let event = PaymentEvent::new(format!("key-{}", key), order.id, status);
                let outcome = self.engine.reconcile(event).unwrap();
                assert!(matches!(outcome, ReconcileOutcome::Processed(_)));
            }
            Op::Advance { seconds } => self.clock.advance(TimeDelta::seconds(seconds)),
            Op::Sweep => {
                self.engine.sweep();
            }
        }
    }
}

// =============================================================================
// Invariant Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Units held back by valid holds and pending orders never exceed
    /// stock, and available stock is exactly what is left.
    #[test]
    fn reserved_never_exceeds_stock(
        stock in arb_stock(),
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let mut sale = Sale::new(&stock);

        for op in &ops {
            sale.apply(op);

            let now = sale.clock.now();
            for product in &sale.products {
                let current = sale.engine.product(product.id).unwrap();
                let held: u64 = sale.holds.iter()
                    .filter_map(|h| sale.engine.hold(h.id))
                    .filter(|h| h.product_id == product.id && h.is_valid(now))
                    .map(|h| u64::from(h.quantity))
                    .sum();
                let pending: u64 = sale.orders.iter()
                    .filter_map(|o| sale.engine.order(o.id))
                    .filter(|o| o.product_id == product.id && o.status == OrderStatus::Pending)
                    .map(|o| u64::from(o.quantity))
                    .sum();

                prop_assert!(held + pending <= current.stock);
                prop_assert_eq!(
                    sale.engine.available_stock(product.id).unwrap(),
                    current.stock - held - pending
                );
            }
        }
    }

    /// Physical stock drops by exactly the quantity of paid orders, however
    /// often payments are redelivered.
    #[test]
    fn stock_drops_by_paid_quantity(
        stock in arb_stock(),
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let mut sale = Sale::new(&stock);
        for op in &ops {
            sale.apply(op);
        }

        for (product, initial) in sale.products.iter().zip(&stock) {
            let paid: u64 = sale.orders.iter()
                .filter_map(|o| sale.engine.order(o.id))
                .filter(|o| o.product_id == product.id && o.status == OrderStatus::Paid)
                .map(|o| u64::from(o.quantity))
                .sum();
            prop_assert_eq!(sale.engine.product(product.id).unwrap().stock, initial - paid);
        }
    }

    /// Each hold yields at most one order, and only consumed holds have one.
    #[test]
    fn one_order_per_hold(
        stock in arb_stock(),
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let mut sale = Sale::new(&stock);
        for op in &ops {
            sale.apply(op);
        }

        let mut seen = HashSet::new();
        for order in &sale.orders {
            prop_assert!(seen.insert(order.hold_id));
            let hold = sale.engine.hold(order.hold_id).unwrap();
            prop_assert_eq!(hold.status, HoldStatus::Consumed);
        }
    }

    /// After a sweep, no active hold is past its expiry.
    #[test]
    fn sweep_leaves_no_due_holds(
        stock in arb_stock(),
        ops in prop::collection::vec(arb_op(), 1..60),
        lapse in 0i64..=300,
    ) {
        let mut sale = Sale::new(&stock);
        for op in &ops {
            sale.apply(op);
        }
        sale.clock.advance(TimeDelta::seconds(lapse));
        sale.engine.sweep();

        let now = sale.clock.now();
        for hold in &sale.holds {
            let hold = sale.engine.hold(hold.id).unwrap();
            prop_assert!(!hold.is_due(now));
        }
    }
}
