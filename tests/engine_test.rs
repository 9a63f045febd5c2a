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

//! Engine public API integration tests.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use flash_reserve_rs::{
    Contention, Engine, EngineConfig, ErrorKind, HoldId, HoldStatus, ManualClock, OrderId,
    OrderStatus, PaymentEvent, PaymentStatus, ProductId, ReconcileOutcome, ReservationError,
    RetryPolicy, SweepOutcome, SweepReport,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 28, 21, 0, 0).unwrap()
}

fn fast_config() -> EngineConfig {
    let fast = Duration::from_millis(1);
    EngineConfig::default()
        .with_lock_timeout(Duration::from_millis(200))
        .with_reserve_retry(RetryPolicy::contention().with_base_delay(fast))
        .with_webhook_retry(RetryPolicy::out_of_order().with_base_delay(fast))
}

fn engine() -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start()));
    (Engine::with_clock(fast_config(), clock.clone()), clock)
}

fn processed(outcome: ReconcileOutcome) -> flash_reserve_rs::Reconciliation {
    match outcome {
        ReconcileOutcome::Processed(reconciliation) => reconciliation,
        ReconcileOutcome::Deferred => panic!("expected the webhook to be processed"),
    }
}

#[test]
fn reserve_reduces_available_stock() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(199.99), 10);

    let hold = engine.reserve(product.id, 3).unwrap();

    assert_eq!(hold.status, HoldStatus::Active);
    assert_eq!(hold.expires_at, start() + TimeDelta::minutes(2));
    assert_eq!(engine.available_stock(product.id).unwrap(), 7);
    assert_eq!(engine.product(product.id).unwrap().stock, 10);
}

#[test]
fn reserve_validates_quantity() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(199.99), 100);

    let err = engine.reserve(product.id, 11).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine.reserve(product.id, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(engine.reserve(product.id, 10).is_ok());
}

#[test]
fn reserve_exact_remaining_then_one_more() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(199.99), 5);

    engine.reserve(product.id, 5).unwrap();

    assert_eq!(
        engine.reserve(product.id, 1),
        Err(ReservationError::InsufficientStock {
            requested: 1,
            available: 0
        })
    );
}

#[test]
fn reserve_unknown_product() {
    let (engine, _clock) = engine();
    let err = engine.reserve(ProductId(404), 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(engine.available_stock(ProductId(404)).is_err());
    assert!(engine.snapshot(ProductId(404)).is_err());
}

#[test]
fn full_purchase_flow() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(199.99), 10);

    let hold = engine.reserve(product.id, 2).unwrap();
    let order = engine.convert(hold.id).unwrap();
    assert_eq!(order.total_price, dec!(399.98));
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(engine.available_stock(product.id).unwrap(), 8);

    let outcome = processed(
        engine
            .reconcile(PaymentEvent::new("pay-1", order.id, PaymentStatus::Success))
            .unwrap(),
    );

    assert_eq!(outcome.order_status, OrderStatus::Paid);
    assert_eq!(engine.order(order.id).unwrap().status, OrderStatus::Paid);
    assert_eq!(engine.hold(hold.id).unwrap().status, HoldStatus::Consumed);
    let webhook = engine.webhook(outcome.webhook_id).unwrap();
    assert_eq!(webhook.idempotency_key, "pay-1");
    assert_eq!(webhook.order_id, order.id);

    let snapshot = engine.snapshot(product.id).unwrap();
    assert_eq!(snapshot.stock, 8);
    assert_eq!(snapshot.available_stock, 8);
}

#[test]
fn failed_payment_releases_units() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(199.99), 4);
    let hold = engine.reserve(product.id, 4).unwrap();
    let order = engine.convert(hold.id).unwrap();
    assert_eq!(engine.available_stock(product.id).unwrap(), 0);

    let outcome = processed(
        engine
            .reconcile(PaymentEvent::new("pay-1", order.id, PaymentStatus::Failure))
            .unwrap(),
    );

    assert_eq!(outcome.order_status, OrderStatus::Cancelled);
    assert_eq!(engine.product(product.id).unwrap().stock, 4);
    assert_eq!(engine.available_stock(product.id).unwrap(), 4);
    assert!(engine.reserve(product.id, 4).is_ok());
}

#[test]
fn duplicate_success_webhook_decrements_once() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 100);
    let hold = engine.reserve(product.id, 3).unwrap();
    let order = engine.convert(hold.id).unwrap();
    let event = PaymentEvent::new("dup-key", order.id, PaymentStatus::Success);

    let first = processed(engine.reconcile(event.clone()).unwrap());
    let second = processed(engine.reconcile(event).unwrap());

    assert!(!first.already_processed);
    assert!(second.already_processed);
    assert_eq!(second.webhook_id, first.webhook_id);
    assert_eq!(second.order_status, OrderStatus::Paid);
    assert_eq!(engine.product(product.id).unwrap().stock, 97);
}

#[test]
fn conversion_is_single_use() {
    let (engine, _clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 10);
    let hold = engine.reserve(product.id, 1).unwrap();

    engine.convert(hold.id).unwrap();

    assert_eq!(
        engine.convert(hold.id),
        Err(ReservationError::HoldAlreadyUsed(hold.id))
    );
    assert_eq!(
        engine.convert(HoldId(999)),
        Err(ReservationError::HoldNotFound(HoldId(999)))
    );
}

#[test]
fn expired_hold_cannot_be_converted() {
    let (engine, clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 10);
    let hold = engine.reserve(product.id, 1).unwrap();

    clock.advance(TimeDelta::minutes(2) + TimeDelta::seconds(1));

    let err = engine.convert(hold.id).unwrap_err();
    assert_eq!(err, ReservationError::HoldInvalidOrExpired(hold.id));
    assert_eq!(err.kind(), ErrorKind::InvalidOrExpired);
    assert!(engine.order(OrderId(1)).is_none());
}

#[test]
fn sweep_releases_expired_hold() {
    let (engine, clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 10);
    let hold = engine.reserve(product.id, 5).unwrap();
    assert_eq!(engine.available_stock(product.id).unwrap(), 5);

    clock.advance(TimeDelta::minutes(3));

    assert_eq!(
        engine.sweep(),
        SweepOutcome::Completed(SweepReport {
            expired: 1,
            failed: 0
        })
    );
    assert_eq!(engine.hold(hold.id).unwrap().status, HoldStatus::Expired);
    assert_eq!(engine.available_stock(product.id).unwrap(), 10);

    // A second sweep finds nothing to do.
    assert_eq!(
        engine.sweep(),
        SweepOutcome::Completed(SweepReport::default())
    );
}

#[test]
fn sweep_never_touches_future_or_consumed_holds() {
    let (engine, clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 10);
    let converted = engine.reserve(product.id, 2).unwrap();
    engine.convert(converted.id).unwrap();
    clock.advance(TimeDelta::minutes(1));
    let future = engine.reserve(product.id, 2).unwrap();
    clock.advance(TimeDelta::minutes(1) + TimeDelta::seconds(30));

    engine.sweep();

    assert_eq!(
        engine.hold(converted.id).unwrap().status,
        HoldStatus::Consumed
    );
    assert_eq!(engine.hold(future.id).unwrap().status, HoldStatus::Active);
    assert_eq!(engine.available_stock(product.id).unwrap(), 6);
}

#[test]
fn lapsed_hold_stops_reserving_before_the_sweep() {
    let (engine, clock) = engine();
    let product = engine.add_product("Sneakers", dec!(10), 1);
    engine.reserve(product.id, 1).unwrap();

    clock.advance(TimeDelta::minutes(2));

    assert!(engine.reserve(product.id, 1).is_ok());
}

#[test]
fn early_webhook_is_deferred_then_applied() {
    let (engine, _clock) = engine();
    let event = PaymentEvent::new("early", OrderId(1), PaymentStatus::Success);

    assert_eq!(engine.reconcile(event.clone()).unwrap(), ReconcileOutcome::Deferred);
    assert_eq!(engine.deferred_len(), 1);

    // Redelivery of a deferred key does not queue it twice.
    assert_eq!(engine.reconcile(event).unwrap(), ReconcileOutcome::Deferred);
    assert_eq!(engine.deferred_len(), 1);

    let report = engine.retry_deferred();
    assert_eq!(report.requeued, 1);
    assert_eq!(engine.deferred_len(), 1);

    let product = engine.add_product("Sneakers", dec!(10), 10);
    let hold = engine.reserve(product.id, 2).unwrap();
    let order = engine.convert(hold.id).unwrap();
    assert_eq!(order.id, OrderId(1));

    let report = engine.retry_deferred();
    assert_eq!(report.applied, 1);
    assert_eq!(engine.deferred_len(), 0);
    assert_eq!(engine.order(order.id).unwrap().status, OrderStatus::Paid);
    assert_eq!(engine.product(product.id).unwrap().stock, 8);
}

#[test]
fn webhook_key_is_validated() {
    let (engine, _clock) = engine();
    let err = engine
        .reconcile(PaymentEvent::new("", OrderId(1), PaymentStatus::Success))
        .unwrap_err();
    assert_eq!(err, ReservationError::InvalidIdempotencyKey);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.deferred_len(), 0);
}

#[test]
fn snapshots_list_every_product_in_order() {
    let (engine, _clock) = engine();
    engine.add_product("A", dec!(1), 1);
    engine.add_product("B", dec!(2), 2);
    engine.add_product("C", dec!(3), 3);

    let names: Vec<_> = engine
        .snapshots()
        .into_iter()
        .map(|snapshot| snapshot.name)
        .collect();

    assert_eq!(names, ["A", "B", "C"]);
}

#[test]
fn retryable_errors_are_classified() {
    let err = ReservationError::Retryable(Contention::LockTimeout);
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::Retryable);
    assert!(ReservationError::OrderNotYetCreated(OrderId(1)).is_retryable());
    assert!(!ReservationError::HoldAlreadyUsed(HoldId(1)).is_retryable());
}

#[test]
fn default_config_matches_sale_rules() {
    let config = EngineConfig::default();
    assert_eq!(config.hold_ttl, TimeDelta::minutes(2));
    assert_eq!(config.max_hold_quantity, 10);
    assert_eq!(config.cache_ttl, TimeDelta::seconds(5));
    assert_eq!(config.reserve_retry.max_attempts, 3);
    assert_eq!(config.webhook_retry.max_attempts, 5);
}
