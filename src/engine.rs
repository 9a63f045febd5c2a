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

//! Reservation engine.
//!
//! The [`Engine`] is the central component that ties the stock ledger, holds,
//! orders and payment reconciliation together behind one thread-safe facade.
//!
//! # Operations
//!
//! - **Reserve**: Hold units of a product for a short window.
//! - **Convert**: Turn a valid hold into a pending order.
//! - **Reconcile**: Apply a payment webhook to its order exactly once.
//! - **Sweep**: Expire holds whose window lapsed, releasing their units.
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync` and meant to be shared through an [`Arc`].
//! Operations on the same product serialize on its row lock, operations on
//! different products run in parallel.

use crate::base::{HoldId, OrderId, ProductId, WebhookId};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, RetryPolicy};
use crate::deferred::DeferredWebhooks;
use crate::error::{ErrorKind, ReservationError};
use crate::hold::HoldManager;
use crate::ledger::{StockLedger, StockSnapshot};
use crate::model::{Hold, Order, Product, WebhookRecord};
use crate::order::OrderManager;
use crate::store::Store;
use crate::sweeper::{ExpirySweeper, SweepOutcome, SweeperHandle};
use crate::webhook::{PaymentEvent, Reconciliation, WebhookReconciler};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Result of [`Engine::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Processed(Reconciliation),
    /// The event could not be applied within the retry budget, because its
    /// order had not been created or its rows stayed locked. It was queued
    /// for [`Engine::retry_deferred`].
    Deferred,
}

/// Counts from one [`Engine::retry_deferred`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredReport {
    pub applied: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Flash-sale reservation engine.
///
/// # Invariants
///
/// - For every product, `stock - Σ valid holds - Σ pending orders >= 0`.
/// - A hold produces at most one order.
/// - A payment webhook is applied at most once per idempotency key, and a
///   paid order takes its quantity out of stock exactly once.
pub struct Engine {
    config: EngineConfig,
    store: Arc<Store>,
    ledger: Arc<StockLedger>,
    holds: Arc<HoldManager>,
    orders: OrderManager,
    reconciler: WebhookReconciler,
    sweeper: Arc<ExpirySweeper>,
    deferred: DeferredWebhooks,
}

impl Engine {
    /// Creates an empty engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an engine reading time from `clock`.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(Store::new(config.lock_timeout));
        let ledger = Arc::new(StockLedger::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.cache_ttl,
        ));
        let holds = Arc::new(HoldManager::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&clock),
            config.hold_ttl,
            config.max_hold_quantity,
        ));
        let orders = OrderManager::new(
            Arc::clone(&store),
            Arc::clone(&holds),
            Arc::clone(&ledger),
            Arc::clone(&clock),
        );
        let reconciler =
            WebhookReconciler::new(Arc::clone(&store), Arc::clone(&ledger), Arc::clone(&clock));
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&holds),
            Arc::clone(&ledger),
            clock,
        ));

        Engine {
            config,
            store,
            ledger,
            holds,
            orders,
            reconciler,
            sweeper,
            deferred: DeferredWebhooks::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Seeds a product.
    pub fn add_product(&self, name: impl Into<String>, price: Decimal, stock: u64) -> Product {
        let product = self.store.insert_product(name, price, stock);
        tracing::info!(product = %product.id, name = %product.name, stock, "product added");
        product
    }

    /// Reserves `quantity` units of a product, retrying on lock contention.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidQuantity`] if `quantity` is outside `1..=max`.
    /// - [`ReservationError::ProductNotFound`] if the product does not exist.
    /// - [`ReservationError::InsufficientStock`] if available stock is short.
    /// - [`ReservationError::Retryable`] if contention outlasted every attempt.
    pub fn reserve(&self, product_id: ProductId, quantity: u32) -> Result<Hold, ReservationError> {
        with_retry(&self.config.reserve_retry, "reserve", is_contention, || {
            self.holds.create_hold(product_id, quantity)
        })
    }

    /// Converts a hold into a pending order, retrying on lock contention.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::HoldNotFound`] if the hold does not exist.
    /// - [`ReservationError::HoldInvalidOrExpired`] if the hold lapsed.
    /// - [`ReservationError::HoldAlreadyUsed`] if the hold was converted before.
    /// - [`ReservationError::Retryable`] if contention outlasted every attempt.
    pub fn convert(&self, hold_id: HoldId) -> Result<Order, ReservationError> {
        with_retry(&self.config.reserve_retry, "convert", is_contention, || {
            self.orders.create_from_hold(hold_id)
        })
    }

    /// Applies a payment event, waiting for a late order or a busy row within
    /// the retry budget. An event still blocked after the last attempt is
    /// deferred.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidIdempotencyKey`] if the key is malformed.
    /// - [`ReservationError::Internal`] on a broken store invariant.
    pub fn reconcile(&self, event: PaymentEvent) -> Result<ReconcileOutcome, ReservationError> {
        let result = with_retry(
            &self.config.webhook_retry,
            "reconcile",
            ReservationError::is_retryable,
            || self.reconciler.process(&event),
        );

        match result {
            Ok(reconciliation) => Ok(ReconcileOutcome::Processed(reconciliation)),
            Err(err) if err.is_retryable() => {
                tracing::error!(
                    key = %event.idempotency_key,
                    order = %event.order_id,
                    error = %err,
                    "webhook still not applicable after retries, deferring"
                );
                self.deferred.push(event);
                Ok(ReconcileOutcome::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs one expiry sweep now.
    pub fn sweep(&self) -> SweepOutcome {
        self.sweeper.sweep()
    }

    /// Starts the background sweeper at the configured interval.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the sweeper thread cannot be spawned.
    pub fn spawn_sweeper(&self) -> std::io::Result<SweeperHandle> {
        Arc::clone(&self.sweeper).spawn(self.config.sweep_interval)
    }

    /// Gives every deferred payment event one more attempt.
    ///
    /// Events whose order still does not exist go back on the queue.
    pub fn retry_deferred(&self) -> DeferredReport {
        let mut report = DeferredReport::default();
        for event in self.deferred.drain() {
            match self.reconciler.process(&event) {
                Ok(_) => report.applied += 1,
                Err(err) if err.is_retryable() => {
                    self.deferred.push(event);
                    report.requeued += 1;
                }
                Err(err) => {
                    tracing::error!(
                        key = %event.idempotency_key,
                        error = %err,
                        "deferred webhook failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn product(&self, product_id: ProductId) -> Option<Product> {
        self.store.product(product_id)
    }

    pub fn hold(&self, hold_id: HoldId) -> Option<Hold> {
        self.store.hold(hold_id)
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.store.order(order_id)
    }

    pub fn webhook(&self, webhook_id: WebhookId) -> Option<WebhookRecord> {
        self.store.webhook(webhook_id)
    }

    /// Available stock, possibly a few seconds stale.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ProductNotFound`] if the product does not exist.
    pub fn available_stock(&self, product_id: ProductId) -> Result<u64, ReservationError> {
        self.ledger.available_stock(product_id)
    }

    /// # Errors
    ///
    /// [`ReservationError::ProductNotFound`] if the product does not exist.
    pub fn snapshot(&self, product_id: ProductId) -> Result<StockSnapshot, ReservationError> {
        self.ledger.snapshot(product_id)
    }

    /// Snapshots of every product, ordered by id.
    pub fn snapshots(&self) -> Vec<StockSnapshot> {
        self.store
            .products()
            .into_iter()
            .filter_map(|product| self.ledger.snapshot(product.id).ok())
            .collect()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_contention(err: &ReservationError) -> bool {
    err.kind() == ErrorKind::Retryable
}

/// Runs `op` until it succeeds, fails with an error `retry_on` rejects, or
/// the policy runs out of attempts. The last error is returned.
fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    retry_on: impl Fn(&ReservationError) -> bool,
    mut op: impl FnMut() -> Result<T, ReservationError>,
) -> Result<T, ReservationError> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if retry_on(&err) && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(operation, attempt, ?delay, error = %err, "retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}
