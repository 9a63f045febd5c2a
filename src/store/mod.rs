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

//! Transactional in-memory storage with row-level exclusive locks.
//!
//! The [`Store`] holds the product, hold, order and payment webhook tables.
//! Every stock-affecting operation runs inside a [`Transaction`], which:
//!
//! - locks each row it acts on before reading it, and keeps the lock until it
//!   commits or rolls back,
//! - stages all writes and publishes them only on [`Transaction::commit`],
//! - claims the `orders.hold_id` and `payment_webhooks.idempotency_key` unique
//!   keys at insert time, so a racing duplicate insert fails immediately,
//! - rolls everything back when dropped without committing.
//!
//! Reads outside a transaction see the last committed version of each row and
//! never wait for row locks.
//!
//! # Lock Order
//!
//! Hold and order rows rank below product rows: a transaction that holds a
//! product lock may not request a hold or order lock. Such a request is
//! refused with [`StoreError::Deadlock`] instead of risking a wait cycle.

mod table;
mod transaction;

pub use transaction::{NewHold, NewOrder, NewWebhook, Transaction};

use crate::base::{HoldId, OrderId, ProductId, WebhookId};
use crate::model::{Hold, Order, Product, WebhookRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use table::Table;
use thiserror::Error;

/// Identifies one lockable row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowRef {
    Product(ProductId),
    Hold(HoldId),
    Order(OrderId),
}

impl RowRef {
    fn rank(self) -> u8 {
        match self {
            Self::Hold(_) | Self::Order(_) => 0,
            Self::Product(_) => 1,
        }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product(id) => write!(f, "product {id}"),
            Self::Hold(id) => write!(f, "hold {id}"),
            Self::Order(id) => write!(f, "order {id}"),
        }
    }
}

/// Storage-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("timed out waiting for the lock on {0}")]
    LockTimeout(RowRef),

    #[error("locking {requested} while holding {held} inverts the lock order")]
    Deadlock { held: RowRef, requested: RowRef },

    /// Insert conflicts with a committed or in-flight row on a unique key
    #[error("unique constraint {0} violated")]
    UniqueViolation(&'static str),

    #[error("{0} must be locked before it is written")]
    NotLocked(RowRef),
}

pub(crate) const ORDERS_HOLD_ID: &str = "orders.hold_id";
pub(crate) const WEBHOOKS_IDEMPOTENCY_KEY: &str = "payment_webhooks.idempotency_key";

#[derive(Debug, Default)]
struct Sequences {
    products: AtomicU64,
    holds: AtomicU64,
    orders: AtomicU64,
    webhooks: AtomicU64,
}

fn next_id(sequence: &AtomicU64) -> u64 {
    sequence.fetch_add(1, Ordering::Relaxed) + 1
}

/// Shared transactional store.
#[derive(Debug)]
pub struct Store {
    products: Table<ProductId, Product>,
    holds: Table<HoldId, Hold>,
    orders: Table<OrderId, Order>,
    webhooks: Table<WebhookId, WebhookRecord>,
    holds_by_product: DashMap<ProductId, Vec<HoldId>>,
    orders_by_product: DashMap<ProductId, Vec<OrderId>>,
    /// Unique index on `orders.hold_id`; may point at an uncommitted order.
    order_by_hold: DashMap<HoldId, OrderId>,
    /// Unique index on `payment_webhooks.idempotency_key`; may point at an
    /// uncommitted record.
    webhook_by_key: DashMap<String, WebhookId>,
    sequences: Sequences,
    lock_timeout: Duration,
}

impl Store {
    /// Creates an empty store whose lock waits give up after `lock_timeout`.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            products: Table::new(),
            holds: Table::new(),
            orders: Table::new(),
            webhooks: Table::new(),
            holds_by_product: DashMap::new(),
            orders_by_product: DashMap::new(),
            order_by_hold: DashMap::new(),
            webhook_by_key: DashMap::new(),
            sequences: Sequences::default(),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Opens a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Inserts and commits a product.
    pub fn insert_product(&self, name: impl Into<String>, price: Decimal, stock: u64) -> Product {
        let product = Product {
            id: ProductId(next_id(&self.sequences.products)),
            name: name.into(),
            stock,
            price,
        };
        self.products.publish(product.id, product.clone());
        product
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        self.products.get(&id)
    }

    /// All committed products, ordered by id.
    pub fn products(&self) -> Vec<Product> {
        let mut products = self.products.filter(|_| true);
        products.sort_by_key(|product| product.id);
        products
    }

    pub fn hold(&self, id: HoldId) -> Option<Hold> {
        self.holds.get(&id)
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.orders.get(&id)
    }

    pub fn webhook(&self, id: WebhookId) -> Option<WebhookRecord> {
        self.webhooks.get(&id)
    }

    /// Returns the committed webhook record for an idempotency key.
    pub fn webhook_by_key(&self, key: &str) -> Option<WebhookRecord> {
        let id = self.webhook_by_key.get(key).map(|entry| *entry.value())?;
        self.webhooks.get(&id)
    }

    /// Returns the committed order created from a hold.
    pub fn order_for_hold(&self, hold_id: HoldId) -> Option<Order> {
        let id = self.order_by_hold.get(&hold_id).map(|entry| *entry.value())?;
        self.orders.get(&id)
    }

    /// Committed holds that are still active but whose window has lapsed,
    /// ordered by id.
    pub fn due_holds(&self, now: DateTime<Utc>) -> Vec<Hold> {
        let mut holds = self.holds.filter(|hold| hold.is_due(now));
        holds.sort_by_key(|hold| hold.id);
        holds
    }

    /// Quantity of a product held back by valid holds and pending orders, as
    /// of the last commit.
    pub fn reserved_quantity(&self, product_id: ProductId, now: DateTime<Utc>) -> u64 {
        let holds = self
            .hold_ids_for(product_id)
            .into_iter()
            .filter_map(|id| self.holds.get(&id));
        let orders = self
            .order_ids_for(product_id)
            .into_iter()
            .filter_map(|id| self.orders.get(&id));
        reserved_units(holds, orders, now)
    }

    pub fn hold_count(&self) -> usize {
        self.holds.len()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn webhook_count(&self) -> usize {
        self.webhooks.len()
    }

    fn hold_ids_for(&self, product_id: ProductId) -> Vec<HoldId> {
        self.holds_by_product
            .get(&product_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    fn order_ids_for(&self, product_id: ProductId) -> Vec<OrderId> {
        self.orders_by_product
            .get(&product_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }
}

/// Sums the quantities still held back from sale.
fn reserved_units(
    holds: impl Iterator<Item = Hold>,
    orders: impl Iterator<Item = Order>,
    now: DateTime<Utc>,
) -> u64 {
    let held: u64 = holds
        .filter(|hold| hold.is_valid(now))
        .map(|hold| u64::from(hold.quantity))
        .sum();
    let pending: u64 = orders
        .filter(Order::reserves_stock)
        .map(|order| u64::from(order.quantity))
        .sum();
    held + pending
}
