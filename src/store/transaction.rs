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

//! Transactions: row locks, staged writes, unique claims and rollback.

use super::table::RowGuard;
use super::{
    ORDERS_HOLD_ID, RowRef, Store, StoreError, WEBHOOKS_IDEMPOTENCY_KEY, next_id, reserved_units,
};
use crate::base::{HoldId, OrderId, ProductId, WebhookId};
use crate::model::{
    Hold, HoldStatus, Order, OrderStatus, PaymentStatus, Product, WebhookRecord,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Fields of a hold to insert. New holds are always active.
#[derive(Debug, Clone)]
pub struct NewHold {
    pub product_id: ProductId,
    pub quantity: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Fields of an order to insert. New orders are always pending.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub hold_id: HoldId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub total_price: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Fields of a payment webhook record to insert.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub status: PaymentStatus,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Staged<R> {
    row: R,
    inserted: bool,
}

/// A unique key claimed by this transaction, released on rollback.
#[derive(Debug)]
enum Claim {
    OrderHold(HoldId, OrderId),
    WebhookKey(String, WebhookId),
}

/// An open transaction against a [`Store`].
///
/// Row locks are held until [`commit`](Transaction::commit) or until the
/// transaction is dropped, which rolls it back.
pub struct Transaction<'s> {
    store: &'s Store,
    guards: Vec<RowGuard>,
    locked: HashSet<RowRef>,
    products: HashMap<ProductId, Product>,
    holds: HashMap<HoldId, Staged<Hold>>,
    orders: HashMap<OrderId, Staged<Order>>,
    webhooks: Vec<WebhookRecord>,
    claims: Vec<Claim>,
    touched: BTreeSet<ProductId>,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub(super) fn new(store: &'s Store) -> Self {
        Self {
            store,
            guards: Vec::new(),
            locked: HashSet::new(),
            products: HashMap::new(),
            holds: HashMap::new(),
            orders: HashMap::new(),
            webhooks: Vec::new(),
            claims: Vec::new(),
            touched: BTreeSet::new(),
            finished: false,
        }
    }

    /// Locks a product row and returns its current version.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] if another transaction keeps the row
    /// locked past the store's lock timeout.
    pub fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>, StoreError> {
        let row = RowRef::Product(id);
        if self.locked.contains(&row) {
            return Ok(self.view_product(id));
        }
        self.check_lock_order(row)?;
        let locked = self
            .store
            .products
            .lock(&id, row, self.store.lock_timeout)?;
        Ok(locked.map(|(guard, product)| {
            self.retain(row, guard);
            product
        }))
    }

    /// Locks a hold row and returns its current version.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] on lock wait timeout, and
    /// [`StoreError::Deadlock`] if a product row is already locked.
    pub fn lock_hold(&mut self, id: HoldId) -> Result<Option<Hold>, StoreError> {
        let row = RowRef::Hold(id);
        if self.locked.contains(&row) || self.holds.get(&id).is_some_and(|s| s.inserted) {
            return Ok(self.view_hold(id));
        }
        self.check_lock_order(row)?;
        let locked = self.store.holds.lock(&id, row, self.store.lock_timeout)?;
        Ok(locked.map(|(guard, hold)| {
            self.retain(row, guard);
            hold
        }))
    }

    /// Locks an order row and returns its current version.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] on lock wait timeout, and
    /// [`StoreError::Deadlock`] if a product row is already locked.
    pub fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = RowRef::Order(id);
        if self.locked.contains(&row) || self.orders.get(&id).is_some_and(|s| s.inserted) {
            return Ok(self.view_order(id));
        }
        self.check_lock_order(row)?;
        let locked = self.store.orders.lock(&id, row, self.store.lock_timeout)?;
        Ok(locked.map(|(guard, order)| {
            self.retain(row, guard);
            order
        }))
    }

    pub fn update_product(&mut self, product: Product) -> Result<(), StoreError> {
        let row = RowRef::Product(product.id);
        if !self.locked.contains(&row) {
            return Err(StoreError::NotLocked(row));
        }
        self.products.insert(product.id, product);
        Ok(())
    }

    pub fn update_hold(&mut self, hold: Hold) -> Result<(), StoreError> {
        let row = RowRef::Hold(hold.id);
        match self.holds.get_mut(&hold.id) {
            Some(staged) if staged.inserted => staged.row = hold,
            _ if self.locked.contains(&row) => {
                self.holds.insert(hold.id, Staged {
                    row: hold,
                    inserted: false,
                });
            }
            _ => return Err(StoreError::NotLocked(row)),
        }
        Ok(())
    }

    pub fn update_order(&mut self, order: Order) -> Result<(), StoreError> {
        let row = RowRef::Order(order.id);
        match self.orders.get_mut(&order.id) {
            Some(staged) if staged.inserted => staged.row = order,
            _ if self.locked.contains(&row) => {
                self.orders.insert(order.id, Staged {
                    row: order,
                    inserted: false,
                });
            }
            _ => return Err(StoreError::NotLocked(row)),
        }
        Ok(())
    }

    /// Stages a new active hold.
    pub fn insert_hold(&mut self, new: NewHold) -> Hold {
        let hold = Hold {
            id: HoldId(next_id(&self.store.sequences.holds)),
            product_id: new.product_id,
            quantity: new.quantity,
            status: HoldStatus::Active,
            expires_at: new.expires_at,
            created_at: new.created_at,
        };
        self.holds.insert(hold.id, Staged {
            row: hold.clone(),
            inserted: true,
        });
        hold
    }

    /// Stages a new pending order and claims its hold id.
    ///
    /// # Errors
    ///
    /// [`StoreError::UniqueViolation`] if another order, committed or not,
    /// already references the hold.
    pub fn insert_order(&mut self, new: NewOrder) -> Result<Order, StoreError> {
        let id = OrderId(next_id(&self.store.sequences.orders));
        match self.store.order_by_hold.entry(new.hold_id) {
            Entry::Occupied(_) => return Err(StoreError::UniqueViolation(ORDERS_HOLD_ID)),
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }
        self.claims.push(Claim::OrderHold(new.hold_id, id));

        let order = Order {
            id,
            hold_id: new.hold_id,
            product_id: new.product_id,
            quantity: new.quantity,
            total_price: new.total_price,
            status: OrderStatus::Pending,
            created_at: new.created_at,
        };
        self.orders.insert(id, Staged {
            row: order.clone(),
            inserted: true,
        });
        Ok(order)
    }

    /// Stages a webhook record and claims its idempotency key.
    ///
    /// # Errors
    ///
    /// [`StoreError::UniqueViolation`] if the key is already claimed.
    pub fn insert_webhook(&mut self, new: NewWebhook) -> Result<WebhookRecord, StoreError> {
        let id = WebhookId(next_id(&self.store.sequences.webhooks));
        match self.store.webhook_by_key.entry(new.idempotency_key.clone()) {
            Entry::Occupied(_) => {
                return Err(StoreError::UniqueViolation(WEBHOOKS_IDEMPOTENCY_KEY));
            }
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
        }
        self.claims
            .push(Claim::WebhookKey(new.idempotency_key.clone(), id));

        let record = WebhookRecord {
            id,
            idempotency_key: new.idempotency_key,
            order_id: new.order_id,
            status: new.status,
            payload: new.payload,
            processed_at: new.processed_at,
        };
        self.webhooks.push(record.clone());
        Ok(record)
    }

    /// Quantity of a product held back by valid holds and pending orders, as
    /// seen by this transaction (committed rows overlaid with staged ones).
    ///
    /// Only authoritative while the product row is locked.
    pub fn reserved_quantity(&self, product_id: ProductId, now: DateTime<Utc>) -> u64 {
        let committed_holds = self
            .store
            .hold_ids_for(product_id)
            .into_iter()
            .filter_map(|id| self.view_hold(id));
        let staged_holds = self
            .holds
            .values()
            .filter(|staged| staged.inserted && staged.row.product_id == product_id)
            .map(|staged| staged.row.clone());

        let committed_orders = self
            .store
            .order_ids_for(product_id)
            .into_iter()
            .filter_map(|id| self.view_order(id));
        let staged_orders = self
            .orders
            .values()
            .filter(|staged| staged.inserted && staged.row.product_id == product_id)
            .map(|staged| staged.row.clone());

        reserved_units(
            committed_holds.chain(staged_holds),
            committed_orders.chain(staged_orders),
            now,
        )
    }

    /// Records that this transaction changes the available stock of a product.
    pub fn touch(&mut self, product_id: ProductId) {
        self.touched.insert(product_id);
    }

    /// Publishes every staged write, then releases the row locks.
    ///
    /// Returns the products whose available stock changed.
    pub fn commit(mut self) -> Vec<ProductId> {
        let store = self.store;
        for (id, product) in self.products.drain() {
            store.products.publish(id, product);
        }
        for (id, staged) in self.holds.drain() {
            let product_id = staged.row.product_id;
            store.holds.publish(id, staged.row);
            if staged.inserted {
                store.holds_by_product.entry(product_id).or_default().push(id);
            }
        }
        for (id, staged) in self.orders.drain() {
            let product_id = staged.row.product_id;
            store.orders.publish(id, staged.row);
            if staged.inserted {
                store
                    .orders_by_product
                    .entry(product_id)
                    .or_default()
                    .push(id);
            }
        }
        for record in self.webhooks.drain(..) {
            store.webhooks.publish(record.id, record);
        }
        self.claims.clear();
        self.guards.clear();
        self.finished = true;
        std::mem::take(&mut self.touched).into_iter().collect()
    }

    /// Discards every staged write and releases locks and unique claims.
    pub fn rollback(self) {}

    fn retain(&mut self, row: RowRef, guard: RowGuard) {
        self.locked.insert(row);
        self.guards.push(guard);
    }

    fn check_lock_order(&self, requested: RowRef) -> Result<(), StoreError> {
        match self
            .locked
            .iter()
            .find(|held| held.rank() > requested.rank())
        {
            Some(held) => Err(StoreError::Deadlock {
                held: *held,
                requested,
            }),
            None => Ok(()),
        }
    }

    fn view_product(&self, id: ProductId) -> Option<Product> {
        self.products
            .get(&id)
            .cloned()
            .or_else(|| self.store.products.get(&id))
    }

    fn view_hold(&self, id: HoldId) -> Option<Hold> {
        self.holds
            .get(&id)
            .map(|staged| staged.row.clone())
            .or_else(|| self.store.holds.get(&id))
    }

    fn view_order(&self, id: OrderId) -> Option<Order> {
        self.orders
            .get(&id)
            .map(|staged| staged.row.clone())
            .or_else(|| self.store.orders.get(&id))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for claim in self.claims.drain(..) {
            match claim {
                Claim::OrderHold(hold_id, order_id) => {
                    self.store
                        .order_by_hold
                        .remove_if(&hold_id, |_, claimed| *claimed == order_id);
                }
                Claim::WebhookKey(key, webhook_id) => {
                    self.store
                        .webhook_by_key
                        .remove_if(&key, |_, claimed| *claimed == webhook_id);
                }
            }
        }
        if !self.locked.is_empty() || !self.holds.is_empty() || !self.orders.is_empty() {
            tracing::debug!(
                locks = self.locked.len(),
                staged_holds = self.holds.len(),
                staged_orders = self.orders.len(),
                "transaction rolled back"
            );
        }
    }
}
