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

//! Conversion of holds into orders.

use crate::base::HoldId;
use crate::clock::Clock;
use crate::error::ReservationError;
use crate::hold::HoldManager;
use crate::ledger::StockLedger;
use crate::model::{HoldStatus, Order};
use crate::store::{NewOrder, Store, StoreError};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Turns a valid hold into a pending order, at most once per hold.
pub struct OrderManager {
    store: Arc<Store>,
    holds: Arc<HoldManager>,
    ledger: Arc<StockLedger>,
    clock: Arc<dyn Clock>,
}

impl OrderManager {
    pub fn new(
        store: Arc<Store>,
        holds: Arc<HoldManager>,
        ledger: Arc<StockLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            holds,
            ledger,
            clock,
        }
    }

    /// Creates a pending order from a hold and consumes the hold, atomically.
    ///
    /// On any error the transaction rolls back and the hold stays as it was.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::HoldNotFound`] if the hold does not exist.
    /// - [`ReservationError::HoldAlreadyUsed`] if the hold was already converted.
    /// - [`ReservationError::HoldInvalidOrExpired`] if the hold expired.
    /// - [`ReservationError::Retryable`] on lock contention.
    pub fn create_from_hold(&self, hold_id: HoldId) -> Result<Order, ReservationError> {
        let mut tx = self.store.begin();
        let hold = tx
            .lock_hold(hold_id)?
            .ok_or(ReservationError::HoldNotFound(hold_id))?;

        if hold.status == HoldStatus::Consumed || self.store.order_for_hold(hold_id).is_some() {
            return Err(ReservationError::HoldAlreadyUsed(hold_id));
        }
        if !self.holds.is_valid(&hold) {
            return Err(ReservationError::HoldInvalidOrExpired(hold_id));
        }

        let product = tx
            .lock_product(hold.product_id)?
            .ok_or(ReservationError::ProductNotFound(hold.product_id))?;
        let total_price = product.price * Decimal::from(hold.quantity);

        let order = tx
            .insert_order(NewOrder {
                hold_id,
                product_id: hold.product_id,
                quantity: hold.quantity,
                total_price,
                created_at: self.clock.now(),
            })
            .map_err(|err| match err {
                StoreError::UniqueViolation(_) => ReservationError::HoldAlreadyUsed(hold_id),
                other => other.into(),
            })?;

        if !self.holds.consume_within(&mut tx, hold_id)? {
            return Err(ReservationError::HoldInvalidOrExpired(hold_id));
        }
        tx.touch(hold.product_id);
        self.ledger.invalidate_all(tx.commit());

        tracing::info!(
            order = %order.id,
            hold = %hold_id,
            product = %order.product_id,
            total_price = %order.total_price,
            "order created"
        );
        Ok(order)
    }
}
