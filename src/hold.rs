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

//! Hold lifecycle: create, expire, consume.

use crate::base::{HoldId, ProductId};
use crate::clock::Clock;
use crate::error::ReservationError;
use crate::ledger::StockLedger;
use crate::model::{Hold, HoldStatus};
use crate::store::{NewHold, Store, Transaction};
use chrono::TimeDelta;
use std::sync::Arc;

/// Creates and transitions holds.
///
/// # Invariants
///
/// - A hold is only created while the product row is locked and the
///   recomputed available stock covers its quantity.
/// - Transitions only leave `Active`: `Active -> Expired` or
///   `Active -> Consumed`. Terminal holds never change again.
pub struct HoldManager {
    store: Arc<Store>,
    ledger: Arc<StockLedger>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
    max_quantity: u32,
}

impl HoldManager {
    pub fn new(
        store: Arc<Store>,
        ledger: Arc<StockLedger>,
        clock: Arc<dyn Clock>,
        ttl: TimeDelta,
        max_quantity: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            ttl,
            max_quantity,
        }
    }

    /// Reserves `quantity` units of a product for the hold TTL.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidQuantity`] if `quantity` is outside `1..=max`.
    /// - [`ReservationError::ProductNotFound`] if the product does not exist.
    /// - [`ReservationError::InsufficientStock`] if available stock is short.
    /// - [`ReservationError::Retryable`] on lock contention. Nothing is written.
    pub fn create_hold(&self, product_id: ProductId, quantity: u32) -> Result<Hold, ReservationError> {
        if quantity == 0 || quantity > self.max_quantity {
            return Err(ReservationError::InvalidQuantity {
                quantity,
                max: self.max_quantity,
            });
        }

        let mut tx = self.store.begin();
        let product = tx
            .lock_product(product_id)?
            .ok_or(ReservationError::ProductNotFound(product_id))?;

        let now = self.clock.now();
        let available = self.ledger.available_within(&tx, &product, now);
        if available < u64::from(quantity) {
            tracing::debug!(
                product = %product_id,
                requested = quantity,
                available,
                "hold refused"
            );
            return Err(ReservationError::InsufficientStock {
                requested: quantity,
                available,
            });
        }

        let hold = tx.insert_hold(NewHold {
            product_id,
            quantity,
            created_at: now,
            expires_at: now + self.ttl,
        });
        tx.touch(product_id);
        self.ledger.invalidate_all(tx.commit());

        tracing::info!(
            hold = %hold.id,
            product = %product_id,
            quantity,
            expires_at = %hold.expires_at,
            "hold created"
        );
        Ok(hold)
    }

    /// Expires an active hold in its own transaction.
    ///
    /// Returns `false` if the hold was already expired or consumed.
    ///
    /// # Errors
    ///
    /// [`ReservationError::HoldNotFound`] if the hold does not exist, or
    /// [`ReservationError::Retryable`] on lock contention.
    pub fn expire(&self, hold_id: HoldId) -> Result<bool, ReservationError> {
        let mut tx = self.store.begin();
        let expired = self.expire_within(&mut tx, hold_id)?;
        self.ledger.invalidate_all(tx.commit());
        Ok(expired)
    }

    /// Expires an active hold inside a caller-owned transaction.
    ///
    /// # Errors
    ///
    /// See [`expire`](Self::expire).
    pub fn expire_within(&self, tx: &mut Transaction<'_>, hold_id: HoldId) -> Result<bool, ReservationError> {
        let mut hold = tx
            .lock_hold(hold_id)?
            .ok_or(ReservationError::HoldNotFound(hold_id))?;
        if hold.status != HoldStatus::Active {
            return Ok(false);
        }

        hold.status = HoldStatus::Expired;
        let product_id = hold.product_id;
        tx.update_hold(hold)?;
        tx.touch(product_id);

        tracing::info!(hold = %hold_id, product = %product_id, "hold expired");
        Ok(true)
    }

    /// Marks a valid hold consumed inside a caller-owned transaction.
    ///
    /// Returns `false` if the hold is no longer active or its window lapsed.
    ///
    /// # Errors
    ///
    /// [`ReservationError::HoldNotFound`] if the hold does not exist, or
    /// [`ReservationError::Retryable`] on lock contention.
    pub fn consume_within(&self, tx: &mut Transaction<'_>, hold_id: HoldId) -> Result<bool, ReservationError> {
        let mut hold = tx
            .lock_hold(hold_id)?
            .ok_or(ReservationError::HoldNotFound(hold_id))?;
        if !self.is_valid(&hold) {
            return Ok(false);
        }

        hold.status = HoldStatus::Consumed;
        let product_id = hold.product_id;
        tx.update_hold(hold)?;
        tx.touch(product_id);
        Ok(true)
    }

    /// `true` if the hold is active and has not expired yet.
    pub fn is_valid(&self, hold: &Hold) -> bool {
        hold.is_valid(self.clock.now())
    }
}
