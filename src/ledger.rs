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

//! Stock accounting.
//!
//! Available stock is derived, never stored:
//!
//! ```text
//! available = stock − Σ quantity(valid holds) − Σ quantity(pending orders)
//! ```
//!
//! Paid orders are not subtracted because [`StockLedger::commit_sale`] has
//! already taken their quantity out of `stock`.
//!
//! The [`StockLedger`] serves the read path from a short-lived per-product
//! cache. Stock-changing transactions never read the cache: they lock the
//! product row and recompute with [`StockLedger::available_within`].

use crate::base::ProductId;
use crate::clock::Clock;
use crate::error::ReservationError;
use crate::model::Product;
use crate::store::{Store, Transaction};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct CachedStock {
    available: u64,
    cached_at: DateTime<Utc>,
    generation: u64,
}

/// Per-product cache of available stock.
///
/// Each product carries a generation that [`invalidate`](Self::invalidate)
/// bumps. A value is only stored if the generation it was computed under is
/// still current, so a computation racing an invalidation cannot repopulate
/// the cache with a stale figure.
#[derive(Debug)]
pub struct StockCache {
    ttl: TimeDelta,
    entries: DashMap<ProductId, CachedStock>,
    generations: DashMap<ProductId, u64>,
}

impl StockCache {
    pub fn new(ttl: TimeDelta) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    pub fn generation(&self, product_id: ProductId) -> u64 {
        self.generations
            .get(&product_id)
            .map(|generation| *generation)
            .unwrap_or_default()
    }

    /// Returns a fresh cached value, if any.
    pub fn get(&self, product_id: ProductId, now: DateTime<Utc>) -> Option<u64> {
        let cached = self.entries.get(&product_id).map(|entry| *entry)?;
        let fresh = now - cached.cached_at < self.ttl;
        (fresh && cached.generation == self.generation(product_id)).then_some(cached.available)
    }

    /// Stores a value computed under `generation`. Dropped if the product was
    /// invalidated since.
    pub fn put(&self, product_id: ProductId, available: u64, generation: u64, now: DateTime<Utc>) {
        let current = self.generations.entry(product_id).or_insert(0);
        if *current == generation {
            self.entries.insert(product_id, CachedStock {
                available,
                cached_at: now,
                generation,
            });
        }
    }

    pub fn invalidate(&self, product_id: ProductId) {
        *self.generations.entry(product_id).or_insert(0) += 1;
        self.entries.remove(&product_id);
    }
}

/// Point-in-time view of a product for the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockSnapshot {
    pub product_id: ProductId,
    pub name: String,
    pub price: Decimal,
    pub stock: u64,
    pub available_stock: u64,
}

impl StockSnapshot {
    const PRICE_PRECISION: u32 = 2;
}

impl Serialize for StockSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("StockSnapshot", 5)?;
        state.serialize_field("id", &self.product_id)?;
        state.serialize_field("name", &self.name)?;
        let mut price = self.price.round_dp(StockSnapshot::PRICE_PRECISION);
        price.rescale(StockSnapshot::PRICE_PRECISION);
        state.serialize_field("price", &price)?;
        state.serialize_field("stock", &self.stock)?;
        state.serialize_field("available_stock", &self.available_stock)?;
        state.end()
    }
}

/// Computes, caches and commits product stock.
pub struct StockLedger {
    store: Arc<Store>,
    cache: StockCache,
    clock: Arc<dyn Clock>,
}

impl StockLedger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, cache_ttl: TimeDelta) -> Self {
        Self {
            store,
            cache: StockCache::new(cache_ttl),
            clock,
        }
    }

    /// Available stock for the read path, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ProductNotFound`] if the product does not exist.
    pub fn available_stock(&self, product_id: ProductId) -> Result<u64, ReservationError> {
        let now = self.clock.now();
        if let Some(available) = self.cache.get(product_id, now) {
            return Ok(available);
        }

        let generation = self.cache.generation(product_id);
        let product = self
            .store
            .product(product_id)
            .ok_or(ReservationError::ProductNotFound(product_id))?;
        let reserved = self.store.reserved_quantity(product_id, now);
        let available = Self::remaining(&product, reserved);
        self.cache.put(product_id, available, generation, now);
        Ok(available)
    }

    /// Authoritative available stock inside a transaction that holds the
    /// product row lock. Never consults the cache.
    pub fn available_within(&self, tx: &Transaction<'_>, product: &Product, now: DateTime<Utc>) -> u64 {
        let reserved = tx.reserved_quantity(product.id, now);
        Self::remaining(product, reserved)
    }

    /// Takes `quantity` units out of physical stock as part of a sale.
    ///
    /// Locks the product row. The quantity was reserved beforehand, so the
    /// guard should never trip; if it does nothing is decremented.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ProductNotFound`] if the product does not exist.
    /// - [`ReservationError::SaleExceedsStock`] if `stock < quantity`.
    /// - [`ReservationError::Retryable`] on lock contention.
    pub fn commit_sale(
        &self,
        tx: &mut Transaction<'_>,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<(), ReservationError> {
        let mut product = tx
            .lock_product(product_id)?
            .ok_or(ReservationError::ProductNotFound(product_id))?;

        if product.stock < u64::from(quantity) {
            tracing::error!(
                product = %product_id,
                stock = product.stock,
                requested = quantity,
                "sale exceeds physical stock"
            );
            return Err(ReservationError::SaleExceedsStock {
                product_id,
                stock: product.stock,
                requested: quantity,
            });
        }

        product.stock -= u64::from(quantity);
        tx.update_product(product)?;
        tx.touch(product_id);
        Ok(())
    }

    /// Drops cached figures for every product a committed transaction touched.
    pub fn invalidate_all(&self, products: impl IntoIterator<Item = ProductId>) {
        for product_id in products {
            self.invalidate(product_id);
        }
    }

    pub fn invalidate(&self, product_id: ProductId) {
        self.cache.invalidate(product_id);
    }

    /// Read-path view of a product.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ProductNotFound`] if the product does not exist.
    pub fn snapshot(&self, product_id: ProductId) -> Result<StockSnapshot, ReservationError> {
        let product = self
            .store
            .product(product_id)
            .ok_or(ReservationError::ProductNotFound(product_id))?;
        let available_stock = self.available_stock(product_id)?;
        Ok(StockSnapshot {
            product_id,
            name: product.name,
            price: product.price,
            stock: product.stock,
            available_stock,
        })
    }

    fn remaining(product: &Product, reserved: u64) -> u64 {
        debug_assert!(
            reserved <= product.stock,
            "Invariant violated: product {} has {} reserved of {} in stock",
            product.id,
            reserved,
            product.stock
        );
        product.stock.saturating_sub(reserved)
    }
}
