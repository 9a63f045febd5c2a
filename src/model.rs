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

//! Persisted rows and their state machines.
//!
//! Holds follow:
//! - [`Active`](HoldStatus::Active) → [`Expired`](HoldStatus::Expired) (via the sweeper)
//! - [`Active`](HoldStatus::Active) → [`Consumed`](HoldStatus::Consumed) (via order conversion)
//!
//! Orders follow:
//! - [`Pending`](OrderStatus::Pending) → [`Paid`](OrderStatus::Paid) or
//!   [`Cancelled`](OrderStatus::Cancelled) (via payment reconciliation)
//!
//! Every non-initial state is terminal.

use crate::base::{HoldId, OrderId, ProductId, WebhookId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A sellable product with finite physical stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Physical units on hand. Only decremented by a committed sale.
    pub stock: u64,
    pub price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Active,
    Expired,
    Consumed,
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Consumed => "consumed",
        };
        f.write_str(name)
    }
}

/// A time-bounded reservation of stock against one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: HoldId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    /// Returns `true` if the hold is active and its window has not lapsed.
    ///
    /// Only valid holds reserve stock and only valid holds can be converted.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Active && self.expires_at > now
    }

    /// Returns `true` if the hold is still active but its window has lapsed,
    /// i.e. the sweeper should expire it.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == HoldStatus::Active && self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// An order created from exactly one hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub hold_id: HoldId,
    pub product_id: ProductId,
    pub quantity: u32,
    /// Unit price times quantity, fixed when the order is created.
    pub total_price: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// A pending order still holds its quantity back from sale.
    ///
    /// Once paid the quantity has left the physical stock; once cancelled it
    /// is released.
    pub fn reserves_stock(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

/// Outcome reported by the payment notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Failure,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// An applied payment webhook. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub id: WebhookId,
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub status: PaymentStatus,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}
