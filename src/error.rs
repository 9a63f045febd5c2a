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

//! Error types for reservation, conversion and reconciliation.
//!
//! Callers branch on [`ReservationError::kind`] (or match the variants
//! directly), never on message text.

use crate::base::{HoldId, OrderId, ProductId};
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Source of a transient store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contention {
    /// A row lock could not be acquired within the lock timeout.
    LockTimeout,
    /// The lock request was refused because it could close a wait cycle.
    Deadlock,
    /// A uniqueness claim is held by a transaction that has not committed yet.
    Conflict,
}

impl fmt::Display for Contention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LockTimeout => "lock wait timeout",
            Self::Deadlock => "deadlock",
            Self::Conflict => "uncommitted conflicting write",
        };
        f.write_str(name)
    }
}

/// Coarse classification used to decide retry and response policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientStock,
    InvalidOrExpired,
    AlreadyUsed,
    OrderNotYetCreated,
    Retryable,
    Internal,
}

/// Reservation engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// Hold quantity outside `1..=max`
    #[error("quantity {quantity} is outside the allowed range 1..={max}")]
    InvalidQuantity { quantity: u32, max: u32 },

    /// Idempotency key is empty or longer than 255 characters
    #[error("idempotency key must be between 1 and 255 characters")]
    InvalidIdempotencyKey,

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("hold {0} not found")]
    HoldNotFound(HoldId),

    /// Not enough unreserved stock to satisfy a hold
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: u32, available: u64 },

    /// Hold is expired, or no longer active
    #[error("hold {0} is invalid or expired")]
    HoldInvalidOrExpired(HoldId),

    /// Hold has already been converted into an order
    #[error("hold {0} has already been used")]
    HoldAlreadyUsed(HoldId),

    /// Payment event references an order that does not exist yet
    #[error("order {0} has not been created yet")]
    OrderNotYetCreated(OrderId),

    #[error("transient store failure: {0}")]
    Retryable(Contention),

    /// A sale would take physical stock below zero
    #[error("sale of {requested} units exceeds stock {stock} of product {product_id}")]
    SaleExceedsStock {
        product_id: ProductId,
        stock: u64,
        requested: u32,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuantity { .. } | Self::InvalidIdempotencyKey => ErrorKind::Validation,
            Self::ProductNotFound(_) | Self::HoldNotFound(_) => ErrorKind::NotFound,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::HoldInvalidOrExpired(_) => ErrorKind::InvalidOrExpired,
            Self::HoldAlreadyUsed(_) => ErrorKind::AlreadyUsed,
            Self::OrderNotYetCreated(_) => ErrorKind::OrderNotYetCreated,
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::SaleExceedsStock { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` for transient failures that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Retryable | ErrorKind::OrderNotYetCreated
        )
    }
}

impl From<StoreError> for ReservationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(_) => Self::Retryable(Contention::LockTimeout),
            StoreError::Deadlock { .. } => Self::Retryable(Contention::Deadlock),
            StoreError::UniqueViolation(_) | StoreError::NotLocked(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}
