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

//! Exactly-once reconciliation of payment webhooks.
//!
//! The notifier may deliver the same event many times, concurrently, and
//! before the order it refers to exists. The idempotency key is the unit of
//! deduplication: the first delivery that commits a [`WebhookRecord`] for a
//! key applies the payment, every later delivery reads that record back.

use crate::base::{OrderId, WebhookId};
use crate::clock::Clock;
use crate::error::{Contention, ReservationError};
use crate::ledger::StockLedger;
use crate::model::{OrderStatus, PaymentStatus, WebhookRecord};
use crate::store::{NewWebhook, Store, StoreError};
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;

/// Longest accepted idempotency key, in characters.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Body of a payment notification as sent by the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub status: PaymentStatus,
    /// Accepted as a JSON number or a decimal string.
    #[serde(
        default,
        deserialize_with = "amount_from_number_or_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

fn amount_from_number_or_str<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(serde_json::Number),
        Text(String),
    }

    let text = match Option::<Amount>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Amount::Number(n)) => n.to_string(),
        Some(Amount::Text(s)) => s,
    };
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map(Some)
        .map_err(de::Error::custom)
}

/// A payment event ready for reconciliation, with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub status: PaymentStatus,
    /// Stored verbatim on the webhook record.
    pub payload: Value,
}

impl PaymentEvent {
    pub fn new(idempotency_key: impl Into<String>, order_id: OrderId, status: PaymentStatus) -> Self {
        let idempotency_key = idempotency_key.into();
        let payload = json!({
            "idempotency_key": idempotency_key,
            "order_id": order_id,
            "status": status,
        });
        Self {
            idempotency_key,
            order_id,
            status,
            payload,
        }
    }

    /// Parses a raw notification body, keeping the whole body as payload.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error if a required field is missing or
    /// malformed.
    pub fn from_json(payload: Value) -> Result<Self, serde_json::Error> {
        let parsed = WebhookPayload::deserialize(&payload)?;
        Ok(Self {
            idempotency_key: parsed.idempotency_key,
            order_id: parsed.order_id,
            status: parsed.status,
            payload,
        })
    }
}

/// Result of reconciling one payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub webhook_id: WebhookId,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    /// The key was seen before and nothing was changed.
    pub already_processed: bool,
}

impl Reconciliation {
    pub fn message(&self) -> &'static str {
        if self.already_processed {
            return "already processed";
        }
        match self.payment_status {
            PaymentStatus::Success => "payment successful - order marked as paid",
            PaymentStatus::Failure => "payment failed - order cancelled",
        }
    }
}

/// Applies payment events to orders exactly once per idempotency key.
pub struct WebhookReconciler {
    store: Arc<Store>,
    ledger: Arc<StockLedger>,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<Store>, ledger: Arc<StockLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
        }
    }

    /// Reconciles one delivery of a payment event.
    ///
    /// A pending order moves to `Paid` (and its quantity leaves physical
    /// stock) on success, or to `Cancelled` on failure. An order that is
    /// already paid or cancelled is left unchanged.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidIdempotencyKey`] if the key is empty or too long.
    /// - [`ReservationError::OrderNotYetCreated`] if the order does not exist yet.
    /// - [`ReservationError::Retryable`] on lock contention, or when a
    ///   concurrent delivery of the same key has not committed yet.
    /// - [`ReservationError::SaleExceedsStock`] if the sale would drive stock
    ///   negative. Nothing is applied.
    pub fn process(&self, event: &PaymentEvent) -> Result<Reconciliation, ReservationError> {
        let key_len = event.idempotency_key.chars().count();
        if key_len == 0 || key_len > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(ReservationError::InvalidIdempotencyKey);
        }

        if let Some(record) = self.store.webhook_by_key(&event.idempotency_key) {
            return self.replay(&record);
        }

        let mut tx = self.store.begin();
        let Some(mut order) = tx.lock_order(event.order_id)? else {
            tracing::warn!(
                key = %event.idempotency_key,
                order = %event.order_id,
                "webhook arrived before its order"
            );
            return Err(ReservationError::OrderNotYetCreated(event.order_id));
        };

        let inserted = tx.insert_webhook(NewWebhook {
            idempotency_key: event.idempotency_key.clone(),
            order_id: event.order_id,
            status: event.status,
            payload: event.payload.clone(),
            processed_at: self.clock.now(),
        });
        let record = match inserted {
            Ok(record) => record,
            Err(StoreError::UniqueViolation(_)) => {
                tx.rollback();
                return match self.store.webhook_by_key(&event.idempotency_key) {
                    Some(record) => self.replay(&record),
                    None => Err(ReservationError::Retryable(Contention::Conflict)),
                };
            }
            Err(err) => return Err(err.into()),
        };

        if order.status == OrderStatus::Pending {
            order.status = match event.status {
                PaymentStatus::Success => {
                    self.ledger
                        .commit_sale(&mut tx, order.product_id, order.quantity)?;
                    OrderStatus::Paid
                }
                PaymentStatus::Failure => OrderStatus::Cancelled,
            };
            tx.update_order(order.clone())?;
            tx.touch(order.product_id);
        } else {
            tracing::info!(
                key = %event.idempotency_key,
                order = %order.id,
                status = %order.status,
                "order already settled, payment recorded without effect"
            );
        }

        self.ledger.invalidate_all(tx.commit());
        tracing::info!(
            key = %event.idempotency_key,
            order = %order.id,
            payment = %event.status,
            order_status = %order.status,
            "webhook processed"
        );

        Ok(Reconciliation {
            webhook_id: record.id,
            payment_status: event.status,
            order_status: order.status,
            already_processed: false,
        })
    }

    fn replay(&self, record: &WebhookRecord) -> Result<Reconciliation, ReservationError> {
        let order = self.store.order(record.order_id).ok_or_else(|| {
            ReservationError::Internal(format!(
                "webhook {} references missing order {}",
                record.id, record.order_id
            ))
        })?;
        tracing::info!(
            key = %record.idempotency_key,
            order = %record.order_id,
            "duplicate webhook"
        );
        Ok(Reconciliation {
            webhook_id: record.id,
            payment_status: record.status,
            order_status: order.status,
            already_processed: true,
        })
    }
}
