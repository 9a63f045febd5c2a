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

//! # Flash Reserve
//!
//! This library provides a reservation engine for flash sales: short-lived
//! holds on limited stock, conversion of holds into orders, and exactly-once
//! reconciliation of payment webhooks that may arrive duplicated or before
//! their order exists.
//!
//! ## Core Components
//!
//! - [`Engine`]: Facade over every operation, safe to share across threads
//! - [`StockLedger`]: Available-stock accounting with a short-lived read cache
//! - [`HoldManager`]: Hold creation and the `active -> expired | consumed` transitions
//! - [`OrderManager`]: One order per hold
//! - [`WebhookReconciler`]: Idempotent payment application
//! - [`ExpirySweeper`]: Periodic release of lapsed holds
//! - [`ReservationError`]: Error types, classified by [`ErrorKind`]
//!
//! ## Example
//!
//! ```
//! use flash_reserve_rs::{Engine, PaymentEvent, PaymentStatus, ReconcileOutcome, OrderStatus};
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::new();
//! let product = engine.add_product("Limited Sneakers", dec!(199.99), 10);
//!
//! // Reserve two pairs and check out
//! let hold = engine.reserve(product.id, 2).unwrap();
//! let order = engine.convert(hold.id).unwrap();
//! assert_eq!(order.total_price, dec!(399.98));
//!
//! // The payment provider confirms
//! let event = PaymentEvent::new("pay-1", order.id, PaymentStatus::Success);
//! let ReconcileOutcome::Processed(outcome) = engine.reconcile(event).unwrap() else {
//!     panic!("order exists, nothing to defer");
//! };
//! assert_eq!(outcome.order_status, OrderStatus::Paid);
//! assert_eq!(engine.product(product.id).unwrap().stock, 8);
//! ```
//!
//! ## Thread Safety
//!
//! Every stock-changing operation runs in a store transaction holding row
//! locks, so concurrent buyers of the same product are serialized while
//! different products proceed in parallel.

mod base;
pub mod clock;
pub mod config;
mod deferred;
mod engine;
pub mod error;
pub mod hold;
pub mod ledger;
pub mod model;
pub mod order;
pub mod store;
pub mod sweeper;
pub mod webhook;

pub use base::{HoldId, OrderId, ProductId, WebhookId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Backoff, EngineConfig, RetryPolicy};
pub use deferred::DeferredWebhooks;
pub use engine::{DeferredReport, Engine, ReconcileOutcome};
pub use error::{Contention, ErrorKind, ReservationError};
pub use hold::HoldManager;
pub use ledger::{StockLedger, StockSnapshot};
pub use model::{Hold, HoldStatus, Order, OrderStatus, PaymentStatus, Product, WebhookRecord};
pub use order::OrderManager;
pub use store::{Store, StoreError};
pub use sweeper::{ExpirySweeper, SweepOutcome, SweepReport, SweeperHandle};
pub use webhook::{PaymentEvent, Reconciliation, WebhookPayload, WebhookReconciler};
