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

//! Thread-safe queue of payment events waiting for their order.
//!
//! Provides a concurrent FIFO queue that holds at most one event per
//! idempotency key.

use crate::webhook::PaymentEvent;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Deferred payment events with duplicate detection.
///
/// Combines a [`DashMap`] for O(1) duplicate checking with a [`SegQueue`]
/// to preserve arrival order.
#[derive(Debug, Default)]
pub struct DeferredWebhooks {
    /// Events keyed by idempotency key.
    events: DashMap<String, PaymentEvent>,

    /// Keys in FIFO order.
    keys: SegQueue<String>,
}

impl DeferredWebhooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event. Returns `false` if its key is already queued.
    pub fn push(&self, event: PaymentEvent) -> bool {
        // Entry API keeps check-and-insert atomic
        match self.events.entry(event.idempotency_key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                self.keys.push(event.idempotency_key.clone());
                entry.insert(event);
                true
            }
        }
    }

    /// Takes every queued event, oldest first.
    pub fn drain(&self) -> Vec<PaymentEvent> {
        let mut drained = Vec::with_capacity(self.keys.len());
        while let Some(key) = self.keys.pop() {
            if let Some((_, event)) = self.events.remove(&key) {
                drained.push(event);
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
