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

//! A single table of lockable rows.

use crate::store::{RowRef, StoreError};
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Exclusive row lock owned by a transaction until it commits or rolls back.
pub(crate) type RowGuard = ArcMutexGuard<RawMutex, ()>;

/// One row: the exclusive lock writers queue on, and the last committed value
/// readers see without queueing.
#[derive(Debug)]
struct RowCell<R> {
    lock: Arc<Mutex<()>>,
    committed: RwLock<R>,
}

impl<R> RowCell<R> {
    fn new(row: R) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            committed: RwLock::new(row),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Table<K, R>
where
    K: Eq + Hash,
{
    rows: DashMap<K, Arc<RowCell<R>>>,
}

impl<K, R> Table<K, R>
where
    K: Eq + Hash + Copy,
    R: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    /// Returns the last committed version of a row.
    pub(crate) fn get(&self, key: &K) -> Option<R> {
        let cell = self.cell(key)?;
        let row = cell.committed.read().clone();
        Some(row)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns committed rows matching `predicate`. Takes no row locks.
    pub(crate) fn filter(&self, mut predicate: impl FnMut(&R) -> bool) -> Vec<R> {
        self.rows
            .iter()
            .filter_map(|entry| {
                let row = entry.value().committed.read();
                predicate(&row).then(|| row.clone())
            })
            .collect()
    }

    /// Waits up to `timeout` for the exclusive lock on a row.
    ///
    /// Returns `Ok(None)` if the row does not exist. The returned value is read
    /// after the lock is acquired, so it reflects every commit made by earlier
    /// lock holders.
    pub(crate) fn lock(
        &self,
        key: &K,
        row: RowRef,
        timeout: Duration,
    ) -> Result<Option<(RowGuard, R)>, StoreError> {
        let Some(cell) = self.cell(key) else {
            return Ok(None);
        };
        let guard = cell
            .lock
            .try_lock_arc_for(timeout)
            .ok_or(StoreError::LockTimeout(row))?;
        let current = cell.committed.read().clone();
        Ok(Some((guard, current)))
    }

    /// Makes a row version visible to other transactions.
    ///
    /// Callers must hold the row lock, or own the row because they inserted it.
    pub(crate) fn publish(&self, key: K, row: R) {
        if let Some(cell) = self.cell(&key) {
            *cell.committed.write() = row;
            return;
        }
        self.rows.insert(key, Arc::new(RowCell::new(row)));
    }

    // Clone the cell out so no DashMap shard guard outlives this call.
    fn cell(&self, key: &K) -> Option<Arc<RowCell<R>>> {
        self.rows.get(key).map(|entry| Arc::clone(entry.value()))
    }
}
