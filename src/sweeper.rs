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

//! Background expiry of lapsed holds.

use crate::base::HoldId;
use crate::clock::Clock;
use crate::error::ReservationError;
use crate::hold::HoldManager;
use crate::ledger::StockLedger;
use crate::store::Store;
use crossbeam::channel::{self, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Counts from one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already running.
    Skipped,
}

/// Expires holds whose window lapsed. At most one run is active at a time.
pub struct ExpirySweeper {
    store: Arc<Store>,
    holds: Arc<HoldManager>,
    ledger: Arc<StockLedger>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

/// Clears the running flag even if a sweep unwinds.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ExpirySweeper {
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
            running: AtomicBool::new(false),
        }
    }

    /// Expires every active hold with `expires_at <= now`.
    ///
    /// Each hold is expired in its own transaction; a failure is logged and
    /// counted without stopping the run.
    pub fn sweep(&self) -> SweepOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sweep already in progress, skipping");
            return SweepOutcome::Skipped;
        }
        let _guard = RunGuard(&self.running);

        let now = self.clock.now();
        let mut report = SweepReport::default();
        for hold in self.store.due_holds(now) {
            match self.expire_if_due(hold.id) {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(hold = %hold.id, error = %err, "failed to expire hold");
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.expired,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        SweepOutcome::Completed(report)
    }

    fn expire_if_due(&self, hold_id: HoldId) -> Result<bool, ReservationError> {
        let mut tx = self.store.begin();
        let Some(hold) = tx.lock_hold(hold_id)? else {
            return Ok(false);
        };
        // Converted or expired since it was selected.
        if !hold.is_due(self.clock.now()) {
            return Ok(false);
        }

        let expired = self.holds.expire_within(&mut tx, hold_id)?;
        self.ledger.invalidate_all(tx.commit());
        Ok(expired)
    }

    /// Runs [`sweep`](Self::sweep) every `interval` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (stop, stopped) = channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || {
                let ticker = channel::tick(interval);
                tracing::info!(?interval, "expiry sweeper started");
                loop {
                    channel::select! {
                        recv(ticker) -> _ => {
                            self.sweep();
                        }
                        recv(stopped) -> _ => break,
                    }
                }
                tracing::info!("expiry sweeper stopped");
            })?;

        Ok(SweeperHandle { stop, thread })
    }
}

/// Handle to a running background sweeper.
pub struct SweeperHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper and waits for an in-flight run to finish.
    pub fn stop(self) {
        drop(self.stop);
        if self.thread.join().is_err() {
            tracing::error!("expiry sweeper thread panicked");
        }
    }
}
