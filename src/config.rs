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

//! Engine configuration and retry policies.

use chrono::TimeDelta;
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base × attempt`
    Linear,
    /// `base × 2^(attempt − 1)`
    Exponential,
}

/// Bounded retry with backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Hold creation and conversion: 3 attempts, 100ms, 200ms apart.
    pub const fn contention() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff: Backoff::Linear,
        }
    }

    /// Webhook reconciliation: 5 attempts, 100ms, 200ms, 400ms, 800ms apart.
    pub const fn out_of_order() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
        }
    }

    /// A single attempt, no retry.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff: Backoff::Linear,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

/// Tunables for the reservation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a hold reserves stock.
    pub hold_ttl: TimeDelta,
    /// Largest quantity a single hold may reserve.
    pub max_hold_quantity: u32,
    /// How long a computed available-stock value may be served from cache.
    pub cache_ttl: TimeDelta,
    /// How long a transaction waits for a row lock before giving up.
    pub lock_timeout: Duration,
    /// Cadence of the background expiry sweeper.
    pub sweep_interval: Duration,
    pub reserve_retry: RetryPolicy,
    pub webhook_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl: TimeDelta::minutes(2),
            max_hold_quantity: 10,
            cache_ttl: TimeDelta::seconds(5),
            lock_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            reserve_retry: RetryPolicy::contention(),
            webhook_retry: RetryPolicy::out_of_order(),
        }
    }
}

impl EngineConfig {
    pub fn with_hold_ttl(mut self, ttl: TimeDelta) -> Self {
        self.hold_ttl = ttl;
        self
    }

    pub fn with_max_hold_quantity(mut self, max: u32) -> Self {
        self.max_hold_quantity = max;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: TimeDelta) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_reserve_retry(mut self, policy: RetryPolicy) -> Self {
        self.reserve_retry = policy;
        self
    }

    pub fn with_webhook_retry(mut self, policy: RetryPolicy) -> Self {
        self.webhook_retry = policy;
        self
    }
}
