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

use chrono::{TimeDelta, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use flash_reserve_rs::{
    Engine, EngineConfig, HoldId, ManualClock, OrderId, PaymentEvent, PaymentStatus, ProductId,
    RetryPolicy,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Flash Reserve - Replay a flash sale from CSV files
///
/// Seeds products, replays a script of reservations, checkouts, payment
/// webhooks and expiry sweeps, then prints every product's stock to stdout.
#[derive(Parser, Debug)]
#[command(name = "flash-reserve-rs")]
#[command(about = "Replays a flash-sale event script and reports stock", long_about = None)]
struct Args {
    /// Path to CSV file with products
    ///
    /// Expected format: name,price,stock
    #[arg(value_name = "PRODUCTS")]
    products: PathBuf,

    /// Path to CSV file with the event script
    ///
    /// Expected format: action,id,quantity,key,status
    /// Example: cargo run -- products.csv events.csv > stock.csv
    #[arg(value_name = "EVENTS")]
    events: PathBuf,

    /// How long a hold reserves stock, in seconds
    #[arg(long, default_value_t = 120)]
    hold_ttl_secs: i64,

    /// Largest quantity a single hold may reserve
    #[arg(long, default_value_t = 10)]
    max_hold_quantity: u32,

    /// How long available stock may be served from cache, in seconds
    #[arg(long, default_value_t = 5)]
    cache_ttl_secs: i64,

    /// Row lock wait timeout, in milliseconds
    #[arg(long, default_value_t = 5000)]
    lock_timeout_ms: u64,
}

impl Args {
    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_hold_ttl(TimeDelta::seconds(self.hold_ttl_secs))
            .with_max_hold_quantity(self.max_hold_quantity)
            .with_cache_ttl(TimeDelta::seconds(self.cache_ttl_secs))
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let open = |path: &PathBuf| match File::open(path) {
        Ok(f) => BufReader::new(f),
        Err(e) => {
            eprintln!("Error opening file '{}': {}", path.display(), e);
            process::exit(1);
        }
    };
    let products = open(&args.products);
    let events = open(&args.events);

    let replay = match Replay::new(args.config(), products) {
        Ok(replay) => replay,
        Err(e) => {
            eprintln!("Error loading products: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = replay.run(events) {
        eprintln!("Error processing events: {}", e);
        process::exit(1);
    }

    if let Err(e) = write_snapshots(&replay.engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record for a product.
///
/// Fields: `name, price, stock`
#[derive(Debug, Deserialize)]
struct ProductRecord {
    name: String,
    price: Decimal,
    stock: u64,
}

/// Raw CSV record for a scripted event.
///
/// Fields: `action, id, quantity, key, status`
#[derive(Debug, Deserialize)]
struct EventRecord {
    action: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    id: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    quantity: Option<u32>,
    key: Option<String>,
    #[serde(deserialize_with = "csv::invalid_option")]
    status: Option<PaymentStatus>,
}

#[derive(Debug, PartialEq)]
enum Event {
    Reserve { product_id: ProductId, quantity: u32 },
    Convert { hold_id: HoldId },
    Webhook(PaymentEvent),
    Sweep,
    RetryDeferred,
    /// Moves the replay clock forward by `id` seconds.
    Advance(TimeDelta),
}

impl EventRecord {
    /// Converts a CSV record to an event.
    ///
    /// Returns `None` for unknown actions or missing required fields.
    fn into_event(self) -> Option<Event> {
        match self.action.to_lowercase().as_str() {
            "reserve" => Some(Event::Reserve {
                product_id: ProductId(self.id?),
                quantity: self.quantity?,
            }),
            "convert" => Some(Event::Convert {
                hold_id: HoldId(self.id?),
            }),
            "webhook" => Some(Event::Webhook(PaymentEvent::new(
                self.key?,
                OrderId(self.id?),
                self.status?,
            ))),
            "sweep" => Some(Event::Sweep),
            "retry" => Some(Event::RetryDeferred),
            "advance" => {
                let seconds = i64::try_from(self.id?).ok()?;
                Some(Event::Advance(TimeDelta::try_seconds(seconds)?))
            }
            _ => None,
        }
    }
}

/// An engine driven by a manual clock, so scripts replay deterministically.
struct Replay {
    engine: Engine,
    clock: Arc<ManualClock>,
}

impl Replay {
    /// Builds the engine and seeds it with the products CSV.
    ///
    /// Webhooks get a single attempt: an early one is deferred straight away
    /// and picked up by a later `retry` action.
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the reader fails or a row is malformed.
    fn new<R: Read>(config: EngineConfig, products: R) -> Result<Self, csv::Error> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Engine::with_clock(config.with_webhook_retry(RetryPolicy::once()), clock.clone());

        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .has_headers(true)
            .from_reader(products);
        for record in rdr.deserialize::<ProductRecord>() {
            let record = record?;
            engine.add_product(record.name, record.price, record.stock);
        }

        Ok(Replay { engine, clock })
    }

    /// Applies every event of the script in order.
    ///
    /// Malformed rows and rejected operations are logged and skipped.
    ///
    /// # CSV Format
    ///
    /// ```csv
    /// action,id,quantity,key,status
    /// reserve,1,2,,
    /// convert,1,,,
    /// webhook,1,,pay-1,success
    /// advance,180,,,
    /// sweep,,,,
    /// retry,,,,
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the reader fails.
    fn run<R: Read>(&self, events: R) -> Result<(), csv::Error> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .has_headers(true)
            .from_reader(events);

        for result in rdr.deserialize::<EventRecord>() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed row");
                    continue;
                }
            };
            let Some(event) = record.into_event() else {
                tracing::warn!("skipping invalid event record");
                continue;
            };
            self.apply(event);
        }

        Ok(())
    }

    fn apply(&self, event: Event) {
        let result = match event {
            Event::Reserve {
                product_id,
                quantity,
            } => self.engine.reserve(product_id, quantity).map(drop),
            Event::Convert { hold_id } => self.engine.convert(hold_id).map(drop),
            Event::Webhook(payment) => self.engine.reconcile(payment).map(drop),
            Event::Sweep => {
                self.engine.sweep();
                Ok(())
            }
            Event::RetryDeferred => {
                self.engine.retry_deferred();
                Ok(())
            }
            Event::Advance(delta) => {
                self.clock.advance(delta);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, kind = ?e.kind(), "event rejected");
        }
    }
}

/// Write product snapshots to a CSV writer.
///
/// # CSV Format
///
/// Columns: `id, name, price, stock, available_stock`
///
/// # Errors
///
/// Returns a CSV error if writing fails.
fn write_snapshots<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for snapshot in engine.snapshots() {
        wtr.serialize(&snapshot)?;
    }
    wtr.flush()?;
    Ok(())
}
