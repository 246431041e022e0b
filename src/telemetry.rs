//! Telemetry records and the latest-value cache.
//!
//! Telemetry arrives as JSON objects carrying a `messageType` discriminator.
//! Only `"telemetry"` messages become records; everything else is dropped by
//! the caller without touching the cache.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// JSON field that names the kind of message.
pub const MESSAGE_TYPE_FIELD: &str = "messageType";

/// The only message kind that is published.
pub const TELEMETRY_MESSAGE_TYPE: &str = "telemetry";

/// One parsed telemetry message. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct TelemetryRecord {
    document: Value,
    received_at: Instant,
}

impl TelemetryRecord {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            document: Value::Object(fields),
            received_at: Instant::now(),
        }
    }

    /// The whole message as a JSON object.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Look up a nested field by JSON pointer (e.g. `/airVehicleLocation/altitude`).
    pub fn get(&self, pointer: &str) -> Option<&Value> {
        self.document.pointer(pointer)
    }

    pub fn f64_at(&self, pointer: &str) -> Option<f64> {
        self.get(pointer).and_then(Value::as_f64)
    }

    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.get(pointer).and_then(Value::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.document.get(MESSAGE_TYPE_FIELD).and_then(Value::as_str)
    }

    /// Time since the message was parsed.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Parse one telemetry payload.
///
/// Returns an error if:
/// - The payload is not a JSON object
/// - `messageType` is missing or is not `"telemetry"`
pub fn parse_telemetry(payload: &[u8]) -> Result<TelemetryRecord> {
    let fields: Map<String, Value> =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;

    match fields.get(MESSAGE_TYPE_FIELD) {
        Some(Value::String(kind)) if kind == TELEMETRY_MESSAGE_TYPE => {}
        Some(Value::String(kind)) => {
            return Err(anyhow!("ignoring '{}' message", kind));
        }
        Some(_) => return Err(anyhow!("'{}' is not a string", MESSAGE_TYPE_FIELD)),
        None => return Err(anyhow!("missing '{}'", MESSAGE_TYPE_FIELD)),
    }

    Ok(TelemetryRecord::from_fields(fields))
}

// ----------------------------------------------------------------------------
// LatestTelemetryCell
// ----------------------------------------------------------------------------

/// Single-slot, overwrite-on-write telemetry cache.
///
/// Writers swap in a whole `Arc<TelemetryRecord>`; readers clone the `Arc`.
/// The lock is only held for the pointer swap or clone, never across I/O, and
/// a reader can never observe a half-built record.
#[derive(Debug, Default)]
pub struct LatestTelemetryCell {
    slot: RwLock<Option<Arc<TelemetryRecord>>>,
    version: AtomicU64,
}

impl LatestTelemetryCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current record.
    pub fn publish(&self, record: TelemetryRecord) {
        let record = Arc::new(record);
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            slot.replace(record)
        };
        self.version.fetch_add(1, Ordering::AcqRel);
        drop(previous);
    }

    /// The most recently published record, or `None` before the first publish.
    pub fn latest(&self) -> Option<Arc<TelemetryRecord>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of records published so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
