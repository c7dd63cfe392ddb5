//! Key layout of the store.
//!
//! Every entity lives in one ordered byte-key table; the key prefix is the
//! type tag and keeps the ranges disjoint:
//!
//! - `file:<drawer>:<filename>` — raw blob bytes
//! - `meta:<drawer>:<filename>` — encoded [`MetaData`](crate::wire::MetaData)
//! - `event:<20-digit nanos>` — encoded [`Event`](crate::wire::Event)
//! - `latest_event` — the key of the most recent event

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key of the pointer to the most recent event record.
pub const LATEST_EVENT: &[u8] = b"latest_event";

/// Prefix shared by all event keys; also the lower bound of the event range.
pub const EVENT_PREFIX: &str = "event:";

/// Exclusive upper bound of the event range. `~` sorts above every digit,
/// and the whole key sorts below `file:`.
pub const EVENT_RANGE_END: &[u8] = b"event:~";

/// Lower/upper bounds of the file blob range.
pub const FILE_RANGE: (&[u8], &[u8]) = (b"file:", b"file;");

/// Lower/upper bounds of the metadata range.
pub const META_RANGE: (&[u8], &[u8]) = (b"meta:", b"meta;");

/// Drawer names that would shadow the API URL namespace.
const RESERVED_DRAWERS: &[&str] = &["api"];

pub fn file_key(drawer: &str, filename: &str) -> Vec<u8> {
    format!("file:{drawer}:{filename}").into_bytes()
}

pub fn meta_key(drawer: &str, filename: &str) -> Vec<u8> {
    format!("meta:{drawer}:{filename}").into_bytes()
}

/// A drawer name is non-empty, not reserved, and drawn from letters,
/// digits and `. : , ; $ -`.
pub fn valid_drawer_name(drawer: &str) -> bool {
    !drawer.is_empty()
        && !RESERVED_DRAWERS.contains(&drawer)
        && drawer
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | ',' | ';' | '$' | '-'))
}

/// Generate a short random filename: 128 random bits, hex-encoded,
/// plus `.ext` when an extension is given. Collision-resistant, not
/// cryptographic.
pub fn random_filename(ext: Option<&str>) -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    match ext {
        Some(ext) if !ext.is_empty() => format!("{}.{ext}", hex::encode(bytes)),
        _ => hex::encode(bytes),
    }
}

/// Mints event keys from nanosecond wall-clock readings.
///
/// Keys are zero-padded to 20 decimal digits so lexicographic order equals
/// chronological order. The clock remembers the last timestamp it issued
/// and bumps forward by one nanosecond on a collision or a backwards
/// wall-clock step, so two mints never produce the same key.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Mutex<u64>,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next event key. Strictly greater than every key minted
    /// before it by this clock.
    pub fn next_key(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let ts = if now <= *last { *last + 1 } else { now };
        *last = ts;
        format!("{EVENT_PREFIX}{ts:020}")
    }
}
