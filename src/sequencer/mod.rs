/// Sequencer - durable ordered event log and fan-out bus
///
/// Every repository change is assigned a monotonically increasing
/// sequence number, logged durably, and broadcast to live subscribers.
/// The log is the source of truth; subscribers resume by cursor.

pub mod events;
pub mod sequencer;

pub use events::*;
pub use sequencer::{Sequencer, SequencerConfig};

use chrono::{DateTime, Utc};

/// Raw event row from the log
#[derive(Debug, Clone)]
pub struct SeqRow {
    pub seq: i64,
    pub did: String,
    pub event_type: String,
    /// CBOR-encoded event payload
    pub event: Vec<u8>,
    pub invalidated: bool,
    pub sequenced_at: DateTime<Utc>,
}

/// Event type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Commit,
    Identity,
    Account,
    Handle,
    Migrate,
    Tombstone,
    Info,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Commit => "commit",
            EventType::Identity => "identity",
            EventType::Account => "account",
            EventType::Handle => "handle",
            EventType::Migrate => "migrate",
            EventType::Tombstone => "tombstone",
            EventType::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "commit" => EventType::Commit,
            "identity" => EventType::Identity,
            "account" => EventType::Account,
            "handle" => EventType::Handle,
            "migrate" => EventType::Migrate,
            "tombstone" => EventType::Tombstone,
            "info" => EventType::Info,
            _ => return None,
        })
    }
}
