/// HTTP surface
///
/// Only the endpoints the core depends on live here: health, metrics,
/// and the firehose WebSocket served from the sequencer. Everything else
/// belongs to the transport tier outside this crate.

pub mod firehose;
pub mod server;

pub use server::build_router;
