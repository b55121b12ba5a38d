mod ingestor;

#[cfg(test)]
mod tests;

use crate::alarms::AlarmSink;
use crate::pipeline::{IngestStats, SnapshotWriter, WriteOutcome};
use crate::presence::PresenceTracker;
use std::sync::Arc;

pub use ingestor::ack_message;

pub const CODE_CMD_ACK: &str = "CMD_ACK";

/// Routes decoded MQTT messages to presence, the snapshot writer and the alarm sink.
#[derive(Clone)]
pub struct TelemetryIngestor {
    topic_root: Arc<str>,
    presence: Arc<PresenceTracker>,
    writer: Arc<SnapshotWriter>,
    alarms: Arc<AlarmSink>,
    stats: Arc<IngestStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadTopic,
    /// Not registered, or registered under a different topic prefix.
    UnknownDevice,
    PresenceUnavailable,
    BadPayload,
}

#[derive(Debug)]
pub enum Dispatch {
    Dropped(DropReason),
    Written(WriteOutcome),
    Acked,
    EventIgnored,
}
