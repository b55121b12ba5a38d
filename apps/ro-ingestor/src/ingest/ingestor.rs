use super::{Dispatch, DropReason, TelemetryIngestor, CODE_CMD_ACK};
use crate::alarms::AlarmSink;
use crate::diagnosis::Severity;
use crate::pipeline::{IngestStats, SnapshotWriter};
use crate::presence::PresenceTracker;
use crate::store::AlarmRecord;
use crate::telemetry::{decode_payload, Decoded, DeviceEvent, Topic};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

impl TelemetryIngestor {
    pub fn new(
        topic_root: &str,
        presence: Arc<PresenceTracker>,
        writer: Arc<SnapshotWriter>,
        alarms: Arc<AlarmSink>,
    ) -> Self {
        let stats = writer.stats();
        Self {
            topic_root: Arc::from(topic_root.trim_matches('/')),
            presence,
            writer,
            alarms,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn topic_root(&self) -> &str {
        &self.topic_root
    }

    pub fn writer(&self) -> Arc<SnapshotWriter> {
        self.writer.clone()
    }

    fn drop_message(&self, reason: DropReason) -> Dispatch {
        self.stats.record_dropped_message();
        Dispatch::Dropped(reason)
    }

    /// Handles one message. Nothing here is fatal: bad input is counted and dropped.
    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &mut [u8],
        received_at: DateTime<Utc>,
    ) -> Dispatch {
        let parsed = match Topic::parse(&self.topic_root, topic) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(topic, error = %err, "ignoring MQTT topic");
                return self.drop_message(DropReason::BadTopic);
            }
        };
        let device_id = parsed.device;

        let registered = match self.presence.touch(device_id, received_at).await {
            Ok(registered) => registered,
            Err(err) => {
                tracing::warn!(device = %device_id, error = %err, "presence touch failed; dropping message");
                self.stats.record_error(format!("presence touch failed: {err}"));
                return self.drop_message(DropReason::PresenceUnavailable);
            }
        };
        match registered {
            None => {
                tracing::warn!(
                    target: "security",
                    device = %device_id,
                    tenant = %parsed.tenant,
                    "message from unregistered device dropped"
                );
                return self.drop_message(DropReason::UnknownDevice);
            }
            Some(prefix) if !prefix_matches(&prefix, &parsed.prefix()) => {
                tracing::warn!(
                    target: "security",
                    device = %device_id,
                    topic,
                    registered_prefix = %prefix,
                    "message outside the device's registered topic prefix dropped"
                );
                return self.drop_message(DropReason::UnknownDevice);
            }
            Some(_) => {}
        }

        let decoded = match decode_payload(parsed.kind, &parsed.rest, payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::debug!(device = %device_id, topic, error = %err, "dropping undecodable payload");
                return self.drop_message(DropReason::BadPayload);
            }
        };

        match decoded {
            Decoded::Update(update) => {
                Dispatch::Written(self.writer.enqueue(device_id, &update, received_at).await)
            }
            Decoded::Event(event) if event.is_ack() => {
                self.alarms
                    .emit_now(AlarmRecord::new(
                        device_id,
                        CODE_CMD_ACK,
                        Severity::Info,
                        ack_message(&event),
                        event.payload,
                        received_at,
                    ))
                    .await;
                Dispatch::Acked
            }
            Decoded::Event(event) => {
                tracing::debug!(device = %device_id, name = %event.name, "device event");
                Dispatch::EventIgnored
            }
        }
    }
}

/// An empty registered prefix means the device was registered without one.
fn prefix_matches(registered: &str, actual: &str) -> bool {
    let registered = registered.trim().trim_end_matches('/');
    registered.is_empty() || registered == actual
}

/// `ACK cmd=<cmd> ok=<ok>`; a missing `cmd` renders empty and `ok` renders as JSON.
pub fn ack_message(event: &DeviceEvent) -> String {
    let cmd = match event.payload.get("cmd") {
        Some(Value::String(cmd)) => cmd.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let ok = event.payload.get("ok").cloned().unwrap_or(Value::Null);
    format!("ACK cmd={cmd} ok={ok}")
}
