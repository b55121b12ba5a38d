use crate::diagnosis::{AlarmEvent, Recommendation, Severity};
use crate::store::{AlarmRecord, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const RECOMMENDATION_PREFIX: &str = "REC_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Emitted,
    Suppressed,
    Failed,
}

impl AlarmRecord {
    pub fn new(
        device_id: &str,
        code: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        data: Value,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            code: code.into(),
            severity,
            message: message.into(),
            data,
            ts,
        }
    }

    pub fn from_event(device_id: &str, event: &AlarmEvent, data: Value, ts: DateTime<Utc>) -> Self {
        Self::new(device_id, event.code, event.severity, join_message(event.title, &event.detail), data, ts)
    }

    pub fn from_recommendation(device_id: &str, rec: &Recommendation, ts: DateTime<Utc>) -> Self {
        Self::new(
            device_id,
            format!("{RECOMMENDATION_PREFIX}{}", rec.code),
            Severity::Info,
            join_message(rec.title, rec.detail),
            Value::Object(Default::default()),
            ts,
        )
    }
}

fn join_message(title: &str, detail: &str) -> String {
    if detail.is_empty() {
        title.to_string()
    } else {
        format!("{title}\n{detail}")
    }
}

/// Writes alarms to the store, holding back repeats of the same (device, code) inside the
/// cooldown. A failed write is logged and dropped; it is neither cached nor retried.
pub struct AlarmSink {
    store: Arc<dyn Store>,
    cooldown: ChronoDuration,
    last_emitted: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl AlarmSink {
    pub fn new(store: Arc<dyn Store>, cooldown: std::time::Duration) -> Self {
        let cooldown =
            ChronoDuration::from_std(cooldown).unwrap_or_else(|_| ChronoDuration::minutes(15));
        Self {
            store,
            cooldown,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> ChronoDuration {
        self.cooldown
    }

    fn within_cooldown(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last < self.cooldown
    }

    pub async fn emit(&self, alarm: AlarmRecord) -> Emission {
        let key = (alarm.device_id.clone(), alarm.code.clone());
        let cached = self.last_emitted.lock().await.get(&key).copied();
        if cached.is_some_and(|last| self.within_cooldown(last, alarm.ts)) {
            tracing::trace!(device = %alarm.device_id, code = %alarm.code, "alarm suppressed (cached)");
            return Emission::Suppressed;
        }

        match self.store.last_alarm_at(&alarm.device_id, &alarm.code).await {
            Ok(Some(last)) if self.within_cooldown(last, alarm.ts) => {
                self.last_emitted.lock().await.insert(key, last);
                tracing::trace!(device = %alarm.device_id, code = %alarm.code, "alarm suppressed (store)");
                return Emission::Suppressed;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    device = %alarm.device_id,
                    code = %alarm.code,
                    error = %err,
                    "alarm cooldown lookup failed; dropping alarm"
                );
                return Emission::Failed;
            }
        }

        self.emit_now(alarm).await
    }

    /// Writes without the cooldown check. Used for presence transitions and command ACKs.
    pub async fn emit_now(&self, alarm: AlarmRecord) -> Emission {
        match self.store.insert_alarm(&alarm).await {
            Ok(()) => {
                tracing::info!(
                    device = %alarm.device_id,
                    code = %alarm.code,
                    severity = %alarm.severity,
                    "alarm emitted"
                );
                self.last_emitted
                    .lock()
                    .await
                    .insert((alarm.device_id, alarm.code), alarm.ts);
                Emission::Emitted
            }
            Err(err) => {
                tracing::warn!(
                    device = %alarm.device_id,
                    code = %alarm.code,
                    error = %err,
                    "failed to persist alarm; dropping"
                );
                Emission::Failed
            }
        }
    }
}
