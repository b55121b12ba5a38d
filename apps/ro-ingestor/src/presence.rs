use crate::alarms::AlarmSink;
use crate::device::DeviceStatus;
use crate::diagnosis::Severity;
use crate::store::{AlarmRecord, Store};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CODE_FIRST_SEEN: &str = "DEVICE_FIRST_SEEN";
pub const CODE_RECONNECTED: &str = "DEVICE_RECONNECTED";
pub const CODE_OFFLINE: &str = "DEVICE_OFFLINE";

#[derive(Debug, Clone)]
struct TouchEntry {
    touched_at: DateTime<Utc>,
    /// `None` caches a lookup that found no registered device.
    topic_prefix: Option<String>,
}

/// Tracks device liveness: throttled `last_seen` touches on the ingest path and the periodic
/// offline scan.
pub struct PresenceTracker {
    store: Arc<dyn Store>,
    alarms: Arc<AlarmSink>,
    touch_interval: ChronoDuration,
    offline_after: ChronoDuration,
    touched: Mutex<HashMap<String, TouchEntry>>,
}

fn to_chrono(duration: Duration, fallback_secs: i64) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(fallback_secs))
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn Store>,
        alarms: Arc<AlarmSink>,
        touch_interval: Duration,
        offline_after: Duration,
    ) -> Self {
        Self {
            store,
            alarms,
            touch_interval: to_chrono(touch_interval, 30),
            offline_after: to_chrono(offline_after, 180),
            touched: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `device_id` reported at `now`. Returns the registered topic prefix, or
    /// `None` for an unknown device.
    pub async fn touch(&self, device_id: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        {
            let touched = self.touched.lock().await;
            if let Some(entry) = touched.get(device_id) {
                if now - entry.touched_at < self.touch_interval {
                    return Ok(entry.topic_prefix.clone());
                }
            }
        }

        let previous = self.store.touch_device_seen(device_id, now).await?;
        let topic_prefix = previous.as_ref().map(|device| device.topic_prefix.clone());
        self.touched.lock().await.insert(
            device_id.to_string(),
            TouchEntry {
                touched_at: now,
                topic_prefix: topic_prefix.clone(),
            },
        );

        let Some(previous) = previous else {
            return Ok(None);
        };
        let transition = if previous.last_seen.is_none() {
            Some((CODE_FIRST_SEEN, "Device started reporting for the first time."))
        } else if previous.status == DeviceStatus::Offline {
            Some((CODE_RECONNECTED, "Device reported again (reconnected)."))
        } else {
            None
        };
        if let Some((code, message)) = transition {
            tracing::info!(device = %device_id, code, "device presence changed");
            self.alarms
                .emit_now(AlarmRecord::new(
                    device_id,
                    code,
                    Severity::Info,
                    message,
                    json!({ "previous_status": previous.status }),
                    now,
                ))
                .await;
        }
        Ok(topic_prefix)
    }

    /// Drops throttle entries whose interval has lapsed; they would miss the cache anyway.
    async fn prune_touched(&self, now: DateTime<Utc>) -> usize {
        let mut touched = self.touched.lock().await;
        let before = touched.len();
        touched.retain(|_, entry| now - entry.touched_at < self.touch_interval);
        before - touched.len()
    }

    pub(crate) async fn cached_entries(&self) -> usize {
        self.touched.lock().await.len()
    }

    /// One watchdog pass. Returns how many devices went offline.
    pub async fn check_offline(&self, now: DateTime<Utc>) -> Result<usize> {
        let pruned = self.prune_touched(now).await;
        if pruned > 0 {
            tracing::trace!(pruned, "expired presence cache entries");
        }
        let cutoff = now - self.offline_after;
        let stale = self.store.stale_devices(cutoff).await?;
        let mut transitioned = 0;

        for device in stale {
            match self.store.set_device_offline(&device.device_id, cutoff).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(device = %device.device_id, error = %err, "failed to mark device offline");
                    continue;
                }
            }
            transitioned += 1;
            // Forget the throttle so the next message re-touches and reports the reconnect.
            self.touched.lock().await.remove(&device.device_id);

            let secs = self.offline_after.num_seconds();
            tracing::warn!(device = %device.device_id, last_seen = ?device.last_seen, "device offline");
            self.alarms
                .emit_now(AlarmRecord::new(
                    &device.device_id,
                    CODE_OFFLINE,
                    Severity::Warn,
                    format!("Device has not reported for more than {secs}s."),
                    json!({ "last_seen": device.last_seen, "offline_after_s": secs }),
                    now,
                ))
                .await;
        }

        Ok(transitioned)
    }

    pub fn spawn_watchdog(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.check_offline(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => tracing::info!(count, "devices marked offline"),
                            Err(err) => tracing::warn!(error = %err, "offline watchdog pass failed"),
                        }
                    }
                }
            }
            tracing::debug!("offline watchdog stopped");
        })
    }
}
