mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::{build_pool, PgStore};

use crate::device::{ConfigUpdate, Device, DeviceConfig};
use crate::diagnosis::Severity;
use crate::telemetry::TelemetryRow;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRecord {
    pub device_id: String,
    pub code: String,
    pub severity: Severity,
    pub message: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

/// Device registry, configuration, alarm and telemetry storage.
#[async_trait]
pub trait Store: Send + Sync {
    async fn device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn device_config(&self, device_id: &str) -> Result<Option<DeviceConfig>>;

    async fn save_device_config(&self, device_id: &str, config: &DeviceConfig) -> Result<()>;

    /// Marks the device ONLINE at `seen_at` and returns the record as it was before.
    /// `None` means the device is not registered.
    async fn touch_device_seen(&self, device_id: &str, seen_at: DateTime<Utc>)
        -> Result<Option<Device>>;

    /// Devices not OFFLINE whose `last_seen` is before `cutoff`.
    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>>;

    /// Sets OFFLINE only if the device is still stale at `cutoff`. Returns whether it changed.
    async fn set_device_offline(&self, device_id: &str, cutoff: DateTime<Utc>) -> Result<bool>;

    async fn last_alarm_at(&self, device_id: &str, code: &str) -> Result<Option<DateTime<Utc>>>;

    async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()>;

    async fn insert_telemetry(&self, rows: &[TelemetryRow]) -> Result<u64>;
}

/// Applies a typed update to a device's stored config, starting from defaults when it has none.
/// The engine reads config on every evaluation, so the change takes effect on the next sample.
pub async fn update_device_config(
    store: &dyn Store,
    device_id: &str,
    update: &ConfigUpdate,
) -> Result<DeviceConfig> {
    if store.device(device_id).await?.is_none() {
        bail!("unknown device {device_id}");
    }
    let mut config = store.device_config(device_id).await?.unwrap_or_default();
    config.apply(update)?;
    store.save_device_config(device_id, &config).await?;
    tracing::info!(device = %device_id, "device config updated");
    Ok(config)
}
