use super::{AlarmRecord, Store};
use crate::device::{Device, DeviceConfig, DeviceStatus};
use crate::telemetry::TelemetryRow;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    devices: HashMap<String, Device>,
    configs: HashMap<String, DeviceConfig>,
    alarms: Vec<AlarmRecord>,
    telemetry: Vec<TelemetryRow>,
}

/// In-process store for unit tests; insert failures can be switched on.
#[derive(Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    fail_telemetry: AtomicBool,
    fail_alarms: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_device(&self, tenant: &str, device_id: &str, config: Option<DeviceConfig>) {
        let mut tables = self.tables.lock().unwrap();
        tables.devices.insert(
            device_id.to_string(),
            Device {
                device_id: device_id.to_string(),
                tenant_id: 1,
                status: DeviceStatus::Pending,
                last_seen: None,
                topic_prefix: format!("plant/{tenant}/{device_id}"),
            },
        );
        if let Some(config) = config {
            tables.configs.insert(device_id.to_string(), config);
        }
    }

    pub(crate) fn set_last_seen(&self, device_id: &str, status: DeviceStatus, last_seen: DateTime<Utc>) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(device) = tables.devices.get_mut(device_id) {
            device.status = status;
            device.last_seen = Some(last_seen);
        }
    }

    pub(crate) fn fail_telemetry(&self, fail: bool) {
        self.fail_telemetry.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_alarms(&self, fail: bool) {
        self.fail_alarms.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn alarms(&self) -> Vec<AlarmRecord> {
        self.tables.lock().unwrap().alarms.clone()
    }

    pub(crate) fn alarm_codes(&self, device_id: &str) -> Vec<String> {
        self.alarms()
            .into_iter()
            .filter(|alarm| alarm.device_id == device_id)
            .map(|alarm| alarm.code)
            .collect()
    }

    pub(crate) fn telemetry(&self) -> Vec<TelemetryRow> {
        self.tables.lock().unwrap().telemetry.clone()
    }

    pub(crate) fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.tables.lock().unwrap().devices.get(device_id).map(|d| d.status)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.tables.lock().unwrap().devices.get(device_id).cloned())
    }

    async fn device_config(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        Ok(self.tables.lock().unwrap().configs.get(device_id).cloned())
    }

    async fn save_device_config(&self, device_id: &str, config: &DeviceConfig) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .configs
            .insert(device_id.to_string(), config.clone());
        Ok(())
    }

    async fn touch_device_seen(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<Option<Device>> {
        let mut tables = self.tables.lock().unwrap();
        let Some(device) = tables.devices.get_mut(device_id) else {
            return Ok(None);
        };
        let previous = device.clone();
        device.status = DeviceStatus::Online;
        device.last_seen = Some(previous.last_seen.map_or(seen_at, |prev| prev.max(seen_at)));
        Ok(Some(previous))
    }

    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let tables = self.tables.lock().unwrap();
        let mut stale: Vec<Device> = tables
            .devices
            .values()
            .filter(|d| d.status != DeviceStatus::Offline)
            .filter(|d| d.last_seen.is_some_and(|seen| seen < cutoff))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(stale)
    }

    async fn set_device_offline(&self, device_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let Some(device) = tables.devices.get_mut(device_id) else {
            return Ok(false);
        };
        if device.status == DeviceStatus::Offline || !device.last_seen.is_some_and(|seen| seen < cutoff) {
            return Ok(false);
        }
        device.status = DeviceStatus::Offline;
        Ok(true)
    }

    async fn last_alarm_at(&self, device_id: &str, code: &str) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .alarms
            .iter()
            .filter(|a| a.device_id == device_id && a.code == code)
            .map(|a| a.ts)
            .max())
    }

    async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()> {
        if self.fail_alarms.load(Ordering::SeqCst) {
            bail!("alarm store unavailable");
        }
        self.tables.lock().unwrap().alarms.push(alarm.clone());
        Ok(())
    }

    async fn insert_telemetry(&self, rows: &[TelemetryRow]) -> Result<u64> {
        if self.fail_telemetry.load(Ordering::SeqCst) {
            bail!("telemetry store unavailable");
        }
        self.tables.lock().unwrap().telemetry.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}
