mod engine;
mod latch;
mod rules;
mod sampler;
mod types;


pub use engine::DeviceContext;
pub use latch::PersistenceLatch;
pub use rules::FaultRule;
pub use sampler::{WindowSampler, WindowStats};
pub use types::{
    AlarmEvent, EngineDebug, EngineResult, EngineSettings, EngineState, LiveValues,
    ProductionSignals, Recommendation, Severity,
};

use crate::alarms::{AlarmSink, Emission};
use crate::store::{AlarmRecord, Store};
use crate::telemetry::Snapshot;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Alarm codes that are already edge-triggered by the engine and skip the cooldown.
const UNDEDUPLICATED_CODES: &[&str] = &["I_STOP"];

/// Owns every device's [`DeviceContext`]. Evaluations for one device are serialized on that
/// device's handle; different devices never wait on each other beyond the table lookup.
pub struct Diagnostics {
    store: Arc<dyn Store>,
    alarms: Arc<AlarmSink>,
    contexts: Mutex<HashMap<String, Arc<Mutex<DeviceContext>>>>,
}

impl Diagnostics {
    pub fn new(store: Arc<dyn Store>, alarms: Arc<AlarmSink>) -> Self {
        Self {
            store,
            alarms,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    async fn context(&self, device_id: &str) -> Arc<Mutex<DeviceContext>> {
        let mut contexts = self.contexts.lock().await;
        contexts
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceContext::new())))
            .clone()
    }

    pub async fn state_of(&self, device_id: &str) -> Option<EngineState> {
        let handle = self.contexts.lock().await.get(device_id).cloned()?;
        let state = handle.lock().await.state();
        Some(state)
    }

    pub async fn tracked_devices(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Runs one evaluation pass. Returns `None` when the device has no stored config.
    pub async fn run(
        &self,
        device_id: &str,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<Option<EngineResult>> {
        let Some(config) = self.store.device_config(device_id).await? else {
            tracing::debug!(device = %device_id, "no device config; skipping diagnosis");
            return Ok(None);
        };
        let settings = config.engine_settings();
        let live = LiveValues::from(snapshot);

        let handle = self.context(device_id).await;
        let mut context = handle.lock().await;
        let result = context.evaluate(live, &settings, now);
        tracing::trace!(device = %device_id, debug = ?result.debug, "diagnosis evaluated");

        if result.alarms.is_empty() {
            return Ok(Some(result));
        }

        let data = json!({ "debug": serde_json::to_value(&result.debug).unwrap_or(Value::Null) });
        for event in &result.alarms {
            let record = AlarmRecord::from_event(device_id, event, data.clone(), now);
            let emission = if UNDEDUPLICATED_CODES.contains(&event.code) {
                self.alarms.emit_now(record).await
            } else {
                self.alarms.emit(record).await
            };
            if emission == Emission::Emitted {
                tracing::debug!(device = %device_id, code = event.code, title = event.title, "diagnostic alarm");
            }
        }
        for rec in &result.recommendations {
            self.alarms
                .emit(AlarmRecord::from_recommendation(device_id, rec, now))
                .await;
        }
        drop(context);

        Ok(Some(result))
    }
}
