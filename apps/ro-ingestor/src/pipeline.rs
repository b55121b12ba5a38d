use crate::diagnosis::{Diagnostics, EngineResult};
use crate::store::Store;
use crate::telemetry::{Snapshot, SnapshotUpdate, TelemetryRow};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct IngestStats {
    pub buffered_rows: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub accepted_updates: AtomicU64,
    pub coalesced_updates: AtomicU64,
    pub dropped_messages: AtomicU64,
    pub dropped_rows: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: std::sync::Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            buffered_rows: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            accepted_updates: AtomicU64::new(0),
            coalesced_updates: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            dropped_rows: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: std::sync::Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_dropped_message(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub min_interval: ChronoDuration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_buffered_rows: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            min_interval: ChronoDuration::seconds(5),
            batch_size: 200,
            flush_interval: Duration::from_secs(2),
            max_buffered_rows: 2000,
        }
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// Merged into the snapshot only; the device wrote a row less than `min_interval` ago.
    Coalesced,
    Accepted { diagnosis: Option<EngineResult> },
}

#[derive(Default)]
struct WriterState {
    snapshots: HashMap<String, Snapshot>,
    last_write: HashMap<String, DateTime<Utc>>,
    batch: Vec<TelemetryRow>,
}

/// Per-device snapshots with a minimum interval between persisted rows.
///
/// Snapshots, write timestamps and the pending batch share one lock, held only for the merge or
/// append. Diagnosis and store I/O happen after it is released.
pub struct SnapshotWriter {
    store: Arc<dyn Store>,
    diagnostics: Arc<Diagnostics>,
    stats: Arc<IngestStats>,
    settings: WriterSettings,
    state: Mutex<WriterState>,
    batch_full: Notify,
}

impl SnapshotWriter {
    pub fn new(
        store: Arc<dyn Store>,
        diagnostics: Arc<Diagnostics>,
        stats: Arc<IngestStats>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            store,
            diagnostics,
            stats,
            settings,
            state: Mutex::new(WriterState::default()),
            batch_full: Notify::new(),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<Snapshot> {
        self.state.lock().await.snapshots.get(device_id).cloned()
    }

    pub async fn buffered_len(&self) -> usize {
        self.state.lock().await.batch.len()
    }

    pub async fn enqueue(
        &self,
        device_id: &str,
        update: &SnapshotUpdate,
        now: DateTime<Utc>,
    ) -> WriteOutcome {
        let (snapshot, batch_len) = {
            let mut state = self.state.lock().await;
            state
                .snapshots
                .entry(device_id.to_string())
                .or_default()
                .merge(update);

            let rate_limited = state
                .last_write
                .get(device_id)
                .is_some_and(|last| now - *last < self.settings.min_interval);
            if rate_limited {
                self.stats.coalesced_updates.fetch_add(1, Ordering::Relaxed);
                return WriteOutcome::Coalesced;
            }

            let snapshot = state
                .snapshots
                .get(device_id)
                .cloned()
                .unwrap_or_default();
            state.batch.push(TelemetryRow {
                ts: now,
                device_id: device_id.to_string(),
                snapshot: snapshot.clone(),
            });
            state.last_write.insert(device_id.to_string(), now);
            (snapshot, state.batch.len())
        };

        self.stats.accepted_updates.fetch_add(1, Ordering::Relaxed);
        self.stats
            .buffered_rows
            .store(batch_len as u64, Ordering::Relaxed);
        tracing::trace!(device = %device_id, batch_len, "telemetry row buffered");
        if batch_len >= self.settings.batch_size {
            self.batch_full.notify_one();
        }

        let diagnosis = match self.diagnostics.run(device_id, &snapshot, now).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(device = %device_id, error = %err, "diagnosis pass failed");
                None
            }
        };
        WriteOutcome::Accepted { diagnosis }
    }

    /// Persists everything buffered. On failure the rows go back to the front of the batch,
    /// trimmed to `max_buffered_rows` by dropping the oldest.
    pub async fn flush(&self) -> Result<usize> {
        let rows = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.batch)
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let len = rows.len();
        match self.store.insert_telemetry(&rows).await {
            Ok(inserted) => {
                if (inserted as usize) < len {
                    tracing::warn!(inserted, skipped = len - inserted as usize, "skipped telemetry rows");
                }
                let remaining = self.state.lock().await.batch.len();
                self.stats
                    .buffered_rows
                    .store(remaining as u64, Ordering::Relaxed);
                self.stats.last_batch_len.store(len as u64, Ordering::Relaxed);
                let now = Utc::now().timestamp_millis() as u64;
                self.stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
                let micros = started.elapsed().as_micros() as u64;
                let prev = self.stats.average_flush_micros.load(Ordering::Relaxed);
                let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
                self.stats.average_flush_micros.store(avg, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(len, micros, "flushed telemetry batch");
                Ok(len)
            }
            Err(err) => {
                self.stats.record_error(err.to_string());
                tracing::error!(error = %err, len, "failed to flush telemetry");
                let mut state = self.state.lock().await;
                let mut restored = rows;
                restored.append(&mut state.batch);
                let cap = self.settings.max_buffered_rows.max(1);
                if restored.len() > cap {
                    let excess = restored.len() - cap;
                    restored.drain(..excess);
                    self.stats
                        .dropped_rows
                        .fetch_add(excess as u64, Ordering::Relaxed);
                    tracing::warn!(dropped = excess, cap, "telemetry buffer full; dropped oldest rows");
                }
                state.batch = restored;
                self.stats
                    .buffered_rows
                    .store(state.batch.len() as u64, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Background flush loop. Flushes on every tick and whenever the batch fills. The loop
    /// runs until [`FlusherHandle::shutdown`], which drains once more.
    pub fn spawn_flusher(self: Arc<Self>) -> FlusherHandle {
        let cancel = CancellationToken::new();
        let handle = self.run_flusher(cancel.clone());
        FlusherHandle { cancel, handle }
    }

    fn run_flusher(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        match self.flush().await {
                            Ok(len) => tracing::info!(len, "drained telemetry buffer on shutdown"),
                            Err(err) => tracing::error!(error = %err, "flush during shutdown failed"),
                        }
                        break;
                    }
                    _ = self.batch_full.notified() => {
                        if let Err(err) = self.flush().await {
                            tracing::warn!(error = %err, "flush on batch size failed");
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.flush().await {
                            tracing::warn!(error = %err, "flush on interval failed");
                        }
                    }
                }
            }
        })
    }
}

/// Owns the flusher task. Keep it alive until every producer has stopped calling
/// [`SnapshotWriter::enqueue`]; rows buffered after `shutdown` are not persisted.
pub struct FlusherHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlusherHandle {
    pub async fn shutdown(self) -> std::result::Result<(), JoinError> {
        self.cancel.cancel();
        self.handle.await
    }
}
