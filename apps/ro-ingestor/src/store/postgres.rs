use super::{AlarmRecord, Store};
use crate::device::{Device, DeviceConfig, DeviceStatus};
use crate::telemetry::TelemetryRow;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// 14 binds per row keeps a chunk well under the Postgres parameter limit.
pub(crate) const TELEMETRY_CHUNK: usize = 1000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type DeviceTuple = (String, i64, String, Option<DateTime<Utc>>, String);

fn device_from_tuple(row: DeviceTuple) -> Result<Device> {
    let (device_id, tenant_id, status, last_seen, topic_prefix) = row;
    let status: DeviceStatus = status
        .parse()
        .with_context(|| format!("device {device_id} has an unreadable status"))?;
    Ok(Device {
        device_id,
        tenant_id,
        status,
        last_seen,
        topic_prefix,
    })
}

fn config_from_row(row: &PgRow) -> Result<DeviceConfig> {
    Ok(DeviceConfig {
        flow_perm_nom: row.try_get("flow_perm_nom")?,
        flow_perm_min: row.try_get("flow_perm_min")?,
        flow_perm_max: row.try_get("flow_perm_max")?,
        flow_rej_nom: row.try_get("flow_rej_nom")?,
        flow_rej_min: row.try_get("flow_rej_min")?,
        flow_rej_max: row.try_get("flow_rej_max")?,
        p_inter_nom: row.try_get("p_inter_nom")?,
        p_inter_min: row.try_get("p_inter_min")?,
        p_inter_max: row.try_get("p_inter_max")?,
        cond_perm_nom: row.try_get("cond_perm_nom")?,
        cond_perm_max: row.try_get("cond_perm_max")?,
        cond_high_pct: row.try_get("cond_high_pct")?,
        cond_ignore_minutes: row.try_get::<i32, _>("cond_ignore_minutes")? as i64,
        stabilize_pressure_s: row.try_get::<i32, _>("stabilize_pressure_s")? as i64,
        start_wait_presostat_s: row.try_get::<i32, _>("start_wait_presostat_s")? as i64,
        persist_s: row.try_get::<i32, _>("persist_s")? as i64,
        p_transducer_threshold: row.try_get("p_transducer_threshold")?,
    })
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(0, i64::from(i32::MAX)) as i32
}

#[async_trait]
impl Store for PgStore {
    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let row: Option<DeviceTuple> = sqlx::query_as(
            r#"
            SELECT device_id, tenant_id, status, last_seen, topic_prefix
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(device_from_tuple).transpose()
    }

    async fn device_config(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        let row = sqlx::query(
            r#"
            SELECT flow_perm_nom, flow_perm_min, flow_perm_max,
                   flow_rej_nom, flow_rej_min, flow_rej_max,
                   p_inter_nom, p_inter_min, p_inter_max,
                   cond_perm_nom, cond_perm_max, cond_high_pct,
                   cond_ignore_minutes, stabilize_pressure_s, start_wait_presostat_s,
                   persist_s, p_transducer_threshold
            FROM device_configs
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn save_device_config(&self, device_id: &str, config: &DeviceConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_configs (
                device_id,
                flow_perm_nom, flow_perm_min, flow_perm_max,
                flow_rej_nom, flow_rej_min, flow_rej_max,
                p_inter_nom, p_inter_min, p_inter_max,
                cond_perm_nom, cond_perm_max, cond_high_pct,
                cond_ignore_minutes, stabilize_pressure_s, start_wait_presostat_s,
                persist_s, p_transducer_threshold
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (device_id) DO UPDATE
            SET flow_perm_nom = EXCLUDED.flow_perm_nom,
                flow_perm_min = EXCLUDED.flow_perm_min,
                flow_perm_max = EXCLUDED.flow_perm_max,
                flow_rej_nom = EXCLUDED.flow_rej_nom,
                flow_rej_min = EXCLUDED.flow_rej_min,
                flow_rej_max = EXCLUDED.flow_rej_max,
                p_inter_nom = EXCLUDED.p_inter_nom,
                p_inter_min = EXCLUDED.p_inter_min,
                p_inter_max = EXCLUDED.p_inter_max,
                cond_perm_nom = EXCLUDED.cond_perm_nom,
                cond_perm_max = EXCLUDED.cond_perm_max,
                cond_high_pct = EXCLUDED.cond_high_pct,
                cond_ignore_minutes = EXCLUDED.cond_ignore_minutes,
                stabilize_pressure_s = EXCLUDED.stabilize_pressure_s,
                start_wait_presostat_s = EXCLUDED.start_wait_presostat_s,
                persist_s = EXCLUDED.persist_s,
                p_transducer_threshold = EXCLUDED.p_transducer_threshold
            "#,
        )
        .bind(device_id)
        .bind(config.flow_perm_nom)
        .bind(config.flow_perm_min)
        .bind(config.flow_perm_max)
        .bind(config.flow_rej_nom)
        .bind(config.flow_rej_min)
        .bind(config.flow_rej_max)
        .bind(config.p_inter_nom)
        .bind(config.p_inter_min)
        .bind(config.p_inter_max)
        .bind(config.cond_perm_nom)
        .bind(config.cond_perm_max)
        .bind(config.cond_high_pct)
        .bind(clamp_i32(config.cond_ignore_minutes))
        .bind(clamp_i32(config.stabilize_pressure_s))
        .bind(clamp_i32(config.start_wait_presostat_s))
        .bind(clamp_i32(config.persist_s))
        .bind(config.p_transducer_threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_device_seen(
        &self,
        device_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Device>> {
        let row: Option<DeviceTuple> = sqlx::query_as(
            r#"
            WITH prev AS (
                SELECT device_id, tenant_id, status, last_seen, topic_prefix
                FROM devices
                WHERE device_id = $1
                FOR UPDATE
            )
            UPDATE devices d
            SET last_seen = GREATEST(COALESCE(d.last_seen, $2), $2),
                status = 'ONLINE'
            FROM prev
            WHERE d.device_id = prev.device_id
            RETURNING prev.device_id, prev.tenant_id, prev.status, prev.last_seen, prev.topic_prefix
            "#,
        )
        .bind(device_id)
        .bind(seen_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(device_from_tuple).transpose()
    }

    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let rows: Vec<DeviceTuple> = sqlx::query_as(
            r#"
            SELECT device_id, tenant_id, status, last_seen, topic_prefix
            FROM devices
            WHERE status <> 'OFFLINE'
              AND last_seen IS NOT NULL
              AND last_seen < $1
            ORDER BY last_seen
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(device_from_tuple).collect()
    }

    async fn set_device_offline(&self, device_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = 'OFFLINE'
            WHERE device_id = $1
              AND status <> 'OFFLINE'
              AND last_seen < $2
            "#,
        )
        .bind(device_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn last_alarm_at(&self, device_id: &str, code: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            SELECT MAX(ts)
            FROM alarms
            WHERE device_id = $1 AND code = $2
            "#,
        )
        .bind(device_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(ts,)| ts))
    }

    async fn insert_alarm(&self, alarm: &AlarmRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alarms (ts, device_id, code, severity, message, data_json)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(alarm.ts)
        .bind(&alarm.device_id)
        .bind(&alarm.code)
        .bind(alarm.severity.as_str())
        .bind(&alarm.message)
        .bind(SqlJson(&alarm.data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_telemetry(&self, rows: &[TelemetryRow]) -> Result<u64> {
        // All chunks commit together or not at all.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in rows.chunks(TELEMETRY_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO telemetry (ts, device_id, presostat_low, pressure_inter, flow_perm, \
                 flow_reject, conductivity_perm, pressure_feed, temperature_feed, float_call, \
                 valve_feed, pump_low, pump_high, mode) ",
            );
            builder.push_values(chunk.iter(), |mut b, row| {
                let s = &row.snapshot;
                b.push_bind(row.ts)
                    .push_bind(&row.device_id)
                    .push_bind(s.presostat_low)
                    .push_bind(s.pressure_inter)
                    .push_bind(s.flow_perm)
                    .push_bind(s.flow_reject)
                    .push_bind(s.conductivity_perm)
                    .push_bind(s.pressure_feed)
                    .push_bind(s.temperature_feed)
                    .push_bind(s.float_call)
                    .push_bind(s.valve_feed)
                    .push_bind(s.pump_low)
                    .push_bind(s.pump_high)
                    .push_bind(s.mode.as_deref());
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}
