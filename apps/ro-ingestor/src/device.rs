use crate::diagnosis::EngineSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Pending,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "PENDING",
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DeviceStatus::Pending),
            // Older registries wrote ACTIVE for a device that had reported once.
            "ONLINE" | "ACTIVE" => Ok(DeviceStatus::Online),
            "OFFLINE" => Ok(DeviceStatus::Offline),
            other => Err(ConfigError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    pub tenant_id: i64,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub topic_prefix: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be >= 0 (got {value})")]
    Negative { field: &'static str, value: f64 },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("unknown device status {0:?}")]
    UnknownStatus(String),
    #[error("invalid config update: {0}")]
    Malformed(String),
}

/// Per-device reference values and timings. Zero references mean "not configured".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub flow_perm_nom: f64,
    pub flow_perm_min: f64,
    pub flow_perm_max: f64,
    pub flow_rej_nom: f64,
    pub flow_rej_min: f64,
    pub flow_rej_max: f64,
    pub p_inter_nom: f64,
    pub p_inter_min: f64,
    pub p_inter_max: f64,
    pub cond_perm_nom: f64,
    pub cond_perm_max: f64,
    pub cond_high_pct: f64,
    pub cond_ignore_minutes: i64,
    pub stabilize_pressure_s: i64,
    pub start_wait_presostat_s: i64,
    pub persist_s: i64,
    pub p_transducer_threshold: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            flow_perm_nom: 0.0,
            flow_perm_min: 0.0,
            flow_perm_max: 0.0,
            flow_rej_nom: 0.0,
            flow_rej_min: 0.0,
            flow_rej_max: 0.0,
            p_inter_nom: 0.0,
            p_inter_min: 0.0,
            p_inter_max: 0.0,
            cond_perm_nom: 0.0,
            cond_perm_max: 0.0,
            cond_high_pct: 20.0,
            cond_ignore_minutes: 1,
            stabilize_pressure_s: 180,
            start_wait_presostat_s: 30,
            persist_s: 120,
            p_transducer_threshold: 0.05,
        }
    }
}

fn positive(value: f64) -> Option<f64> {
    Some(value).filter(|v| v.is_finite() && *v > 0.0)
}

impl DeviceConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        let ref_qp = positive(self.flow_perm_nom);
        let ref_qr = positive(self.flow_rej_nom);
        let ref_qsum = positive(ref_qp.unwrap_or(0.0) + ref_qr.unwrap_or(0.0));
        EngineSettings {
            ref_pint_work: positive(self.p_inter_nom),
            ref_qp,
            ref_qr,
            ref_qsum,
            ref_ct: positive(self.cond_perm_nom),
            precheck: ChronoDuration::seconds(self.start_wait_presostat_s.max(0)),
            stabilize: ChronoDuration::seconds(self.stabilize_pressure_s.max(0)),
            conductivity_ignore: ChronoDuration::seconds(self.cond_ignore_minutes.max(0) * 60),
            persist: ChronoDuration::seconds(self.persist_s.max(0)),
            cond_high_pct: self.cond_high_pct.max(0.0),
            pint_zero_threshold: self.p_transducer_threshold.max(0.0),
        }
    }

    pub fn apply(&mut self, update: &ConfigUpdate) -> Result<(), ConfigError> {
        update.validate()?;
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = update.$field {
                    self.$field = value;
                })*
            };
        }
        merge!(
            flow_perm_nom,
            flow_perm_min,
            flow_perm_max,
            flow_rej_nom,
            flow_rej_min,
            flow_rej_max,
            p_inter_nom,
            p_inter_min,
            p_inter_max,
            cond_perm_nom,
            cond_perm_max,
            cond_high_pct,
            cond_ignore_minutes,
            stabilize_pressure_s,
            start_wait_presostat_s,
            persist_s,
            p_transducer_threshold,
        );
        Ok(())
    }
}

/// Partial config change. Unknown keys are rejected at parse time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub flow_perm_nom: Option<f64>,
    pub flow_perm_min: Option<f64>,
    pub flow_perm_max: Option<f64>,
    pub flow_rej_nom: Option<f64>,
    pub flow_rej_min: Option<f64>,
    pub flow_rej_max: Option<f64>,
    pub p_inter_nom: Option<f64>,
    pub p_inter_min: Option<f64>,
    pub p_inter_max: Option<f64>,
    pub cond_perm_nom: Option<f64>,
    pub cond_perm_max: Option<f64>,
    pub cond_high_pct: Option<f64>,
    pub cond_ignore_minutes: Option<i64>,
    pub stabilize_pressure_s: Option<i64>,
    pub start_wait_presostat_s: Option<i64>,
    pub persist_s: Option<i64>,
    pub p_transducer_threshold: Option<f64>,
}

impl ConfigUpdate {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut bytes = raw.to_vec();
        simd_json::serde::from_slice(&mut bytes).map_err(|err| ConfigError::Malformed(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let floats = [
            ("flow_perm_nom", self.flow_perm_nom),
            ("flow_perm_min", self.flow_perm_min),
            ("flow_perm_max", self.flow_perm_max),
            ("flow_rej_nom", self.flow_rej_nom),
            ("flow_rej_min", self.flow_rej_min),
            ("flow_rej_max", self.flow_rej_max),
            ("p_inter_nom", self.p_inter_nom),
            ("p_inter_min", self.p_inter_min),
            ("p_inter_max", self.p_inter_max),
            ("cond_perm_nom", self.cond_perm_nom),
            ("cond_perm_max", self.cond_perm_max),
            ("cond_high_pct", self.cond_high_pct),
            ("p_transducer_threshold", self.p_transducer_threshold),
        ];
        for (field, value) in floats {
            let Some(value) = value else { continue };
            if !value.is_finite() {
                return Err(ConfigError::NotFinite { field });
            }
            if value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }
        let ints = [
            ("cond_ignore_minutes", self.cond_ignore_minutes),
            ("stabilize_pressure_s", self.stabilize_pressure_s),
            ("start_wait_presostat_s", self.start_wait_presostat_s),
            ("persist_s", self.persist_s),
        ];
        for (field, value) in ints {
            if let Some(value) = value.filter(|v| *v < 0) {
                return Err(ConfigError::Negative {
                    field,
                    value: value as f64,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_rejects_unknown_keys() {
        let err = ConfigUpdate::from_json(br#"{"flow_perm_nom": 500, "owner": "x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn update_merges_known_fields_only() {
        let update = ConfigUpdate::from_json(br#"{"flow_perm_nom": 500, "persist_s": 60}"#).unwrap();
        let mut config = DeviceConfig::default();
        config.apply(&update).unwrap();
        assert_eq!(config.flow_perm_nom, 500.0);
        assert_eq!(config.persist_s, 60);
        assert_eq!(config.cond_high_pct, 20.0);
    }

    #[test]
    fn update_rejects_negative_values_without_partial_apply() {
        let update = ConfigUpdate {
            flow_perm_nom: Some(400.0),
            stabilize_pressure_s: Some(-5),
            ..ConfigUpdate::default()
        };
        let mut config = DeviceConfig::default();
        let err = config.apply(&update).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Negative {
                field: "stabilize_pressure_s",
                value: -5.0
            }
        );
        assert_eq!(config.flow_perm_nom, 0.0);
    }

    #[test]
    fn engine_settings_treat_zero_references_as_unset() {
        let config = DeviceConfig {
            flow_perm_nom: 500.0,
            p_inter_nom: 2.0,
            cond_ignore_minutes: 2,
            ..DeviceConfig::default()
        };
        let settings = config.engine_settings();
        assert_eq!(settings.ref_qp, Some(500.0));
        assert_eq!(settings.ref_qr, None);
        assert_eq!(settings.ref_qsum, Some(500.0));
        assert_eq!(settings.ref_ct, None);
        assert_eq!(settings.conductivity_ignore, ChronoDuration::seconds(120));
        assert_eq!(settings.precheck, ChronoDuration::seconds(30));
    }

    #[test]
    fn status_parses_legacy_active() {
        assert_eq!("active".parse::<DeviceStatus>().unwrap(), DeviceStatus::Online);
        assert!("gone".parse::<DeviceStatus>().is_err());
    }
}
