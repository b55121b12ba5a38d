use crate::telemetry::Snapshot;
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Alarm,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Alarm => "alarm",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Idle,
    Stopped,
    PrecheckWaitPressureSwitch,
    PrecheckSampleBaseline,
    Production,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        !matches!(self, EngineState::Idle | EngineState::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub code: &'static str,
    pub severity: Severity,
    pub title: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub code: &'static str,
    pub title: &'static str,
    pub detail: &'static str,
}

/// Reference values and timings used by one evaluation.
///
/// References that are absent or not positive are treated as unconfigured.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub ref_pint_work: Option<f64>,
    pub ref_qp: Option<f64>,
    pub ref_qr: Option<f64>,
    pub ref_qsum: Option<f64>,
    pub ref_ct: Option<f64>,
    pub precheck: ChronoDuration,
    pub stabilize: ChronoDuration,
    pub conductivity_ignore: ChronoDuration,
    pub persist: ChronoDuration,
    pub cond_high_pct: f64,
    pub pint_zero_threshold: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ref_pint_work: None,
            ref_qp: None,
            ref_qr: None,
            ref_qsum: None,
            ref_ct: None,
            precheck: ChronoDuration::seconds(30),
            stabilize: ChronoDuration::seconds(180),
            conductivity_ignore: ChronoDuration::seconds(60),
            persist: ChronoDuration::seconds(120),
            cond_high_pct: 20.0,
            pint_zero_threshold: 0.05,
        }
    }
}

/// The subset of a snapshot the engine reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LiveValues {
    pub pressure_switch: Option<bool>,
    pub pint: Option<f64>,
    pub qp: Option<f64>,
    pub qr: Option<f64>,
    pub ct: Option<f64>,
    pub pump_low: Option<bool>,
    pub pump_high: Option<bool>,
}

impl From<&Snapshot> for LiveValues {
    fn from(snapshot: &Snapshot) -> Self {
        let flag = |value: Option<f64>| value.filter(|v| v.is_finite()).map(|v| v != 0.0);
        let number = |value: Option<f64>| value.filter(|v| v.is_finite());
        Self {
            pressure_switch: flag(snapshot.presostat_low),
            pint: number(snapshot.pressure_inter),
            qp: number(snapshot.flow_perm),
            qr: number(snapshot.flow_reject),
            ct: number(snapshot.conductivity_perm),
            pump_low: flag(snapshot.pump_low),
            pump_high: flag(snapshot.pump_high),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProductionSignals {
    pub qsum: Option<f64>,
    pub qp_low: bool,
    pub qp_very_low: bool,
    pub qr_low: bool,
    pub qr_high: bool,
    pub qsum_low: bool,
    pub qsum_ok: bool,
    pub pint_high: bool,
    pub pint_low: bool,
    pub pint_ok: bool,
    pub ct_high: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineDebug {
    pub state: Option<EngineState>,
    pub live: LiveValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_in_production: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_stable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signals: Option<ProductionSignals>,
}

#[derive(Debug, Clone)]
pub struct EngineResult {
    pub severity: Severity,
    pub alarms: Vec<AlarmEvent>,
    pub recommendations: Vec<Recommendation>,
    pub debug: EngineDebug,
}

impl EngineResult {
    pub(crate) fn new(state: EngineState, live: LiveValues) -> Self {
        Self {
            severity: Severity::Info,
            alarms: Vec::new(),
            recommendations: Vec::new(),
            debug: EngineDebug {
                state: Some(state),
                live,
                ..EngineDebug::default()
            },
        }
    }

    pub(crate) fn push_alarm(&mut self, alarm: AlarmEvent) {
        self.severity = self.severity.max(alarm.severity);
        self.alarms.push(alarm);
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.alarms.iter().map(|alarm| alarm.code).collect()
    }
}
