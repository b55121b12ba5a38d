use super::latch::PersistenceLatch;
use super::rules::{production_signals, FaultRule};
use super::sampler::WindowSampler;
use super::types::{AlarmEvent, EngineResult, EngineSettings, EngineState, LiveValues, Severity};
use chrono::{DateTime, Utc};

/// Per-device diagnostic state. Owned by exactly one device and only mutated through
/// [`super::Diagnostics`], which serializes evaluations per device.
#[derive(Debug)]
pub struct DeviceContext {
    state: EngineState,
    cycle_started_at: Option<DateTime<Utc>>,
    production_since: Option<DateTime<Utc>>,
    baseline_started_at: Option<DateTime<Utc>>,
    baseline_sampler: Option<WindowSampler>,
    baseline: Option<f64>,
    latches: [PersistenceLatch; 6],
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContext {
    pub fn new() -> Self {
        Self {
            state: EngineState::Idle,
            cycle_started_at: None,
            production_since: None,
            baseline_started_at: None,
            baseline_sampler: None,
            baseline: None,
            latches: Default::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn production_since(&self) -> Option<DateTime<Utc>> {
        self.production_since
    }

    fn reset_latches(&mut self) {
        for latch in &mut self.latches {
            latch.reset();
        }
    }

    fn stop(&mut self) {
        self.state = EngineState::Stopped;
        self.cycle_started_at = None;
        self.production_since = None;
        self.baseline_started_at = None;
        self.baseline_sampler = None;
        self.reset_latches();
    }

    pub fn evaluate(
        &mut self,
        live: LiveValues,
        settings: &EngineSettings,
        now: DateTime<Utc>,
    ) -> EngineResult {
        let mut result = EngineResult::new(self.state, live);
        self.step(&live, settings, now, &mut result);
        result.debug.state = Some(self.state);
        result.debug.baseline = self.baseline;
        result
    }

    fn step(
        &mut self,
        live: &LiveValues,
        settings: &EngineSettings,
        now: DateTime<Utc>,
        result: &mut EngineResult,
    ) {
        // Zero conductivity means the unit is not producing.
        if live.ct == Some(0.0) {
            if self.state.is_running() {
                self.stop();
                result.push_alarm(AlarmEvent {
                    code: "I_STOP",
                    severity: Severity::Info,
                    title: "Stop detected",
                    detail: "Conductivity = 0: unit stopped or out of water.".to_string(),
                });
            }
            self.state = EngineState::Stopped;
            return;
        }

        if !self.state.is_running() {
            if live.ct.is_none() {
                return;
            }
            self.state = EngineState::PrecheckWaitPressureSwitch;
            self.cycle_started_at = Some(now);
            self.baseline_sampler = Some(WindowSampler::new(settings.precheck));
            tracing::debug!(%now, "precheck cycle started");
        }

        if self.state == EngineState::PrecheckWaitPressureSwitch {
            if live.pressure_switch == Some(true) {
                self.state = EngineState::PrecheckSampleBaseline;
                self.baseline_started_at = Some(now);
            } else {
                let started = self.cycle_started_at.unwrap_or(now);
                if now - started >= settings.precheck {
                    result.push_alarm(AlarmEvent {
                        code: "E02",
                        severity: Severity::Alarm,
                        title: "No inlet pressure (pressure switch open)",
                        detail: "The inlet pressure switch did not close within the precheck window."
                            .to_string(),
                    });
                    self.stop();
                }
                return;
            }
        }

        if self.state == EngineState::PrecheckSampleBaseline {
            let sampler = self
                .baseline_sampler
                .get_or_insert_with(|| WindowSampler::new(settings.precheck));
            let pumps_idle = live.pump_low != Some(false) && live.pump_high != Some(true);
            if pumps_idle {
                sampler.add(now, live.pint);
            }
            // Also closes once `precheck` has elapsed since entering this state, samples or not.
            let started = *self.baseline_started_at.get_or_insert(now);
            if !sampler.done(now) && now - started < settings.precheck {
                return;
            }

            let stats = sampler.stats();
            self.baseline = stats.avg;
            match stats.avg {
                Some(avg) if avg > settings.pint_zero_threshold => {
                    if let Some(reference) = settings.ref_pint_work {
                        if avg < reference * 0.95 {
                            result.push_alarm(AlarmEvent {
                                code: "W10",
                                severity: Severity::Warn,
                                title: "Prefilters fouling (low baseline pressure)",
                                detail: format!(
                                    "Baseline avg={avg:.3} < 95% of reference pressure {reference:.3}."
                                ),
                            });
                        }
                    }
                }
                avg => {
                    result.push_alarm(AlarmEvent {
                        code: "E01",
                        severity: Severity::Alarm,
                        title: "No water in cistern or low pump not delivering",
                        detail: format!(
                            "Baseline avg={}. Threshold={}.",
                            avg.map(|v| format!("{v:.3}")).unwrap_or_else(|| "none".to_string()),
                            settings.pint_zero_threshold
                        ),
                    });
                    self.stop();
                    return;
                }
            }

            self.state = EngineState::Production;
            self.production_since = Some(now);
            self.baseline_started_at = None;
            self.baseline_sampler = None;
            self.reset_latches();
            tracing::debug!(baseline = ?self.baseline, "entered production");
        }

        if self.state == EngineState::Production {
            self.evaluate_production(live, settings, now, result);
        }
    }

    fn evaluate_production(
        &mut self,
        live: &LiveValues,
        settings: &EngineSettings,
        now: DateTime<Utc>,
        result: &mut EngineResult,
    ) {
        let in_production = now - self.production_since.unwrap_or(now);
        let ct_valid = in_production >= settings.conductivity_ignore;
        let signals = production_signals(live, settings, ct_valid);

        for rule in FaultRule::ALL {
            let condition = rule.matches(&signals, live, settings);
            if self.latches[rule.index()].hit(condition, now, settings.persist) {
                result.push_alarm(rule.alarm());
                result.recommendations.push(rule.recommendation());
            }
        }

        result.debug.seconds_in_production = Some(in_production.num_milliseconds() as f64 / 1000.0);
        result.debug.ct_valid = Some(ct_valid);
        result.debug.pressure_stable = Some(in_production >= settings.stabilize);
        result.debug.signals = Some(signals);
    }
}
