use super::types::{AlarmEvent, EngineSettings, LiveValues, ProductionSignals, Recommendation, Severity};

/// Near-zero permeate flow accepted as "no production" when no reference is set.
const QP_ZERO: f64 = 0.05;
/// Conductivity at or below this reads as "practically none".
const CT_NEAR_ZERO: f64 = 1.0;

pub(crate) fn production_signals(
    live: &LiveValues,
    settings: &EngineSettings,
    ct_valid: bool,
) -> ProductionSignals {
    let below = |value: Option<f64>, reference: Option<f64>, pct: f64| match (value, reference) {
        (Some(v), Some(r)) => v < r * pct,
        _ => false,
    };
    let above = |value: Option<f64>, reference: Option<f64>, pct: f64| match (value, reference) {
        (Some(v), Some(r)) => v > r * pct,
        _ => false,
    };

    let qsum = match (live.qp, live.qr) {
        (Some(qp), Some(qr)) => Some(qp + qr),
        _ => None,
    };
    let pint_ok = match (live.pint, settings.ref_pint_work) {
        (Some(p), Some(r)) => p >= r * 0.90 && p <= r * 1.07,
        _ => false,
    };
    let ct_high = ct_valid
        && match (live.ct, settings.ref_ct) {
            (Some(ct), Some(r)) => ct > r * (1.0 + settings.cond_high_pct / 100.0),
            _ => false,
        };

    ProductionSignals {
        qsum,
        qp_low: below(live.qp, settings.ref_qp, 0.90),
        qp_very_low: below(live.qp, settings.ref_qp, 0.10),
        qr_low: below(live.qr, settings.ref_qr, 0.70),
        qr_high: above(live.qr, settings.ref_qr, 1.20),
        qsum_low: below(qsum, settings.ref_qsum, 0.90),
        qsum_ok: match (qsum, settings.ref_qsum) {
            (Some(q), Some(r)) => q >= r * 0.95,
            _ => false,
        },
        pint_high: above(live.pint, settings.ref_pint_work, 1.07),
        pint_low: below(live.pint, settings.ref_pint_work, 0.70),
        pint_ok,
        ct_high,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRule {
    FlushBypass,
    OringMembrane,
    AirIngress,
    RejectObstruction,
    MembraneFouling,
    ConductivityDrift,
}

impl FaultRule {
    pub const ALL: [FaultRule; 6] = [
        FaultRule::FlushBypass,
        FaultRule::OringMembrane,
        FaultRule::AirIngress,
        FaultRule::RejectObstruction,
        FaultRule::MembraneFouling,
        FaultRule::ConductivityDrift,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> &'static str {
        match self {
            FaultRule::FlushBypass => "A_FLUSH_BYPASS",
            FaultRule::OringMembrane => "B_ORING_MEM",
            FaultRule::AirIngress => "C_AIRE_AGUA",
            FaultRule::RejectObstruction => "D_RECH_OBS",
            FaultRule::MembraneFouling => "E_MEM_OBS",
            FaultRule::ConductivityDrift => "F_CT_HIGH",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            FaultRule::OringMembrane => Severity::Alarm,
            _ => Severity::Warn,
        }
    }

    pub fn matches(self, s: &ProductionSignals, live: &LiveValues, settings: &EngineSettings) -> bool {
        let qp = live.qp;
        let qr = live.qr;
        // Reject flowing at all counts as "high" when there is no reference to compare against.
        let reject_high_or_unreferenced =
            s.qr_high || (settings.ref_qr.is_none() && qr.is_some_and(|v| v > 0.0));
        let reject_at_or_below_ref = s.qr_low
            || matches!((qr, settings.ref_qr), (Some(v), Some(r)) if v <= r);
        let permeate_above = |pct: f64| matches!((qp, settings.ref_qp), (Some(v), Some(r)) if v > r * pct);

        match self {
            FaultRule::FlushBypass => {
                reject_high_or_unreferenced
                    && (s.qp_very_low || qp.is_some_and(|v| v <= QP_ZERO))
                    && live.ct.is_some_and(|ct| ct <= CT_NEAR_ZERO)
            }
            FaultRule::OringMembrane => s.ct_high && permeate_above(1.05) && reject_at_or_below_ref,
            FaultRule::AirIngress => {
                s.pint_low && reject_high_or_unreferenced && (s.qp_low || s.qp_very_low)
            }
            FaultRule::RejectObstruction => {
                s.pint_high
                    && (s.qr_low
                        || matches!((qr, settings.ref_qr), (Some(v), Some(r)) if v < r * 0.60))
                    && permeate_above(1.05)
            }
            FaultRule::MembraneFouling => {
                s.pint_high
                    && reject_at_or_below_ref
                    && matches!((qp, settings.ref_qp), (Some(v), Some(r)) if v <= r)
            }
            FaultRule::ConductivityDrift => s.ct_high && s.pint_ok && !s.qsum_low && s.qsum_ok,
        }
    }

    pub fn alarm(self) -> AlarmEvent {
        let (title, detail) = match self {
            FaultRule::FlushBypass => (
                "Flush open / bypass (possible broken flush valve or miscalibrated needle valve)",
                "High reject flow, very low permeate flow and near-zero conductivity.",
            ),
            FaultRule::OringMembrane => (
                "High conductivity with high permeate flow (possible O-ring/membrane damage)",
                "High permeate flow, normal or low reject flow and conductivity above the limit.",
            ),
            FaultRule::AirIngress => (
                "Low pressure with abnormal flows (possible air ingress / insufficient feed water)",
                "Low inter-membrane pressure, high reject flow and low permeate flow.",
            ),
            FaultRule::RejectObstruction => (
                "High pressure with low reject flow (possible reject-line obstruction / needle valve too closed)",
                "High inter-membrane pressure, low reject flow and high permeate flow.",
            ),
            FaultRule::MembraneFouling => (
                "High pressure with contained flows (possible membrane fouling/scaling)",
                "High inter-membrane pressure with normal or low permeate and reject flows.",
            ),
            FaultRule::ConductivityDrift => (
                "High conductivity under normal operation (progressive degradation)",
                "Pressure and flows in range but conductivity exceeds the configured limit.",
            ),
        };
        AlarmEvent {
            code: self.code(),
            severity: self.severity(),
            title,
            detail: detail.to_string(),
        }
    }

    pub fn recommendation(self) -> Recommendation {
        let (code, title, detail) = match self {
            FaultRule::FlushBypass => (
                "A_REC",
                "Check flush valve and restrictor",
                "Inspect the flush valve, check valve state and reject needle/restrictor calibration.",
            ),
            FaultRule::OringMembrane => (
                "B_REC",
                "Inspect membrane and O-ring integrity",
                "Inspect O-rings, membrane housing and membrane for damage or internal bypass.",
            ),
            FaultRule::AirIngress => (
                "C_REC",
                "Purge and verify feed supply",
                "Check suction, air ingress points, tank/cistern level and purge the system.",
            ),
            FaultRule::RejectObstruction => (
                "D_REC",
                "Inspect reject line and needle valve",
                "Check restrictor/needle, valve and reject hose for blockages.",
            ),
            FaultRule::MembraneFouling => (
                "E_REC",
                "Evaluate chemical cleaning / replacement",
                "Review SDI and prefiltration; consider CIP or membrane replacement based on history.",
            ),
            FaultRule::ConductivityDrift => (
                "F_REC",
                "Monitor trend and schedule maintenance",
                "Compare against history and baseline; consider flushing and membrane inspection.",
            ),
        };
        Recommendation {
            code,
            title,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EngineSettings {
        EngineSettings {
            ref_pint_work: Some(2.0),
            ref_qp: Some(500.0),
            ref_qr: Some(200.0),
            ref_qsum: Some(700.0),
            ref_ct: Some(100.0),
            ..EngineSettings::default()
        }
    }

    fn live(pint: f64, qp: f64, qr: f64, ct: f64) -> LiveValues {
        LiveValues {
            pressure_switch: Some(true),
            pint: Some(pint),
            qp: Some(qp),
            qr: Some(qr),
            ct: Some(ct),
            pump_low: None,
            pump_high: None,
        }
    }

    #[test]
    fn band_edges_follow_reference_percentages() {
        let cfg = settings();
        let s = production_signals(&live(2.14, 449.0, 139.0, 121.0), &cfg, true);
        assert!(s.qp_low);
        assert!(!s.qp_very_low);
        assert!(s.qr_low);
        assert!(s.pint_ok);
        assert!(!s.pint_high);
        assert!(s.ct_high);

        let s = production_signals(&live(2.2, 500.0, 241.0, 120.0), &cfg, true);
        assert!(s.pint_high);
        assert!(s.qr_high);
        assert!(!s.ct_high);
    }

    #[test]
    fn conductivity_suppressed_while_invalid() {
        let s = production_signals(&live(2.0, 500.0, 200.0, 500.0), &settings(), false);
        assert!(!s.ct_high);
    }

    #[test]
    fn missing_references_disable_comparisons() {
        let cfg = EngineSettings::default();
        let s = production_signals(&live(5.0, 1.0, 1.0, 900.0), &cfg, true);
        assert_eq!(s, ProductionSignals { qsum: Some(2.0), ..ProductionSignals::default() });

        let bypass = live(5.0, 0.0, 50.0, 0.5);
        let s = production_signals(&bypass, &cfg, true);
        assert!(FaultRule::FlushBypass.matches(&s, &bypass, &cfg));
    }

    #[test]
    fn each_rule_has_paired_recommendation() {
        for rule in FaultRule::ALL {
            let rec = rule.recommendation();
            assert_eq!(&rule.code()[..1], &rec.code[..1]);
            assert!(rec.code.ends_with("_REC"));
        }
    }
}
