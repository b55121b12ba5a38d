use super::{Dispatch, DropReason, TelemetryIngestor, CODE_CMD_ACK};
use crate::alarms::AlarmSink;
use crate::device::DeviceConfig;
use crate::diagnosis::{Diagnostics, EngineState, Severity};
use crate::pipeline::{IngestStats, SnapshotWriter, WriteOutcome, WriterSettings};
use crate::presence::{PresenceTracker, CODE_FIRST_SEEN};
use crate::store::memory::MemoryStore;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    diagnostics: Arc<Diagnostics>,
    ingestor: TelemetryIngestor,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let alarms = Arc::new(AlarmSink::new(store.clone(), Duration::from_secs(15 * 60)));
    let diagnostics = Arc::new(Diagnostics::new(store.clone(), alarms.clone()));
    let writer = Arc::new(SnapshotWriter::new(
        store.clone(),
        diagnostics.clone(),
        Arc::new(IngestStats::new()),
        WriterSettings::default(),
    ));
    let presence = Arc::new(PresenceTracker::new(
        store.clone(),
        alarms.clone(),
        Duration::from_secs(30),
        Duration::from_secs(180),
    ));
    let ingestor = TelemetryIngestor::new("plant", presence, writer, alarms);
    Harness {
        store,
        diagnostics,
        ingestor,
    }
}

fn reference_config() -> DeviceConfig {
    DeviceConfig {
        p_inter_nom: 2.0,
        flow_perm_nom: 500.0,
        flow_rej_nom: 200.0,
        cond_perm_nom: 100.0,
        ..DeviceConfig::default()
    }
}

async fn send(ingestor: &TelemetryIngestor, topic: &str, payload: &str, ts: DateTime<Utc>) -> Dispatch {
    let mut bytes = payload.as_bytes().to_vec();
    ingestor.handle_message(topic, &mut bytes, ts).await
}

async fn tele(ingestor: &TelemetryIngestor, field: &str, value: f64, ts: DateTime<Utc>) -> Dispatch {
    send(ingestor, &format!("plant/acme/RO-1/tele/{field}"), &value.to_string(), ts).await
}

#[tokio::test]
async fn conductivity_drift_scenario_alarms_once_per_cooldown() {
    let h = harness();
    h.store.add_device("acme", "RO-1", Some(reference_config()));

    // Stopped: zero conductivity, then the rest of the snapshot arrives inside the rate limit.
    assert!(matches!(
        tele(&h.ingestor, "conductivity_perm", 0.0, at(0)).await,
        Dispatch::Written(WriteOutcome::Accepted { .. })
    ));
    assert_eq!(h.diagnostics.state_of("RO-1").await, Some(EngineState::Stopped));
    for (field, value) in [
        ("presostat_low", 1.0),
        ("pressure_inter", 1.95),
        ("flow_perm", 510.0),
        ("flow_reject", 210.0),
    ] {
        assert!(matches!(
            tele(&h.ingestor, field, value, at(0)).await,
            Dispatch::Written(WriteOutcome::Coalesced)
        ));
    }

    // Conductivity comes up: precheck, 30s baseline at 1.95 bar, production at t=35.
    for t in (5..=95).step_by(5) {
        tele(&h.ingestor, "conductivity_perm", 50.0, at(t)).await;
        if t == 5 {
            assert_eq!(
                h.diagnostics.state_of("RO-1").await,
                Some(EngineState::PrecheckSampleBaseline)
            );
        }
    }
    assert_eq!(h.diagnostics.state_of("RO-1").await, Some(EngineState::Production));
    assert_eq!(h.store.alarm_codes("RO-1"), vec![CODE_FIRST_SEEN]);

    // Drift past the ignore window, sustained well beyond one cooldown.
    for t in (100..=1125).step_by(5) {
        tele(&h.ingestor, "conductivity_perm", 200.0, at(t)).await;
    }

    assert_eq!(
        h.store.alarm_codes("RO-1"),
        vec![CODE_FIRST_SEEN, "F_CT_HIGH", "REC_F_REC", "F_CT_HIGH", "REC_F_REC"]
    );
    let drift: Vec<_> = h
        .store
        .alarms()
        .into_iter()
        .filter(|alarm| alarm.code == "F_CT_HIGH")
        .collect();
    assert_eq!(drift[0].ts, at(220));
    assert_eq!(drift[1].ts, at(1120));
    assert_eq!(drift[0].severity, Severity::Warn);
    assert_eq!(h.ingestor.stats().dropped_messages.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn unregistered_and_foreign_prefix_messages_are_dropped() {
    let h = harness();
    h.store.add_device("acme", "RO-1", Some(reference_config()));

    let ghost = send(&h.ingestor, "plant/acme/RO-9/tele/flow_perm", "5", at(0)).await;
    assert!(matches!(ghost, Dispatch::Dropped(DropReason::UnknownDevice)));

    let foreign = send(&h.ingestor, "plant/other/RO-1/tele/flow_perm", "5", at(1)).await;
    assert!(matches!(foreign, Dispatch::Dropped(DropReason::UnknownDevice)));

    assert_eq!(h.ingestor.stats().dropped_messages.load(Ordering::Relaxed), 2);
    assert!(h.ingestor.writer().snapshot("RO-1").await.is_none());
    assert!(h.ingestor.writer().snapshot("RO-9").await.is_none());
}

#[tokio::test]
async fn malformed_topics_and_payloads_are_counted_and_skipped() {
    let h = harness();
    h.store.add_device("acme", "RO-1", None);

    let cases = [
        ("plant/acme", "1", DropReason::BadTopic),
        ("factory/acme/RO-1/tele/flow_perm", "1", DropReason::BadTopic),
        ("plant/acme/RO-1/telemetry", "1", DropReason::BadTopic),
        ("plant/acme/RO-1/tele/humidity", "1", DropReason::BadPayload),
        ("plant/acme/RO-1/tele/flow_perm", "\"abc\"", DropReason::BadPayload),
        ("plant/acme/RO-1/state", "[1,2]", DropReason::BadPayload),
        ("plant/acme/RO-1/event", "{\"cmd\":\"x\"}", DropReason::BadPayload),
        ("plant/acme/RO-1/state", "{not json", DropReason::BadPayload),
    ];
    for (i, (topic, payload, reason)) in cases.iter().enumerate() {
        let dispatch = send(&h.ingestor, topic, payload, at(i as i64)).await;
        assert!(
            matches!(dispatch, Dispatch::Dropped(r) if r == *reason),
            "{topic}: {dispatch:?}"
        );
    }
    assert_eq!(
        h.ingestor.stats().dropped_messages.load(Ordering::Relaxed),
        cases.len() as u64
    );

    // Still processing after the bad input.
    let ok = send(&h.ingestor, "plant/acme/RO-1/tele/flow_perm", "{\"v\": 7.5}", at(20)).await;
    assert!(matches!(ok, Dispatch::Written(WriteOutcome::Accepted { diagnosis: None })));
    let snapshot = h.ingestor.writer().snapshot("RO-1").await.unwrap_or_default();
    assert_eq!(snapshot.flow_perm, Some(7.5));
}

#[tokio::test]
async fn ack_events_are_recorded_without_cooldown() {
    let h = harness();
    h.store.add_device("acme", "RO-1", None);

    let payload = r#"{"name":"ack","cmd":"flush","ok":true}"#;
    assert!(matches!(
        send(&h.ingestor, "plant/acme/RO-1/event", payload, at(0)).await,
        Dispatch::Acked
    ));
    assert!(matches!(
        send(&h.ingestor, "plant/acme/RO-1/event", payload, at(1)).await,
        Dispatch::Acked
    ));
    assert!(matches!(
        send(&h.ingestor, "plant/acme/RO-1/event", r#"{"name":"BOOT"}"#, at(2)).await,
        Dispatch::EventIgnored
    ));

    let acks: Vec<_> = h
        .store
        .alarms()
        .into_iter()
        .filter(|alarm| alarm.code == CODE_CMD_ACK)
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].message, "ACK cmd=flush ok=true");
    assert_eq!(acks[0].severity, Severity::Info);
    assert_eq!(acks[0].data["cmd"], "flush");
}

#[tokio::test]
async fn state_messages_merge_into_the_snapshot() {
    let h = harness();
    h.store.add_device("acme", "RO-1", None);

    send(&h.ingestor, "plant/acme/RO-1/tele/pressure_inter", "2.1", at(0)).await;
    let coalesced = send(
        &h.ingestor,
        "plant/acme/RO-1/state",
        r#"{"pump_low": true, "pump_high": "0", "mode": "AUTO", "extra": 5}"#,
        at(1),
    )
    .await;
    assert!(matches!(coalesced, Dispatch::Written(WriteOutcome::Coalesced)));

    let snapshot = h.ingestor.writer().snapshot("RO-1").await.unwrap_or_default();
    assert_eq!(snapshot.pressure_inter, Some(2.1));
    assert_eq!(snapshot.pump_low, Some(1.0));
    assert_eq!(snapshot.pump_high, Some(0.0));
    assert_eq!(snapshot.mode.as_deref(), Some("AUTO"));
    assert_eq!(h.ingestor.writer().buffered_len().await, 1);
}
