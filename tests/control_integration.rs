//! Control engine scenario tests against a recording command sink: critical
//! detections escalating through GSM dispatch, sensor-driven alerts, the
//! debounce window, retry on send failure, stale-alert auto-clear, and
//! manual overrides. Tests run on a paused clock, so the multi-second GSM
//! waits resolve instantly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use aegis_evac::control::ControlEngine;
use aegis_evac::serial::{CommandFrame, CommandSink};
use aegis_evac::state::StateStore;
use aegis_evac::types::{
    AlertState, GsmContact, GsmMode, HazardCategory, SensorPatch, Triple,
};

struct MockSink {
    frames: Mutex<Vec<CommandFrame>>,
    ok: AtomicBool,
}

impl MockSink {
    fn healthy() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            ok: AtomicBool::new(true),
        })
    }

    fn failing() -> Arc<Self> {
        let sink = Self::healthy();
        sink.ok.store(false, Ordering::SeqCst);
        sink
    }

    fn frames(&self) -> Vec<CommandFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn call_numbers(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                CommandFrame::GsmCall { number, .. } => Some(number),
                _ => None,
            })
            .collect()
    }

    fn sms_messages(&self) -> Vec<(String, String)> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                CommandFrame::GsmSms { number, message } => Some((number, message)),
                _ => None,
            })
            .collect()
    }
}

impl CommandSink for MockSink {
    fn send(&self, frame: CommandFrame) -> bool {
        self.frames.lock().unwrap().push(frame);
        self.ok.load(Ordering::SeqCst)
    }
}

fn contact(number: &str, mode: GsmMode, category: HazardCategory) -> GsmContact {
    GsmContact {
        mode,
        number: number.to_string(),
        name: format!("contact {number}"),
        message: String::new(),
        category,
    }
}

fn rig(
    contacts: Vec<GsmContact>,
    sink: Arc<MockSink>,
) -> (Arc<StateStore>, Arc<ControlEngine>, CancellationToken) {
    let store = Arc::new(StateStore::new());
    store.seed_contacts(contacts);
    let cancel = CancellationToken::new();
    let engine = ControlEngine::new(Arc::clone(&store), sink, cancel.clone());
    Arc::clone(&engine).start();
    (store, engine, cancel)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// ============================================================================
// Detection-driven escalation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn critical_detection_escalates_and_dispatches() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(
        vec![
            contact("+100", GsmMode::Call, HazardCategory::General),
            contact("+200", GsmMode::Call, HazardCategory::Fire),
            contact("+300", GsmMode::Sms, HazardCategory::Fire),
            contact("+400", GsmMode::Call, HazardCategory::Rain), // filtered out
        ],
        Arc::clone(&sink),
    );

    store.add_detection("Fire", 0.91, [10.0, 10.0, 50.0, 50.0], 1);

    wait_until(|| store.alert() == AlertState::Danger).await;
    let history = store.alert_history(10);
    assert_eq!(history.last().map(|t| t.reason.as_str()), Some("Detected: Fire"));

    // Visual command reaches the microcontroller.
    wait_until(|| {
        sink.frames()
            .iter()
            .any(|f| matches!(f, CommandFrame::SetAlert { alert: 3 }))
    })
    .await;

    // Let the full GSM cycle play out (two calls at 10 s each, then SMS).
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sink.call_numbers(), vec!["+100".to_string(), "+200".to_string()]);
    let sms = sink.sms_messages();
    assert_eq!(sms, vec![("+300".to_string(), "SOS: Detected: Fire".to_string())]);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn low_confidence_detections_are_ignored() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(vec![], Arc::clone(&sink));

    store.add_detection("Fire", 0.45, [0.0, 0.0, 1.0, 1.0], 1);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.alert(), AlertState::Safe);
    assert!(sink.frames().is_empty());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn warning_class_raises_calling_only_once() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(vec![], Arc::clone(&sink));

    store.add_detection("Smoke", 0.7, [0.0, 0.0, 1.0, 1.0], 1);
    wait_until(|| store.alert() == AlertState::Calling).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    store.add_detection("Smoke", 0.7, [0.0, 0.0, 1.0, 1.0], 2);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Exactly one CALLING transition.
    assert_eq!(store.alert_history(10).len(), 1);

    // A critical class after the debounce window escalates.
    tokio::time::sleep(Duration::from_secs(1)).await;
    store.add_detection("Fire", 0.95, [0.0, 0.0, 1.0, 1.0], 3);
    wait_until(|| store.alert() == AlertState::Danger).await;

    let history = store.alert_history(10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to, AlertState::Calling);
    assert_eq!(history[1].to, AlertState::Danger);
    cancel.cancel();
}

// ============================================================================
// Sensor-driven escalation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn precipitation_over_danger_threshold_escalates() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(
        vec![
            contact("+510", GsmMode::Call, HazardCategory::Rain),
            contact("+520", GsmMode::Call, HazardCategory::General),
            contact("+530", GsmMode::Call, HazardCategory::Fire), // filtered out
        ],
        Arc::clone(&sink),
    );

    store.update_sensor(SensorPatch {
        raining: Some(75.0),
        ..SensorPatch::default()
    });

    wait_until(|| store.alert() == AlertState::Danger).await;
    let reason = store.alert_history(10).last().map(|t| t.reason.clone()).unwrap_or_default();
    assert!(reason.contains("75.0"), "reason should carry the level: {reason}");

    tokio::time::sleep(Duration::from_secs(30)).await;
    let mut called = sink.call_numbers();
    called.sort();
    assert_eq!(called, vec!["+510".to_string(), "+520".to_string()]);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn moderate_rain_raises_calling() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(vec![], Arc::clone(&sink));

    store.update_sensor(SensorPatch {
        raining: Some(45.0),
        ..SensorPatch::default()
    });
    wait_until(|| store.alert() == AlertState::Calling).await;
    // CALLING does not start a GSM cycle.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(sink.call_numbers().is_empty());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn tilt_beyond_threshold_raises_calling() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(vec![], Arc::clone(&sink));

    store.update_sensor(SensorPatch {
        orientation: Some(Triple {
            x: 20.0,
            y: -15.0,
            z: 0.0,
        }),
        ..SensorPatch::default()
    });
    wait_until(|| store.alert() == AlertState::Calling).await;
    let reason = store.alert_history(10)[0].reason.clone();
    assert!(reason.contains("35.0"), "tilt magnitude in reason: {reason}");
    cancel.cancel();
}

// ============================================================================
// Debounce & stale-alert sweep
// ============================================================================

#[tokio::test(start_paused = true)]
async fn trigger_debounces_within_two_seconds() {
    let sink = MockSink::healthy();
    let (store, engine, cancel) = rig(vec![], Arc::clone(&sink));

    assert!(engine.trigger(AlertState::Calling, "Warning: Smoke", HazardCategory::Smoke));
    assert!(!engine.trigger(AlertState::Danger, "Detected: Fire", HazardCategory::Fire));
    assert_eq!(store.alert(), AlertState::Calling);

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(engine.trigger(AlertState::Danger, "Detected: Fire", HazardCategory::Fire));
    assert_eq!(store.alert(), AlertState::Danger);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn stale_alert_auto_clears_to_safe() {
    let sink = MockSink::healthy();
    let (store, engine, cancel) = rig(vec![], Arc::clone(&sink));

    engine.set_alert_manual(AlertState::Danger, "Operator drill");
    assert_eq!(store.alert(), AlertState::Danger);

    tokio::time::sleep(Duration::from_secs(601)).await;
    wait_until(|| store.alert() == AlertState::Safe).await;

    let history = store.alert_history(10);
    let last = history.last().unwrap();
    assert_eq!(last.from, AlertState::Danger);
    assert_eq!(last.to, AlertState::Safe);
    assert_eq!(last.reason, "Manual reset");

    // The sweep also drives the LEDs back to SAFE.
    assert!(sink
        .frames()
        .iter()
        .any(|f| matches!(f, CommandFrame::SetAlert { alert: 0 })));
    cancel.cancel();
}

// ============================================================================
// GSM retry & manual overrides
// ============================================================================

#[tokio::test(start_paused = true)]
async fn call_send_failure_retries_five_times() {
    let sink = MockSink::failing();
    let (store, engine, cancel) = rig(
        vec![contact("+700", GsmMode::Call, HazardCategory::General)],
        Arc::clone(&sink),
    );

    engine.trigger(AlertState::Danger, "Detected: Flood", HazardCategory::Rain);
    wait_until(|| store.alert() == AlertState::Danger).await;

    // 5 attempts spaced 5 s apart, then the cycle gives up on the contact.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(sink.call_numbers(), vec!["+700".to_string(); 5]);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn sms_broadcast_manual_action_sends_to_general_contacts() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(
        vec![
            contact("+810", GsmMode::Sms, HazardCategory::General),
            contact("+820", GsmMode::Sms, HazardCategory::Fire), // not general, not matched
        ],
        Arc::clone(&sink),
    );

    store.trigger_manual_action("sms_broadcast", "Take shelter in zone 2");
    wait_until(|| !sink.sms_messages().is_empty()).await;

    assert_eq!(
        sink.sms_messages(),
        vec![("+810".to_string(), "Take shelter in zone 2".to_string())]
    );
    assert_eq!(store.alert(), AlertState::Safe); // broadcast alone changes nothing
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn earthquake_override_goes_to_evacuate() {
    let sink = MockSink::healthy();
    let (store, _engine, cancel) = rig(
        vec![contact("+910", GsmMode::Call, HazardCategory::Debris)],
        Arc::clone(&sink),
    );

    store.trigger_manual_action("earthquake_alert", "");
    wait_until(|| store.alert() == AlertState::Evacuate).await;

    wait_until(|| {
        sink.frames()
            .iter()
            .any(|f| matches!(f, CommandFrame::SetAlert { alert: 4 }))
    })
    .await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(sink.call_numbers(), vec!["+910".to_string()]);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn custom_contact_message_overrides_cycle_text() {
    let sink = MockSink::healthy();
    let mut custom = contact("+950", GsmMode::Sms, HazardCategory::General);
    custom.message = "Meet at the barangay hall".to_string();
    let (store, engine, cancel) = rig(vec![custom], Arc::clone(&sink));

    engine.trigger(AlertState::Danger, "Detected: Fire", HazardCategory::Fire);
    wait_until(|| store.alert() == AlertState::Danger).await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(
        sink.sms_messages(),
        vec![("+950".to_string(), "Meet at the barangay hall".to_string())]
    );
    cancel.cancel();
}
