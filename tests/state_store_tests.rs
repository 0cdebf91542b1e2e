//! State Store integration tests: alert invariants, event ordering across
//! the fan-out queue, contact round-trips, and queue bounds.

use std::sync::Arc;

use aegis_evac::state::StateStore;
use aegis_evac::types::{
    AlertState, GsmContact, GsmMode, HazardCategory, SensorPatch, StateEvent,
};

fn contact(number: &str, mode: GsmMode, category: HazardCategory) -> GsmContact {
    GsmContact {
        mode,
        number: number.to_string(),
        name: format!("contact {number}"),
        message: String::new(),
        category,
    }
}

#[test]
fn alert_reads_stick_until_next_transition() {
    let store = StateStore::new();

    assert!(store.set_alert(AlertState::Danger, "Detected: Fire"));
    for _ in 0..10 {
        assert_eq!(store.alert(), AlertState::Danger);
    }

    assert!(store.set_alert(AlertState::Safe, "Manual reset"));
    assert_eq!(store.alert(), AlertState::Safe);
}

#[test]
fn each_transition_appends_exactly_one_history_entry() {
    let store = StateStore::new();

    store.set_alert(AlertState::Calling, "Warning: Smoke");
    store.set_alert(AlertState::Calling, "Warning: Smoke repeat"); // no-op
    store.set_alert(AlertState::Danger, "Detected: Fire");

    let history = store.alert_history(10);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from, AlertState::Safe);
    assert_eq!(history[0].to, AlertState::Calling);
    assert_eq!(history[1].from, AlertState::Calling);
    assert_eq!(history[1].to, AlertState::Danger);
    assert_eq!(history[1].reason, "Detected: Fire");
}

#[test]
fn added_detections_are_visible_to_readers() {
    let store = StateStore::new();
    for i in 0..5 {
        store.add_detection("Smoke", 0.7, [0.0, 0.0, 10.0, 10.0], i);
    }

    let recent = store.detections(3);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent.last().map(|d| d.frame_id), Some(4));

    let all = store.detections(100);
    assert_eq!(all.len(), 5);
    assert!(all.iter().any(|d| d.frame_id == 0));
}

#[tokio::test]
async fn fan_out_queue_preserves_emission_order() {
    let store = Arc::new(StateStore::new());
    let mut rx = store.take_event_receiver().unwrap();

    store.set_alert(AlertState::Calling, "first");
    store.update_sensor(SensorPatch {
        raining: Some(10.0),
        ..SensorPatch::default()
    });
    store.set_alert(AlertState::Danger, "second");

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind().to_string());
    }
    assert_eq!(kinds, vec!["alert_change", "sensor_update", "alert_change"]);
}

#[test]
fn dropped_events_are_counted_when_queue_fills() {
    // Receiver never taken, so the queue fills at capacity 1000.
    let store = StateStore::new();
    for i in 0..1100 {
        store.add_detection("Fire", 0.9, [0.0, 0.0, 1.0, 1.0], i);
    }
    assert!(store.dropped_events() >= 100);
}

#[test]
fn contact_round_trip_is_identity() {
    let store = StateStore::new();
    let a = contact("+639170000001", GsmMode::Call, HazardCategory::Fire);
    let b = contact("+639170000002", GsmMode::Sms, HazardCategory::General);

    store.add_gsm_contact(a.clone());
    store.add_gsm_contact(b.clone());
    assert_eq!(store.gsm_contacts(), vec![a.clone(), b.clone()]);

    store.delete_gsm_contact(&a.number);
    assert_eq!(store.gsm_contacts(), vec![b]);

    store.delete_gsm_contact("+639170000002");
    assert!(store.gsm_contacts().is_empty());
}

#[test]
fn access_code_verifies_only_itself() {
    let store = StateStore::new();
    let code = store.access_code().to_string();
    assert!(store.verify_access_code(&code));
    assert!(!store.verify_access_code("999999999"));
    assert!(!store.verify_access_code(""));
}

#[test]
fn full_state_snapshot_has_dashboard_sections() {
    let store = StateStore::new();
    store.add_detection("Flood", 0.8, [1.0, 2.0, 3.0, 4.0], 7);
    store.set_alert(AlertState::Danger, "Detected: Flood");

    let snapshot = store.full_state();
    assert_eq!(snapshot["alert"]["state"], "DANGER");
    assert_eq!(snapshot["alert"]["value"], 3);
    assert!(snapshot["sensor"].is_object());
    assert!(snapshot["devices"].is_array());
    assert_eq!(snapshot["detections"][0]["class"], "Flood");
}

#[test]
fn detection_events_match_detection_content() {
    let store = StateStore::new();
    let seen: Arc<std::sync::Mutex<Vec<u64>>> = Arc::default();
    let sink = Arc::clone(&seen);
    store.subscribe(move |event| {
        if let StateEvent::Detection(detection) = event {
            sink.lock().unwrap().push(detection.frame_id);
        }
    });

    store.add_detection("Fire", 0.95, [5.0, 5.0, 20.0, 20.0], 31);
    store.add_detection("Smoke", 0.65, [5.0, 5.0, 20.0, 20.0], 32);
    assert_eq!(*seen.lock().unwrap(), vec![31, 32]);
}
