//! State Store — the single authority over mutable system state.
//!
//! Every mutable entity (sensor snapshot, detection ring, device table,
//! alert state, contacts, manual-action queue) is owned here behind its own
//! lock, so readers of independent categories never contend. Each mutating
//! operation emits a [`StateEvent`] *before* releasing the entity lock,
//! which gives subscribers the same per-entity ordering as the mutations
//! themselves.
//!
//! Events travel two ways at once:
//!
//! - synchronously to registered subscriber callbacks (each one
//!   panic-isolated, so a faulty subscriber cannot starve the rest), and
//! - into a bounded fan-out queue drained by the WebSocket broadcaster
//!   (capacity 1000, drop-newest, counted).
//!
//! Detections and alert transitions are additionally pushed into the
//! persistence log sink; a failed push never affects in-memory state.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::defaults::{
    EVENT_QUEUE_CAPACITY, MANUAL_QUEUE_CAPACITY, MAX_ALERT_HISTORY, MAX_DETECTIONS,
};
use crate::storage::LogRecord;
use crate::types::{
    unix_now, AlertState, AlertTransition, Detection, DeviceKind, DeviceStatus, GsmContact,
    ManualAction, SensorPatch, SensorSnapshot, StateEvent,
};

/// Identifier handed out by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

type SubscriberFn = Box<dyn Fn(&StateEvent) + Send + Sync>;

struct AlertBlock {
    current: AlertState,
    history: VecDeque<AlertTransition>,
}

/// Authoritative in-memory state with event fan-out.
pub struct StateStore {
    sensor: Mutex<SensorSnapshot>,
    detections: Mutex<VecDeque<Detection>>,
    devices: Mutex<HashMap<String, DeviceStatus>>,
    alert: Mutex<AlertBlock>,
    contacts: Mutex<Vec<GsmContact>>,
    manual_queue: Mutex<VecDeque<ManualAction>>,

    subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
    next_subscriber_id: AtomicU64,

    event_tx: mpsc::Sender<StateEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<StateEvent>>>,
    dropped_events: AtomicU64,
    manual_dropped: AtomicU64,

    log_tx: Option<mpsc::UnboundedSender<LogRecord>>,

    access_code: String,
}

/// Recover a usable guard from a poisoned lock. Subscriber panics are
/// already caught, so poisoning can only come from a bug elsewhere; the
/// state itself is still structurally sound.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StateStore {
    /// Create a store without a persistence sink (tests, dry runs).
    pub fn new() -> Self {
        Self::with_log_sink(None)
    }

    /// Create a store wired to the storage log sink.
    pub fn with_log_sink(log_tx: Option<mpsc::UnboundedSender<LogRecord>>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let access_code = format!("{:06}", rand::thread_rng().gen_range(100_000..=999_999));

        Self {
            sensor: Mutex::new(SensorSnapshot::default()),
            detections: Mutex::new(VecDeque::with_capacity(MAX_DETECTIONS)),
            devices: Mutex::new(HashMap::new()),
            alert: Mutex::new(AlertBlock {
                current: AlertState::Safe,
                history: VecDeque::with_capacity(MAX_ALERT_HISTORY),
            }),
            contacts: Mutex::new(Vec::new()),
            manual_queue: Mutex::new(VecDeque::with_capacity(MANUAL_QUEUE_CAPACITY)),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            dropped_events: AtomicU64::new(0),
            manual_dropped: AtomicU64::new(0),
            log_tx,
            access_code,
        }
    }

    // ========================================================================
    // Event System
    // ========================================================================

    /// Register a callback invoked on every emission.
    ///
    /// Callbacks run on the mutating thread while the entity lock is held:
    /// they must not block. Fan real work out to a task via a channel.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Box::new(callback)));
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        lock(&self.subscribers).retain(|(sid, _)| *sid != id.0);
    }

    /// Take the fan-out queue receiver. Yields `Some` exactly once; the
    /// WebSocket broadcaster is the single consumer.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<StateEvent>> {
        lock(&self.event_rx).take()
    }

    /// Events dropped because the fan-out queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Manual actions dropped because the queue was full.
    pub fn dropped_manual_actions(&self) -> u64 {
        self.manual_dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, event: StateEvent) {
        // Queue half: bounded, drop-newest.
        if self.event_tx.try_send(event.clone()).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }

        // Callback half: each subscriber isolated.
        let subscribers = lock(&self.subscribers);
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(subscriber = id, event = event.kind(), "Subscriber panicked");
            }
        }
    }

    fn log(&self, record: LogRecord) {
        if let Some(tx) = &self.log_tx {
            if tx.send(record).is_err() {
                debug!("Log sink closed, record dropped");
            }
        }
    }

    // ========================================================================
    // Sensor Data
    // ========================================================================

    /// Merge a partial telemetry update; absent fields keep their values.
    pub fn update_sensor(&self, patch: SensorPatch) {
        let mut sensor = lock(&self.sensor);
        if let Some(fire) = patch.fire {
            sensor.fire = fire;
        }
        if let Some(raining) = patch.raining {
            sensor.raining = raining;
        }
        if let Some(orientation) = patch.orientation {
            sensor.orientation = orientation;
        }
        if let Some(accel) = patch.accel {
            sensor.accel = accel;
        }
        sensor.timestamp = unix_now();
        let snapshot = sensor.clone();
        self.emit(StateEvent::SensorUpdate(snapshot));
    }

    pub fn sensor(&self) -> SensorSnapshot {
        lock(&self.sensor).clone()
    }

    // ========================================================================
    // Detections
    // ========================================================================

    /// Append a detection to the ring, the persistent log, and the bus.
    pub fn add_detection(&self, class_name: &str, confidence: f64, bbox: [f64; 4], frame_id: u64) {
        let detection = Detection::new(class_name, confidence, bbox, frame_id);

        let mut detections = lock(&self.detections);
        if detections.len() >= MAX_DETECTIONS {
            detections.pop_front();
        }
        detections.push_back(detection.clone());

        self.log(LogRecord::Detection(detection.clone()));
        self.emit(StateEvent::Detection(detection));
    }

    /// Most recent detections, oldest first, at most `limit`.
    pub fn detections(&self, limit: usize) -> Vec<Detection> {
        let detections = lock(&self.detections);
        let skip = detections.len().saturating_sub(limit);
        detections.iter().skip(skip).cloned().collect()
    }

    // ========================================================================
    // Devices
    // ========================================================================

    pub fn update_device(&self, device_id: &str, kind: DeviceKind, connected: bool, address: &str) {
        let status = DeviceStatus {
            device_id: device_id.to_string(),
            kind,
            connected,
            last_seen: unix_now(),
            address: address.to_string(),
        };

        let mut devices = lock(&self.devices);
        devices.insert(device_id.to_string(), status.clone());
        self.emit(StateEvent::DeviceUpdate(status));
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        lock(&self.devices).values().cloned().collect()
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    /// Transition the alert state. No-op when `state` equals the current
    /// value; otherwise appends to the history ring and the alert log, and
    /// emits `alert_change`. Returns whether a transition happened.
    pub fn set_alert(&self, state: AlertState, reason: &str) -> bool {
        let mut alert = lock(&self.alert);
        if alert.current == state {
            return false;
        }

        let transition = AlertTransition {
            from: alert.current,
            to: state,
            reason: reason.to_string(),
            timestamp: unix_now(),
        };
        alert.current = state;
        if alert.history.len() >= MAX_ALERT_HISTORY {
            alert.history.pop_front();
        }
        alert.history.push_back(transition);

        self.log(LogRecord::Alert {
            state: state.name().to_string(),
            reason: reason.to_string(),
        });
        self.emit(StateEvent::AlertChange {
            state: state.name().to_string(),
            value: state.value(),
            reason: reason.to_string(),
        });
        true
    }

    pub fn alert(&self) -> AlertState {
        lock(&self.alert).current
    }

    /// Most recent transitions, oldest first, at most `limit`.
    pub fn alert_history(&self, limit: usize) -> Vec<AlertTransition> {
        let alert = lock(&self.alert);
        let skip = alert.history.len().saturating_sub(limit);
        alert.history.iter().skip(skip).cloned().collect()
    }

    /// Broadcast a `hazard_detected` notification without touching state.
    /// Used by the control engine so dashboards can distinguish a fresh
    /// escalation from a replayed state snapshot.
    pub fn publish_hazard(&self, kind: &str, reason: &str) {
        self.emit(StateEvent::HazardDetected {
            kind: kind.to_string(),
            reason: reason.to_string(),
        });
    }

    // ========================================================================
    // Access Code
    // ========================================================================

    /// Six-digit pairing code generated once at startup.
    pub fn access_code(&self) -> &str {
        &self.access_code
    }

    pub fn verify_access_code(&self, code: &str) -> bool {
        code == self.access_code
    }

    // ========================================================================
    // GSM Contacts & Manual Actions
    // ========================================================================

    /// Load contacts from persistence at startup. No events, no log writes.
    pub fn seed_contacts(&self, seeded: Vec<GsmContact>) {
        *lock(&self.contacts) = seeded;
    }

    pub fn add_gsm_contact(&self, contact: GsmContact) {
        let mut contacts = lock(&self.contacts);
        contacts.push(contact.clone());
        let snapshot = contacts.clone();

        self.log(LogRecord::ContactAdded(contact));
        self.emit(StateEvent::GsmUpdate { contacts: snapshot });
    }

    /// Remove every contact with the given number (both modes).
    pub fn delete_gsm_contact(&self, number: &str) {
        let mut contacts = lock(&self.contacts);
        contacts.retain(|c| c.number != number);
        let snapshot = contacts.clone();

        self.log(LogRecord::ContactDeleted {
            number: number.to_string(),
        });
        self.emit(StateEvent::GsmUpdate { contacts: snapshot });
    }

    pub fn gsm_contacts(&self) -> Vec<GsmContact> {
        lock(&self.contacts).clone()
    }

    /// Queue an operator action for the control loop. Oldest entry is
    /// dropped when the queue is full.
    pub fn trigger_manual_action(&self, action_type: &str, details: &str) {
        let action = ManualAction {
            action_type: action_type.to_string(),
            details: details.to_string(),
            timestamp: unix_now(),
        };

        let mut queue = lock(&self.manual_queue);
        if queue.len() >= MANUAL_QUEUE_CAPACITY {
            queue.pop_front();
            self.manual_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(action = action_type, "Manual-action queue full, dropped oldest");
        }
        queue.push_back(action.clone());
        self.emit(StateEvent::ManualTrigger(action));
    }

    /// Drain all queued manual actions, FIFO.
    pub fn drain_manual_actions(&self) -> Vec<ManualAction> {
        lock(&self.manual_queue).drain(..).collect()
    }

    // ========================================================================
    // Full State
    // ========================================================================

    /// Point-in-time snapshot used for the WebSocket `init` message.
    pub fn full_state(&self) -> serde_json::Value {
        serde_json::json!({
            "sensor": self.sensor(),
            "alert": {
                "state": self.alert().name(),
                "value": self.alert().value(),
            },
            "devices": self.devices(),
            "detections": self.detections(10),
            "gsm_contacts": self.gsm_contacts(),
        })
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn sensor_patch_merges() {
        let store = StateStore::new();
        store.update_sensor(SensorPatch {
            raining: Some(55.0),
            ..SensorPatch::default()
        });
        store.update_sensor(SensorPatch {
            fire: Some(true),
            ..SensorPatch::default()
        });

        let snapshot = store.sensor();
        assert!(snapshot.fire);
        assert!((snapshot.raining - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn detection_ring_is_bounded() {
        let store = StateStore::new();
        for i in 0..150 {
            store.add_detection("Fire", 0.9, [0.0, 0.0, 1.0, 1.0], i);
        }
        let all = store.detections(200);
        assert_eq!(all.len(), MAX_DETECTIONS);
        // Oldest surviving entry is frame 50.
        assert_eq!(all[0].frame_id, 50);
        assert_eq!(all[all.len() - 1].frame_id, 149);
    }

    #[test]
    fn set_alert_is_noop_on_equal() {
        let store = StateStore::new();
        assert!(store.set_alert(AlertState::Danger, "Detected: Fire"));
        assert!(!store.set_alert(AlertState::Danger, "Detected: Fire again"));
        assert_eq!(store.alert_history(10).len(), 1);
        assert_eq!(store.alert(), AlertState::Danger);
    }

    #[test]
    fn subscriber_panic_does_not_block_delivery() {
        let store = StateStore::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        store.subscribe(|_| panic!("bad subscriber"));
        let counter = Arc::clone(&delivered);
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_alert(AlertState::Calling, "Warning: Smoke");
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_see_per_entity_mutation_order() {
        let store = StateStore::new();
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |event| {
            if let StateEvent::AlertChange { value, .. } = event {
                sink.lock().unwrap().push(*value);
            }
        });

        store.set_alert(AlertState::Calling, "a");
        store.set_alert(AlertState::Danger, "b");
        store.set_alert(AlertState::Safe, "c");

        assert_eq!(*seen.lock().unwrap(), vec![1, 3, 0]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = StateStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_alert(AlertState::Calling, "x");
        store.unsubscribe(id);
        store.set_alert(AlertState::Danger, "y");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_queue_drops_oldest() {
        let store = StateStore::new();
        for i in 0..12 {
            store.trigger_manual_action("sms_broadcast", &format!("msg {i}"));
        }
        let drained = store.drain_manual_actions();
        assert_eq!(drained.len(), MANUAL_QUEUE_CAPACITY);
        assert_eq!(drained[0].details, "msg 2");
        assert_eq!(store.dropped_manual_actions(), 2);
        assert!(store.drain_manual_actions().is_empty());
    }

    #[test]
    fn access_code_round_trip() {
        let store = StateStore::new();
        let code = store.access_code().to_string();
        assert_eq!(code.len(), 6);
        assert!(store.verify_access_code(&code));
        assert!(!store.verify_access_code("000000"));
    }

    #[test]
    fn event_receiver_is_single_take() {
        let store = StateStore::new();
        assert!(store.take_event_receiver().is_some());
        assert!(store.take_event_receiver().is_none());
    }
}
