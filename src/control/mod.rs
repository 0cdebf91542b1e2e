//! Control Engine — the fail-safe decision core.
//!
//! Runs independently of the API surface so critical side-effects (LED
//! patterns, GSM dispatch) survive a dashboard outage. Consumes state-store
//! events, computes alert transitions with a 2-second debounce, drives the
//! microcontroller through the [`CommandSink`] seam, and owns the stale-
//! alert sweep and the operator's manual-action queue.
//!
//! This is the only component that decides alert transitions and GSM
//! actions; API handlers call into it rather than reimplementing policy.

pub mod gsm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    ALERT_DEBOUNCE_SECS, CONTROL_TICK_MS, RAIN_DANGER_THRESHOLD, RAIN_WARNING_THRESHOLD,
    STALE_ALERT_SECS, TILT_THRESHOLD,
};
use crate::serial::{CommandFrame, CommandSink};
use crate::state::StateStore;
use crate::types::{
    AlertState, HazardCategory, ManualAction, SensorSnapshot, StateEvent, CRITICAL_HAZARDS,
    WARNING_HAZARDS,
};

/// Map a detection class to its GSM routing category.
pub fn category_for_class(class_name: &str) -> HazardCategory {
    match class_name {
        "Fire" | "Explosion" => HazardCategory::Fire,
        "Smoke" => HazardCategory::Smoke,
        "Flood" => HazardCategory::Rain,
        "Falling Debris" | "Landslide" | "Collapsed Structure" => HazardCategory::Debris,
        _ => HazardCategory::General,
    }
}

/// Fallback mapping for free-text reasons (manual actions). Fire and
/// explosion outrank smoke when both appear.
pub fn category_from_text(reason: &str) -> HazardCategory {
    let r = reason.to_lowercase();
    if r.contains("fire") || r.contains("explosion") {
        return HazardCategory::Fire;
    }
    if r.contains("smoke") {
        return HazardCategory::Smoke;
    }
    if r.contains("flood") || r.contains("rain") || r.contains("precipitation") {
        return HazardCategory::Rain;
    }
    if r.contains("debris")
        || r.contains("landslide")
        || r.contains("structure")
        || r.contains("vibration")
        || r.contains("earthquake")
    {
        return HazardCategory::Debris;
    }
    HazardCategory::General
}

pub struct ControlEngine {
    store: Arc<StateStore>,
    sink: Arc<dyn CommandSink>,
    cancel: CancellationToken,
    gsm_active: Arc<AtomicBool>,
    last_alert_change: Mutex<Option<Instant>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-progress flag when a GSM cycle ends, however it ends.
struct GsmGuard(Arc<AtomicBool>);

impl Drop for GsmGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ControlEngine {
    pub fn new(
        store: Arc<StateStore>,
        sink: Arc<dyn CommandSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sink,
            cancel,
            gsm_active: Arc::new(AtomicBool::new(false)),
            last_alert_change: Mutex::new(None),
        })
    }

    /// Subscribe to the state bus and start the control loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        // The bus callback must not block: forward into our own channel and
        // do the real work on the control task.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<StateEvent>();
        let subscription = self.store.subscribe(move |event| {
            match event {
                StateEvent::Detection(_) | StateEvent::SensorUpdate(_) => {
                    let _ = event_tx.send(event.clone());
                }
                _ => {}
            }
        });

        tokio::spawn(async move {
            self.run_loop(event_rx).await;
            self.store.unsubscribe(subscription);
        })
    }

    async fn run_loop(&self, mut events: mpsc::UnboundedReceiver<StateEvent>) {
        info!("Control engine running");
        let mut tick = tokio::time::interval(Duration::from_millis(CONTROL_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = events.recv() => {
                    match event {
                        Some(StateEvent::Detection(detection)) => {
                            self.handle_detection(&detection.class_name, detection.confidence);
                        }
                        Some(StateEvent::SensorUpdate(snapshot)) => {
                            self.handle_sensor(&snapshot);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }

                _ = tick.tick() => {
                    for action in self.store.drain_manual_actions() {
                        self.handle_manual_action(&action);
                    }
                    self.clear_stale_alert();
                }
            }
        }
        debug!("Control engine stopped");
    }

    // ========================================================================
    // Event Policy
    // ========================================================================

    fn handle_detection(&self, class_name: &str, confidence: f64) {
        if confidence < 0.5 {
            return;
        }
        let current = self.store.alert();

        if CRITICAL_HAZARDS.contains(&class_name) {
            if current < AlertState::Danger {
                self.trigger(
                    AlertState::Danger,
                    &format!("Detected: {class_name}"),
                    category_for_class(class_name),
                );
            }
        } else if WARNING_HAZARDS.contains(&class_name) && current < AlertState::Calling {
            self.trigger(
                AlertState::Calling,
                &format!("Warning: {class_name}"),
                category_for_class(class_name),
            );
        }
    }

    fn handle_sensor(&self, snapshot: &SensorSnapshot) {
        let current = self.store.alert();

        if snapshot.raining >= RAIN_DANGER_THRESHOLD {
            if current < AlertState::Danger {
                self.trigger(
                    AlertState::Danger,
                    &format!("Precipitation level critical: {:.1}%", snapshot.raining),
                    HazardCategory::Rain,
                );
            }
        } else if snapshot.raining >= RAIN_WARNING_THRESHOLD && current < AlertState::Calling {
            self.trigger(
                AlertState::Calling,
                &format!("Showers detected: {:.1}%", snapshot.raining),
                HazardCategory::Rain,
            );
        }

        let tilt = snapshot.orientation.x.abs() + snapshot.orientation.y.abs();
        if tilt > TILT_THRESHOLD && self.store.alert() < AlertState::Calling {
            self.trigger(
                AlertState::Calling,
                &format!("Ground vibration detected: {tilt:.1}°"),
                HazardCategory::Debris,
            );
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Debounced alert transition with side-effects. Returns `false` when
    /// suppressed by the debounce window.
    pub fn trigger(&self, alert: AlertState, reason: &str, category: HazardCategory) -> bool {
        {
            let mut last = lock(&self.last_alert_change);
            if let Some(at) = *last {
                if at.elapsed().as_secs_f64() < ALERT_DEBOUNCE_SECS {
                    debug!(alert = %alert, reason, "Trigger debounced");
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        info!(alert = %alert, reason, "Alert triggered");
        self.store.set_alert(alert, reason);
        self.send_visual(alert);
        self.store.publish_hazard(alert.name(), reason);

        if alert >= AlertState::Danger {
            self.spawn_gsm_cycle(reason.to_string(), category);
        }
        true
    }

    fn send_visual(&self, alert: AlertState) {
        if !self.sink.send(CommandFrame::SetAlert {
            alert: alert.value(),
        }) {
            warn!(alert = %alert, "Visual alert command not delivered");
        }
    }

    fn touch(&self) {
        *lock(&self.last_alert_change) = Some(Instant::now());
    }

    /// Start an emergency GSM cycle unless one is already running.
    fn spawn_gsm_cycle(&self, reason: String, category: HazardCategory) {
        if self.gsm_active.swap(true, Ordering::SeqCst) {
            debug!("GSM cycle already in progress, skipping");
            return;
        }
        let guard = GsmGuard(Arc::clone(&self.gsm_active));
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let _guard = guard;
            gsm::run_emergency_sequence(store, sink, reason, category, cancel).await;
        });
    }

    /// Revert to SAFE (operator action or stale-alert sweep).
    pub fn set_safe_mode(&self) {
        self.touch();
        self.store.set_alert(AlertState::Safe, "Manual reset");
        self.send_visual(AlertState::Safe);
        info!("System secured: SAFE mode");
    }

    /// Evacuation: highest severity plus a general GSM cycle.
    pub fn set_evacuate(&self, exit_zone: u32) {
        self.touch();
        let reason = format!("Evacuation to zone {exit_zone}");
        self.store.set_alert(AlertState::Evacuate, &reason);
        self.send_visual(AlertState::Evacuate);
        self.spawn_gsm_cycle("EVACUATION INITIATED".to_string(), HazardCategory::General);
        info!(exit_zone, "EVACUATE mode active");
    }

    /// Operator-chosen alert level from the dashboard. Bypasses the
    /// debounce — an explicit human decision beats flap protection.
    pub fn set_alert_manual(&self, alert: AlertState, reason: &str) {
        self.touch();
        self.store.set_alert(alert, reason);
        self.send_visual(alert);
    }

    fn clear_stale_alert(&self) {
        if self.store.alert() == AlertState::Safe {
            return;
        }
        let stale = lock(&self.last_alert_change)
            .map_or(false, |at| at.elapsed().as_secs_f64() > STALE_ALERT_SECS);
        if stale {
            info!("Alert stale with no new input, reverting to SAFE");
            self.set_safe_mode();
        }
    }

    // ========================================================================
    // Manual Actions
    // ========================================================================

    fn handle_manual_action(&self, action: &ManualAction) {
        info!(action = %action.action_type, "Executive override");
        match action.action_type.as_str() {
            "call_fire" => {
                self.touch();
                self.store.set_alert(AlertState::Danger, "Manual Fire Alert");
                self.send_visual(AlertState::Danger);
                self.spawn_gsm_cycle(
                    "FIRE EMERGENCY IN PROGRESS".to_string(),
                    HazardCategory::Fire,
                );
            }
            "call_police" => {
                self.touch();
                self.store
                    .set_alert(AlertState::Calling, "Manual Authority Call");
                self.send_visual(AlertState::Calling);
                self.spawn_gsm_cycle(
                    "POLICE ASSISTANCE REQUIRED".to_string(),
                    HazardCategory::General,
                );
            }
            "earthquake_alert" => {
                self.touch();
                self.store
                    .set_alert(AlertState::Evacuate, "Manual Earthquake Response");
                self.send_visual(AlertState::Evacuate);
                self.spawn_gsm_cycle(
                    "MAJOR EARTHQUAKE DETECTED. SEEK COVER.".to_string(),
                    HazardCategory::Debris,
                );
            }
            "sms_broadcast" => {
                let message = if action.details.is_empty() {
                    "Community advisory from evacuation command".to_string()
                } else {
                    action.details.clone()
                };
                gsm::send_sms(
                    &self.store,
                    self.sink.as_ref(),
                    &message,
                    category_from_text(&message),
                );
            }
            "set_safe" => self.set_safe_mode(),
            other => warn!(action = other, "Unknown manual action ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_categories_are_structured() {
        assert_eq!(category_for_class("Fire"), HazardCategory::Fire);
        assert_eq!(category_for_class("Explosion"), HazardCategory::Fire);
        assert_eq!(category_for_class("Smoke"), HazardCategory::Smoke);
        assert_eq!(category_for_class("Flood"), HazardCategory::Rain);
        assert_eq!(category_for_class("Landslide"), HazardCategory::Debris);
        assert_eq!(category_for_class("Industrial Accident"), HazardCategory::General);
    }

    #[test]
    fn text_fallback_precedence() {
        assert_eq!(category_from_text("FIRE EMERGENCY"), HazardCategory::Fire);
        // fire wins over smoke when both appear
        assert_eq!(
            category_from_text("smoke from a fire upstairs"),
            HazardCategory::Fire
        );
        assert_eq!(category_from_text("Warning: Smoke"), HazardCategory::Smoke);
        assert_eq!(
            category_from_text("Precipitation level critical: 75.0%"),
            HazardCategory::Rain
        );
        assert_eq!(
            category_from_text("Ground vibration detected: 31.0°"),
            HazardCategory::Debris
        );
        assert_eq!(category_from_text("unspecified"), HazardCategory::General);
    }
}
