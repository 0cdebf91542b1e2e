//! Worker Fleet Manager.
//!
//! Detached inference nodes discover the coordinator via UDP broadcast
//! ([`discovery`]), register over TCP, and then hold a long-lived session:
//! length-prefixed JSON frames carrying `register` / `heartbeat` /
//! `inference_result` upstream and `registered` / `inference_task`
//! downstream ([`wire`]).
//!
//! The manager owns two maps exclusively: worker id → live session entry,
//! and frame id → pending-task completion signal. Dispatch is synchronous
//! by design — the vision pipeline must know within its per-frame deadline
//! whether to fall back to local inference, so [`FleetManager::distribute_sync`]
//! blocks (bounded) on the completion signal for exactly one reply.

pub mod discovery;
pub mod wire;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{FLEET_REAPER_INTERVAL_SECS, WORKER_TIMEOUT_SECS};
use crate::state::StateStore;
use crate::types::{unix_now, DeviceKind, WorkerInfo, WorkerRole, WorkerSpecialty};
use wire::{CoordinatorMessage, WireDetection, WorkerMessage};

struct WorkerEntry {
    info: WorkerInfo,
    outbound: mpsc::Sender<CoordinatorMessage>,
    session_cancel: CancellationToken,
    /// Distinguishes a session from its replacement after a reconnect, so a
    /// stale session's cleanup cannot evict the fresh one.
    session_serial: u64,
}

/// Registry, session supervisor, and dispatcher for the worker fleet.
pub struct FleetManager {
    store: Arc<StateStore>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<WireDetection>>>>,
    cursor: AtomicUsize,
    session_serial: AtomicU64,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FleetManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            workers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            cursor: AtomicUsize::new(0),
            session_serial: AtomicU64::new(1),
        }
    }

    // ========================================================================
    // Registry Queries
    // ========================================================================

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> =
            lock(&self.workers).values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        infos
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Re-classify a connected worker's specialty from the dashboard.
    pub fn classify(&self, worker_id: &str, specialty: WorkerSpecialty) -> bool {
        let mut workers = lock(&self.workers);
        match workers.get_mut(worker_id) {
            Some(entry) => {
                info!(worker = worker_id, specialty = %specialty, "Worker re-classified");
                entry.info.specialty = specialty;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Listener & Sessions
    // ========================================================================

    /// Bind the registration listener. Failure here is fatal at startup.
    pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port)).await
    }

    /// Accept worker connections until cancelled, then tear the fleet down:
    /// close sessions and trigger every pending completion with an empty
    /// result so no dispatcher is left hanging.
    pub async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) {
        info!(addr = ?listener.local_addr().ok(), "Fleet listener running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let manager = Arc::clone(&self);
                            let session_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                manager.run_session(stream, peer.to_string(), session_cancel).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        // Ordered teardown: sessions first, then strand no dispatcher.
        for entry in lock(&self.workers).values() {
            entry.session_cancel.cancel();
        }
        self.complete_pending_empty();
        debug!("Fleet listener stopped");
    }

    /// Complete every pending task with an empty result.
    pub fn complete_pending_empty(&self) {
        for (frame_id, tx) in lock(&self.pending).drain() {
            debug!(frame_id, "Completing pending task empty at shutdown");
            let _ = tx.send(Vec::new());
        }
    }

    async fn run_session(
        self: Arc<Self>,
        stream: TcpStream,
        peer: String,
        cancel: CancellationToken,
    ) {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<CoordinatorMessage>(32);
        let serial = self.session_serial.fetch_add(1, Ordering::Relaxed);
        let mut registered: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    if framed.send(wire::encode(&message)).await.is_err() {
                        break;
                    }
                }

                frame = framed.next() => {
                    let Some(frame) = frame else { break };
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Worker socket error");
                            break;
                        }
                    };
                    // A malformed body is a protocol violation: drop the
                    // frame, keep the session.
                    let message = match wire::decode_worker(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Dropping malformed worker frame");
                            continue;
                        }
                    };
                    match message {
                        WorkerMessage::Register { worker_id, name, model, specialty, role } => {
                            self.register_worker(
                                &worker_id, name, model, specialty, role,
                                &peer, outbound_tx.clone(), &cancel, serial,
                            );
                            registered = Some(worker_id.clone());
                            let ack = CoordinatorMessage::Registered { worker_id };
                            if framed.send(wire::encode(&ack)).await.is_err() {
                                break;
                            }
                        }
                        WorkerMessage::Heartbeat { worker_id, stats } => {
                            let mut workers = lock(&self.workers);
                            if let Some(entry) = workers.get_mut(&worker_id) {
                                entry.info.last_seen = unix_now();
                                entry.info.stats = stats;
                            }
                        }
                        WorkerMessage::InferenceResult { frame_id, detections } => {
                            self.handle_result(frame_id, detections);
                        }
                    }
                }
            }
        }

        if let Some(worker_id) = registered {
            self.remove_session(&worker_id, serial, &peer);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register_worker(
        &self,
        worker_id: &str,
        name: String,
        model: String,
        specialty: WorkerSpecialty,
        role: WorkerRole,
        peer: &str,
        outbound: mpsc::Sender<CoordinatorMessage>,
        cancel: &CancellationToken,
        serial: u64,
    ) {
        info!(worker = worker_id, name = %name, specialty = %specialty, peer = %peer, "Worker registered");
        let entry = WorkerEntry {
            info: WorkerInfo {
                worker_id: worker_id.to_string(),
                name,
                model,
                specialty,
                role,
                address: peer.to_string(),
                last_seen: unix_now(),
                stats: serde_json::Value::Null,
            },
            outbound,
            session_cancel: cancel.clone(),
            session_serial: serial,
        };
        if let Some(previous) = lock(&self.workers).insert(worker_id.to_string(), entry) {
            debug!(worker = worker_id, "Replacing previous session");
            previous.session_cancel.cancel();
        }
        self.store
            .update_device(worker_id, DeviceKind::Worker, true, peer);
    }

    fn remove_session(&self, worker_id: &str, serial: u64, peer: &str) {
        let removed = {
            let mut workers = lock(&self.workers);
            match workers.get(worker_id) {
                Some(entry) if entry.session_serial == serial => {
                    workers.remove(worker_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            info!(worker = worker_id, "Worker disconnected");
            self.store
                .update_device(worker_id, DeviceKind::Worker, false, peer);
        }
    }

    /// Complete the pending task for `frame_id` (when one is still waiting)
    /// and append every returned detection to the state store. A duplicate
    /// or late result only performs the append half, which keeps result
    /// handling idempotent from the dispatcher's point of view.
    fn handle_result(&self, frame_id: u64, detections: Vec<WireDetection>) {
        if let Some(tx) = lock(&self.pending).remove(&frame_id) {
            let _ = tx.send(detections.clone());
        } else {
            debug!(frame_id, "Result arrived with no pending task");
        }

        for detection in &detections {
            match detection.bbox_array() {
                Some(bbox) => self.store.add_detection(
                    &detection.class_name,
                    detection.confidence,
                    bbox,
                    frame_id,
                ),
                None => warn!(
                    frame_id,
                    class = %detection.class_name,
                    "Dropping detection with malformed bbox"
                ),
            }
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Send one frame to one worker and wait (bounded) for its detections.
    ///
    /// Returns `None` when no worker is eligible, the send fails, or the
    /// deadline passes — all of which the vision pipeline answers with
    /// local inference.
    pub async fn distribute_sync(
        &self,
        image_b64: String,
        frame_id: u64,
        specialty: Option<&WorkerSpecialty>,
        timeout: Duration,
    ) -> Option<Vec<WireDetection>> {
        let (worker_id, outbound) = {
            let workers = lock(&self.workers);
            let mut eligible: Vec<&WorkerEntry> = workers
                .values()
                .filter(|entry| match specialty {
                    None => true,
                    Some(required) => {
                        entry.info.specialty == *required
                            || entry.info.specialty == WorkerSpecialty::Generalist
                    }
                })
                .collect();
            if eligible.is_empty() {
                debug!(frame_id, "No eligible workers for dispatch");
                return None;
            }
            eligible.sort_by(|a, b| a.info.worker_id.cmp(&b.info.worker_id));
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
            (
                eligible[index].info.worker_id.clone(),
                eligible[index].outbound.clone(),
            )
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(frame_id, tx);

        let task = CoordinatorMessage::InferenceTask {
            frame_id,
            image: image_b64,
            specialty: specialty.cloned(),
        };
        if outbound.try_send(task).is_err() {
            lock(&self.pending).remove(&frame_id);
            debug!(frame_id, worker = %worker_id, "Task send failed");
            return None;
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(detections)) => Some(detections),
            Ok(Err(_)) => None, // completion signal dropped (shutdown)
            Err(_) => {
                debug!(frame_id, worker = %worker_id, "Dispatch timed out");
                None
            }
        };
        lock(&self.pending).remove(&frame_id);
        result
    }

    // ========================================================================
    // Reaper
    // ========================================================================

    /// Sweep every few seconds; a worker silent past the timeout is closed,
    /// removed, and its device record marked disconnected.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(FLEET_REAPER_INTERVAL_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep_stale(unix_now());
                }
            }
        }
        debug!("Fleet reaper stopped");
    }

    /// Evict workers whose `last_seen` is older than the timeout. Returns
    /// the evicted ids (exercised directly by tests).
    pub fn sweep_stale(&self, now: f64) -> Vec<String> {
        let timeout = WORKER_TIMEOUT_SECS as f64;
        let mut evicted = Vec::new();
        {
            let mut workers = lock(&self.workers);
            workers.retain(|worker_id, entry| {
                if now - entry.info.last_seen > timeout {
                    warn!(worker = %worker_id, "Worker heartbeat timeout, evicting");
                    entry.session_cancel.cancel();
                    evicted.push((worker_id.clone(), entry.info.address.clone()));
                    false
                } else {
                    true
                }
            });
        }
        evicted
            .into_iter()
            .map(|(worker_id, address)| {
                self.store
                    .update_device(&worker_id, DeviceKind::Worker, false, &address);
                worker_id
            })
            .collect()
    }
}
