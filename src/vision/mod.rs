//! Vision Pipeline — camera acquisition, balanced inference, dashboard relay.
//!
//! One task per camera pulls an MJPEG stream, chops it into frames, and for
//! each analyzed frame decides between remote dispatch and local inference.
//! With `W` connected workers, every `(W+1)`-th frame runs locally so the
//! coordinator stays warm and contributes proportional throughput; the rest
//! are offloaded and fall back to local inference when the fleet misses the
//! per-frame deadline.
//!
//! Frame ids come from one pipeline-global monotonic counter, so a pending
//! dispatch can never be completed by a result for another camera's frame.

pub mod annotate;
pub mod camera;
pub mod detector;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    CAMERA_RECONNECT_DELAY_SECS, DISPATCH_TIMEOUT_MS, FPS_WINDOW, LOCAL_JPEG_QUALITY,
    REMOTE_JPEG_QUALITY,
};
use crate::config::Settings;
use crate::fleet::FleetManager;
use crate::state::StateStore;
use crate::types::DeviceKind;
use annotate::InferenceOrigin;
use camera::JpegFrameSplitter;
use detector::{class_label, Detector};

/// Decide whether frame `counter` should be offloaded given `workers`
/// connected nodes. One in every `workers + 1` frames stays local.
pub fn should_offload(counter: u64, workers: usize) -> bool {
    workers > 0 && counter % (workers as u64 + 1) != 0
}

struct CameraHandle {
    url: String,
    cancel: CancellationToken,
}

/// Pipeline statistics for `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct VisionStats {
    pub frames_processed: u64,
    pub local_inferences: u64,
    pub remote_dispatches: u64,
    /// Sliding-window rate over the most recent frames.
    pub fps: f64,
}

pub struct VisionPipeline {
    store: Arc<StateStore>,
    fleet: Arc<FleetManager>,
    detector: Box<dyn Detector>,
    settings: Settings,
    client: reqwest::Client,

    frame_counter: AtomicU64,
    frames_processed: AtomicU64,
    local_inferences: AtomicU64,
    remote_dispatches: AtomicU64,
    frame_instants: Mutex<VecDeque<Instant>>,

    /// Latest annotated JPEG per camera, served as MJPEG by the API.
    slots: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    cameras: Mutex<HashMap<String, CameraHandle>>,
    cancel: CancellationToken,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VisionPipeline {
    pub fn new(
        store: Arc<StateStore>,
        fleet: Arc<FleetManager>,
        detector: Box<dyn Detector>,
        settings: Settings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            fleet,
            detector,
            settings,
            client: reqwest::Client::new(),
            frame_counter: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            local_inferences: AtomicU64::new(0),
            remote_dispatches: AtomicU64::new(0),
            frame_instants: Mutex::new(VecDeque::with_capacity(FPS_WINDOW)),
            slots: Mutex::new(HashMap::new()),
            cameras: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    // ========================================================================
    // Camera Management
    // ========================================================================

    /// Register a camera and start its reader task. Returns `false` when the
    /// id is already registered.
    pub fn add_camera(self: Arc<Self>, device_id: &str, url: &str) -> bool {
        let cancel = {
            let mut cameras = lock(&self.cameras);
            if cameras.contains_key(device_id) {
                return false;
            }
            let cancel = self.cancel.child_token();
            cameras.insert(
                device_id.to_string(),
                CameraHandle {
                    url: url.to_string(),
                    cancel: cancel.clone(),
                },
            );
            cancel
        };
        self.store
            .update_device(device_id, DeviceKind::Camera, false, url);

        let device_id = device_id.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            self.run_camera(&device_id, &url, cancel).await;
        });
        true
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.cameras).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn camera_url(&self, device_id: &str) -> Option<String> {
        lock(&self.cameras).get(device_id).map(|h| h.url.clone())
    }

    /// Latest annotated JPEG for one camera.
    pub fn latest_frame(&self, device_id: &str) -> Option<Arc<Vec<u8>>> {
        lock(&self.slots).get(device_id).cloned()
    }

    pub fn stats(&self) -> VisionStats {
        VisionStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            local_inferences: self.local_inferences.load(Ordering::Relaxed),
            remote_dispatches: self.remote_dispatches.load(Ordering::Relaxed),
            fps: self.window_fps(),
        }
    }

    fn window_fps(&self) -> f64 {
        let instants = lock(&self.frame_instants);
        if instants.len() < 2 {
            return 0.0;
        }
        let span = instants[instants.len() - 1]
            .duration_since(instants[0])
            .as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (instants.len() - 1) as f64 / span
    }

    fn record_frame_instant(&self) {
        let mut instants = lock(&self.frame_instants);
        if instants.len() >= FPS_WINDOW {
            instants.pop_front();
        }
        instants.push_back(Instant::now());
    }

    // ========================================================================
    // Camera Loop
    // ========================================================================

    async fn run_camera(&self, device_id: &str, url: &str, cancel: CancellationToken) {
        info!(camera = device_id, url = url, "Camera task starting");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let response = match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    warn!(camera = device_id, status = %response.status(), "Camera stream refused");
                    self.store
                        .update_device(device_id, DeviceKind::Camera, false, url);
                    if wait_or_cancel(&cancel, Duration::from_secs(CAMERA_RECONNECT_DELAY_SECS))
                        .await
                    {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(camera = device_id, error = %e, "Camera connect failed");
                    self.store
                        .update_device(device_id, DeviceKind::Camera, false, url);
                    if wait_or_cancel(&cancel, Duration::from_secs(CAMERA_RECONNECT_DELAY_SECS))
                        .await
                    {
                        break;
                    }
                    continue;
                }
            };

            self.store
                .update_device(device_id, DeviceKind::Camera, true, url);
            self.pump_stream(device_id, response, &cancel).await;
            self.store
                .update_device(device_id, DeviceKind::Camera, false, url);

            if cancel.is_cancelled() {
                break;
            }
            warn!(camera = device_id, "Camera stream lost, reopening");
            if wait_or_cancel(&cancel, Duration::from_secs(CAMERA_RECONNECT_DELAY_SECS)).await {
                break;
            }
        }
        debug!(camera = device_id, "Camera task stopped");
    }

    async fn pump_stream(
        &self,
        device_id: &str,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) {
        let mut stream = response.bytes_stream();
        let mut splitter = JpegFrameSplitter::new();
        let mut last_analyzed: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => {
                    let Some(Ok(chunk)) = chunk else { return };
                    for frame in splitter.push(&chunk) {
                        let interval = Duration::from_millis(
                            self.settings.load().analysis_interval_ms,
                        );
                        let due = last_analyzed.map_or(true, |t| t.elapsed() >= interval);
                        if due {
                            last_analyzed = Some(Instant::now());
                            self.process_frame(device_id, &frame).await;
                        } else {
                            // Keep the relay moving between analyzed frames.
                            lock(&self.slots)
                                .insert(device_id.to_string(), Arc::new(frame));
                        }
                    }
                }
            }
        }
    }

    // ========================================================================
    // Per-frame Scheduling
    // ========================================================================

    async fn process_frame(&self, device_id: &str, jpeg: &[u8]) {
        let frame_id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.record_frame_instant();

        let mut frame = match annotate::decode_jpeg(jpeg) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(camera = device_id, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let workers = self.fleet.connected_count();
        let mut remote_boxes: Option<Vec<[f64; 4]>> = None;

        if should_offload(frame_id, workers) {
            self.remote_dispatches.fetch_add(1, Ordering::Relaxed);
            remote_boxes = self.offload(&frame, frame_id).await;
        }

        let origin = if remote_boxes.is_some() {
            InferenceOrigin::Remote
        } else {
            InferenceOrigin::Local
        };

        let boxes = match remote_boxes {
            // Remote results are already in the state store via the fleet's
            // result handler; only the overlay is drawn here.
            Some(boxes) => boxes,
            None => self.infer_local(&frame, frame_id),
        };

        for bbox in &boxes {
            annotate::draw_box(&mut frame, *bbox, origin);
        }

        match annotate::encode_jpeg(&frame, LOCAL_JPEG_QUALITY) {
            Ok(annotated) => {
                lock(&self.slots).insert(device_id.to_string(), Arc::new(annotated));
            }
            Err(e) => debug!(camera = device_id, error = %e, "Relay encode failed"),
        }
    }

    /// Ship the frame to the fleet; `None` means timeout / no worker / send
    /// failure, and the caller runs local inference instead.
    async fn offload(&self, frame: &image::RgbImage, frame_id: u64) -> Option<Vec<[f64; 4]>> {
        let jpeg = match annotate::encode_jpeg(frame, REMOTE_JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                debug!(error = %e, "Dispatch encode failed");
                return None;
            }
        };
        let detections = self
            .fleet
            .distribute_sync(
                BASE64.encode(jpeg),
                frame_id,
                None,
                Duration::from_millis(DISPATCH_TIMEOUT_MS),
            )
            .await?;
        Some(detections.iter().filter_map(|d| d.bbox_array()).collect())
    }

    fn infer_local(&self, frame: &image::RgbImage, frame_id: u64) -> Vec<[f64; 4]> {
        let settings = self.settings.load();
        let outputs = match self
            .detector
            .detect(frame, settings.confidence_threshold)
        {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(error = %e, "Local inference failed");
                return Vec::new();
            }
        };
        self.local_inferences.fetch_add(1, Ordering::Relaxed);

        let mut boxes = Vec::with_capacity(outputs.len());
        for raw in outputs {
            let label = class_label(&settings.hazard_classes, raw.class_id);
            self.store
                .add_detection(&label, raw.confidence, raw.bbox, frame_id);
            boxes.push(raw.bbox);
        }
        boxes
    }
}

/// Sleep unless cancelled first. Returns `true` when cancelled.
async fn wait_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_every_wplus1_frames() {
        // No workers: never offload.
        for counter in 1..10 {
            assert!(!should_offload(counter, 0));
        }
        // One worker: alternate — odd frames offload, even run locally.
        assert!(should_offload(1, 1));
        assert!(!should_offload(2, 1));
        assert!(should_offload(3, 1));
        assert!(!should_offload(4, 1));
        // Three workers: one in four local.
        let local: Vec<u64> = (1..=12).filter(|c| !should_offload(*c, 3)).collect();
        assert_eq!(local, vec![4, 8, 12]);
    }
}
