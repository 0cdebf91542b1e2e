//! System-wide default constants, grouped by subsystem.

// ============================================================================
// State Store
// ============================================================================

/// In-memory detection ring capacity.
pub const MAX_DETECTIONS: usize = 100;

/// Alert-transition history ring capacity.
pub const MAX_ALERT_HISTORY: usize = 50;

/// Event fan-out queue capacity. Full queue drops the newest event.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Manual-action queue capacity. Full queue drops the oldest action.
pub const MANUAL_QUEUE_CAPACITY: usize = 10;

// ============================================================================
// Serial Sensor Link
// ============================================================================

/// Microcontroller line rate.
pub const SERIAL_BAUD: u32 = 115_200;

/// Liveness ping interval (seconds).
pub const SERIAL_PING_INTERVAL_SECS: u64 = 5;

/// Delay after an I/O error before re-opening the port (seconds).
pub const SERIAL_RECONNECT_DELAY_SECS: u64 = 2;

/// Delay after a failed open before the next attempt (seconds).
pub const SERIAL_RETRY_DELAY_SECS: u64 = 5;

// ============================================================================
// Worker Fleet
// ============================================================================

/// UDP port workers listen on for coordinator announcements.
pub const DISCOVERY_PORT: u16 = 8890;

/// TCP port for worker registration and task traffic.
pub const FLEET_PORT: u16 = 8891;

/// Interval between discovery announcements (seconds).
pub const DISCOVERY_INTERVAL_SECS: u64 = 2;

/// Reaper sweep interval (seconds).
pub const FLEET_REAPER_INTERVAL_SECS: u64 = 5;

/// A worker silent for longer than this is evicted (seconds).
pub const WORKER_TIMEOUT_SECS: u64 = 15;

// ============================================================================
// Vision Pipeline
// ============================================================================

/// Dispatch deadline before local fallback (milliseconds).
pub const DISPATCH_TIMEOUT_MS: u64 = 150;

/// JPEG quality for frames shipped to remote workers.
pub const REMOTE_JPEG_QUALITY: u8 = 50;

/// JPEG quality for local analysis and the dashboard relay.
pub const LOCAL_JPEG_QUALITY: u8 = 70;

/// Camera reopen backoff after a stream failure (seconds).
pub const CAMERA_RECONNECT_DELAY_SECS: u64 = 2;

/// Capture-instant window used for the FPS statistic.
pub const FPS_WINDOW: usize = 30;

/// Default local-inference confidence floor.
pub const CONFIDENCE_THRESHOLD: f64 = 0.4;

/// Default per-camera analysis cadence (milliseconds).
pub const ANALYSIS_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Control Engine
// ============================================================================

/// Minimum spacing between automatic alert transitions (seconds).
pub const ALERT_DEBOUNCE_SECS: f64 = 2.0;

/// Precipitation percentage that forces DANGER.
pub const RAIN_DANGER_THRESHOLD: f64 = 70.0;

/// Precipitation percentage that raises CALLING.
pub const RAIN_WARNING_THRESHOLD: f64 = 40.0;

/// Combined |x| + |y| tilt (degrees) that raises CALLING.
pub const TILT_THRESHOLD: f64 = 30.0;

/// Control-loop tick (milliseconds): manual actions + stale-alert sweep.
pub const CONTROL_TICK_MS: u64 = 500;

/// An alert untouched for this long is auto-cleared to SAFE (seconds).
pub const STALE_ALERT_SECS: f64 = 600.0;

/// Call attempts per contact in a GSM emergency cycle.
pub const GSM_MAX_RETRIES: u32 = 5;

/// Wait for a placed call to complete (seconds).
pub const GSM_CALL_WAIT_SECS: u64 = 10;

/// Backoff after a failed call command (seconds).
pub const GSM_RETRY_DELAY_SECS: u64 = 5;

// ============================================================================
// API & Fan-out
// ============================================================================

/// Broadcaster / MJPEG relay cadence (milliseconds). ~20 Hz.
pub const BROADCAST_INTERVAL_MS: u64 = 50;

/// WebSocket idle keepalive interval (seconds).
pub const WS_KEEPALIVE_SECS: u64 = 30;
