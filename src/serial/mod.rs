//! Serial Sensor Link — the microcontroller peer.
//!
//! A single task owns the port: it reads newline-delimited JSON telemetry,
//! writes command frames queued by the rest of the system, and pings every
//! few seconds to prove the peer is alive. All failures are internalized:
//! an I/O error marks the device disconnected in the State Store and the
//! loop re-opens the port after a short delay, forever. Nothing here ever
//! raises to a caller.

pub mod protocol;

pub use protocol::{parse_line, CommandFrame, InboundLine};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    SERIAL_PING_INTERVAL_SECS, SERIAL_RECONNECT_DELAY_SECS, SERIAL_RETRY_DELAY_SECS,
};
use crate::config::RuntimeConfig;
use crate::state::StateStore;
use crate::types::DeviceKind;

/// Device id the microcontroller is tracked under.
pub const SENSOR_HUB_ID: &str = "mcu_main";

/// USB-serial chip descriptors that identify the microcontroller.
const USB_SERIAL_MARKERS: [&str; 4] = ["cp210", "ch340", "ftdi", "usb serial"];

/// Seam between the control engine and the serial writer, so alert logic is
/// testable against a recording sink.
pub trait CommandSink: Send + Sync {
    /// Queue a command frame. Returns `false` when the peer is down or the
    /// outbound queue is saturated — callers treat that as a send failure.
    fn send(&self, frame: CommandFrame) -> bool;
}

/// Cloneable handle to the running serial link.
#[derive(Clone)]
pub struct SerialHandle {
    tx: mpsc::Sender<CommandFrame>,
    connected: Arc<AtomicBool>,
}

impl SerialHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl CommandSink for SerialHandle {
    fn send(&self, frame: CommandFrame) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.tx.try_send(frame).is_ok()
    }
}

/// Scan the system port list for a known USB-serial bridge.
fn autodetect_port() -> Option<String> {
    let ports = tokio_serial::available_ports().ok()?;
    for port in ports {
        let description = match &port.port_type {
            SerialPortType::UsbPort(usb) => usb
                .product
                .clone()
                .unwrap_or_default()
                .to_lowercase(),
            _ => continue,
        };
        if USB_SERIAL_MARKERS.iter().any(|m| description.contains(m)) {
            info!(port = %port.port_name, product = %description, "Auto-detected microcontroller port");
            return Some(port.port_name);
        }
    }
    None
}

/// Spawn the serial link task. Returns the command handle and the task's
/// join handle (awaited during ordered shutdown).
pub fn spawn(
    config: &RuntimeConfig,
    store: Arc<StateStore>,
    cancel: CancellationToken,
) -> (SerialHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<CommandFrame>(64);
    let connected = Arc::new(AtomicBool::new(false));
    let handle = SerialHandle {
        tx,
        connected: Arc::clone(&connected),
    };

    let port_override = config.serial_port.clone();
    let baud = config.baud_rate;
    let task = tokio::spawn(async move {
        run_link(port_override, baud, store, connected, rx, cancel).await;
    });

    (handle, task)
}

async fn run_link(
    port_override: Option<String>,
    baud: u32,
    store: Arc<StateStore>,
    connected: Arc<AtomicBool>,
    mut commands: mpsc::Receiver<CommandFrame>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(port_name) = port_override.clone().or_else(autodetect_port) else {
            warn!("No serial port configured and auto-detect found none, retrying");
            store.update_device(SENSOR_HUB_ID, DeviceKind::SensorHub, false, "");
            if wait_or_cancel(&cancel, Duration::from_secs(SERIAL_RETRY_DELAY_SECS)).await {
                break;
            }
            continue;
        };

        let stream = match tokio_serial::new(&port_name, baud).open_native_async() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(port = %port_name, error = %e, "Serial open failed");
                store.update_device(SENSOR_HUB_ID, DeviceKind::SensorHub, false, &port_name);
                if wait_or_cancel(&cancel, Duration::from_secs(SERIAL_RETRY_DELAY_SECS)).await {
                    break;
                }
                continue;
            }
        };

        // The board resets when the port opens; give it time to come up
        // before treating silence as a fault.
        if wait_or_cancel(&cancel, Duration::from_secs(2)).await {
            break;
        }

        info!(port = %port_name, baud = baud, "Serial link connected");
        connected.store(true, Ordering::Relaxed);
        store.update_device(SENSOR_HUB_ID, DeviceKind::SensorHub, true, &port_name);

        run_session(stream, &store, &mut commands, &cancel).await;

        connected.store(false, Ordering::Relaxed);
        store.update_device(SENSOR_HUB_ID, DeviceKind::SensorHub, false, &port_name);

        if cancel.is_cancelled() {
            break;
        }
        warn!(port = %port_name, "Serial link lost, reconnecting");
        if wait_or_cancel(&cancel, Duration::from_secs(SERIAL_RECONNECT_DELAY_SECS)).await {
            break;
        }
    }
    debug!("Serial link stopped");
}

/// Pump one open port until it fails or the link is cancelled.
async fn run_session(
    stream: SerialStream,
    store: &Arc<StateStore>,
    commands: &mut mpsc::Receiver<CommandFrame>,
    cancel: &CancellationToken,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    // `Lines::next_line` is cancel-safe: a command write or ping winning the
    // select cannot drop a partially received line.
    let mut lines = BufReader::new(read_half).lines();
    let mut ping = tokio::time::interval(Duration::from_secs(SERIAL_PING_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(store, &line),
                    Ok(None) => return, // port closed underneath us
                    Err(e) => {
                        warn!(error = %e, "Serial read error");
                        return;
                    }
                }
            }

            frame = commands.recv() => {
                let Some(frame) = frame else { return };
                if let Err(e) = write_half.write_all(frame.to_line().as_bytes()).await {
                    warn!(error = %e, "Serial write error");
                    return;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write_half.write_all(CommandFrame::Ping.to_line().as_bytes()).await {
                    warn!(error = %e, "Serial ping failed");
                    return;
                }
            }
        }
    }
}

fn handle_line(store: &Arc<StateStore>, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match parse_line(line) {
        InboundLine::Telemetry(patch) => store.update_sensor(patch),
        InboundLine::Event { name, payload } => match name.as_str() {
            "boot" => info!(status = ?payload.get("status"), "Microcontroller boot"),
            "error" => warn!(message = ?payload.get("message"), "Microcontroller error"),
            "alert_set" => debug!(alert = ?payload.get("alert"), "Microcontroller confirmed alert"),
            "pong" => debug!(uptime_ms = ?payload.get("uptime"), "Microcontroller pong"),
            other => debug!(event = other, "Unhandled microcontroller event"),
        },
        InboundLine::Unknown(value) => debug!(payload = %value, "Unrecognized serial JSON"),
        InboundLine::Raw(text) => debug!(raw = %text, "Non-JSON serial line"),
    }
}

/// Sleep unless cancelled first. Returns `true` when cancelled.
async fn wait_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
