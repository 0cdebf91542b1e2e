//! AEGIS-EVAC coordinator binary.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (auto-detect serial port, no cameras)
//! cargo run --release
//!
//! # Pin the serial port and register two cameras
//! cargo run --release -- --serial-port /dev/ttyUSB0 \
//!     --camera cam_entrance=http://192.168.1.40/stream \
//!     --camera cam_hall=http://192.168.1.41/stream
//! ```
//!
//! # Environment Variables
//!
//! - `AEGIS_SERVER_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
//! - `RUST_LOG`: logging level (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_evac::api::{self, ws::ClientRegistry, ApiState};
use aegis_evac::config::{self, RuntimeConfig, SystemConfig};
use aegis_evac::control::ControlEngine;
use aegis_evac::fleet::{discovery, FleetManager};
use aegis_evac::serial;
use aegis_evac::state::StateStore;
use aegis_evac::storage::Storage;
use aegis_evac::vision::{detector::NullDetector, VisionPipeline};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "aegis-evac")]
#[command(about = "AEGIS-EVAC Hazard Detection & Evacuation Coordinator")]
#[command(version)]
struct CliArgs {
    /// Override the HTTP server address (default: "0.0.0.0:8080")
    #[arg(short, long, env = "AEGIS_SERVER_ADDR")]
    addr: Option<String>,

    /// Serial port of the microcontroller (auto-detected when omitted)
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value = "115200")]
    baud: u32,

    /// UDP port workers listen on for discovery announcements
    #[arg(long, default_value = "8890")]
    discovery_port: u16,

    /// TCP port for worker registration and dispatch
    #[arg(long, default_value = "8891")]
    fleet_port: u16,

    /// SQLite database path
    #[arg(long, default_value = "system.db")]
    db: PathBuf,

    /// Settings document path (JSON)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Register a camera at startup, `id=url` (repeatable)
    #[arg(long = "camera", value_name = "ID=URL")]
    cameras: Vec<String>,
}

// ============================================================================
// Ordered Shutdown
// ============================================================================

/// One stoppable component, in shutdown order.
struct Component {
    name: &'static str,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Cancel a component and give its tasks two seconds to drain.
async fn stop_component(component: Component) {
    component.cancel.cancel();
    for task in component.tasks {
        match tokio::time::timeout(Duration::from_secs(2), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(component = component.name, error = %e, "Task ended abnormally"),
            Err(_) => warn!(component = component.name, "Task did not stop within 2s"),
        }
    }
    info!(component = component.name, "Stopped");
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let runtime = RuntimeConfig {
        server_addr: args.addr.unwrap_or_else(|| RuntimeConfig::default().server_addr),
        discovery_port: args.discovery_port,
        fleet_port: args.fleet_port,
        serial_port: args.serial_port,
        baud_rate: args.baud,
        db_path: args.db,
        config_path: args.config,
        ..RuntimeConfig::default()
    };

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  AEGIS-EVAC — Hazard Detection & Evacuation Coordinator");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Fatal startup steps first: settings, database, listeners. Anything
    // that fails after this point degrades instead of exiting.
    let settings_doc =
        SystemConfig::load(&runtime.config_path).context("Failed to load settings document")?;
    let settings = config::shared(settings_doc);

    let storage = Storage::open(&runtime.db_path)
        .await
        .context("Failed to open database")?;

    let fleet_listener = FleetManager::bind(runtime.fleet_port)
        .await
        .with_context(|| format!("Failed to bind fleet port {}", runtime.fleet_port))?;

    let http_listener = tokio::net::TcpListener::bind(&runtime.server_addr)
        .await
        .with_context(|| format!("Failed to bind server address {}", runtime.server_addr))?;

    // ------------------------------------------------------------------
    // Wire the components together (dependency injection, no globals).
    // ------------------------------------------------------------------
    let root_cancel = CancellationToken::new();
    let mut components: Vec<Component> = Vec::new();

    // State store + log sink (stopped last)
    let state_cancel = root_cancel.child_token();
    let (log_tx, log_sink) = storage.spawn_log_sink(state_cancel.clone());
    let store = Arc::new(StateStore::with_log_sink(Some(log_tx)));
    match storage.load_contacts().await {
        Ok(contacts) => {
            info!(count = contacts.len(), "GSM contacts loaded");
            store.seed_contacts(contacts);
        }
        Err(e) => warn!(error = %e, "Could not load GSM contacts, starting empty"),
    }
    info!(access_code = %store.access_code(), "Pairing code generated");

    // Serial sensor link
    let serial_cancel = root_cancel.child_token();
    let (serial_handle, serial_task) = serial::spawn(&runtime, Arc::clone(&store), serial_cancel.clone());

    // Worker fleet
    let fleet_cancel = root_cancel.child_token();
    let fleet = Arc::new(FleetManager::new(Arc::clone(&store)));
    let fleet_tasks = vec![
        tokio::spawn(Arc::clone(&fleet).run_listener(fleet_listener, fleet_cancel.clone())),
        tokio::spawn(Arc::clone(&fleet).run_reaper(fleet_cancel.clone())),
        tokio::spawn(discovery::run_announcer(
            runtime.discovery_port,
            runtime.fleet_port,
            runtime.system_tag.clone(),
            fleet_cancel.clone(),
        )),
    ];

    // Vision pipeline
    let vision_cancel = root_cancel.child_token();
    let vision = Arc::new(VisionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&fleet),
        Box::new(NullDetector),
        Arc::clone(&settings),
        vision_cancel.clone(),
    ));
    for entry in &args.cameras {
        match entry.split_once('=') {
            Some((id, url)) => {
                Arc::clone(&vision).add_camera(id, url);
                info!(camera = id, url = url, "Camera registered");
            }
            None => warn!(value = %entry, "Ignoring malformed --camera (expected id=url)"),
        }
    }

    // Control engine
    let control_cancel = root_cancel.child_token();
    let control = ControlEngine::new(
        Arc::clone(&store),
        Arc::new(serial_handle.clone()),
        control_cancel.clone(),
    );
    let control_task = Arc::clone(&control).start();

    // WebSocket broadcaster
    let clients = ClientRegistry::new();
    let broadcaster_cancel = root_cancel.child_token();
    let broadcaster_task = tokio::spawn(api::ws::run_broadcaster(
        Arc::clone(&store),
        clients.clone(),
        broadcaster_cancel.clone(),
    ));

    // HTTP server
    let api_cancel = root_cancel.child_token();
    let api_state = ApiState {
        store: Arc::clone(&store),
        control: Arc::clone(&control),
        fleet: Arc::clone(&fleet),
        vision: Arc::clone(&vision),
        storage: storage.clone(),
        settings: Arc::clone(&settings),
        clients,
        config_path: runtime.config_path.clone(),
        started_at: Instant::now(),
        cancel: api_cancel.clone(),
    };
    let app = api::create_app(api_state);
    let server_cancel = api_cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await
        {
            warn!(error = %e, "HTTP server exited with error");
        }
    });

    info!(addr = %runtime.server_addr, "Dashboard API listening");
    info!(
        fleet_port = runtime.fleet_port,
        discovery_port = runtime.discovery_port,
        "Fleet services running"
    );

    // Shutdown order matters: stop ingress first, the state store last so
    // every component can still record its teardown.
    components.push(Component {
        name: "api",
        cancel: api_cancel,
        tasks: vec![server_task],
    });
    components.push(Component {
        name: "broadcaster",
        cancel: broadcaster_cancel,
        tasks: vec![broadcaster_task],
    });
    components.push(Component {
        name: "control",
        cancel: control_cancel,
        tasks: vec![control_task],
    });
    components.push(Component {
        name: "vision",
        cancel: vision_cancel,
        tasks: Vec::new(), // camera tasks are children of this token
    });
    components.push(Component {
        name: "fleet",
        cancel: fleet_cancel,
        tasks: fleet_tasks,
    });
    components.push(Component {
        name: "serial",
        cancel: serial_cancel,
        tasks: vec![serial_task],
    });
    components.push(Component {
        name: "state",
        cancel: state_cancel,
        tasks: vec![log_sink],
    });

    // Wait for Ctrl+C
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    for component in components {
        stop_component(component).await;
    }

    info!("AEGIS-EVAC shutdown complete");
    Ok(())
}
