//! LAN discovery — periodic UDP broadcast so detached workers can find the
//! coordinator without configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::DISCOVERY_INTERVAL_SECS;

/// Determine the LAN-facing local address by asking the routing table which
/// source address would reach a public host. No packet is sent.
pub fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            Ok(socket.local_addr()?.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Broadcast `server_announce` every two seconds until cancelled.
pub async fn run_announcer(
    discovery_port: u16,
    fleet_port: u16,
    system_tag: String,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "Discovery socket bind failed, announcer disabled");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "SO_BROADCAST failed, announcer disabled");
        return;
    }

    let ip = local_ip();
    let announce = serde_json::json!({
        "type": "server_announce",
        "ip": ip.to_string(),
        "port": fleet_port,
        "system": system_tag,
    })
    .to_string();

    info!(ip = %ip, port = fleet_port, "Discovery announcer running");

    let mut tick = tokio::time::interval(Duration::from_secs(DISCOVERY_INTERVAL_SECS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let target = (Ipv4Addr::BROADCAST, discovery_port);
                if let Err(e) = socket.send_to(announce.as_bytes(), target).await {
                    debug!(error = %e, "Discovery broadcast failed");
                }
            }
        }
    }
    debug!("Discovery announcer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_always_resolves() {
        // Falls back to loopback on machines with no route.
        let ip = local_ip();
        assert!(ip.is_ipv4() || ip.is_ipv6());
    }
}
