//! Outbound address detection.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

/// Any routable address works; connecting a UDP socket sends nothing.
const ROUTE_TARGET: &str = "8.8.8.8:80";

/// Address the host uses for outbound traffic, as seen by its peers.
pub async fn detect() -> Result<String> {
    detect_via(ROUTE_TARGET).await
}

async fn detect_via(target: &str) -> Result<String> {
    let target: SocketAddr = target.parse().context("parse route target")?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await.context("bind route socket")?;
    socket
        .connect(target)
        .await
        .with_context(|| format!("route to {target}"))?;
    let local = socket.local_addr().context("read route socket address")?;
    Ok(render(local.ip()))
}

fn render(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| v6.to_string()),
        IpAddr::V4(v4) => v4.to_string(),
    }
}
