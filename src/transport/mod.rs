// =============================================================================
// KLHDV transport — multicast discovery, subscribe, publish
// =============================================================================
//
// Speaks the dyno's multicast wire protocol. Socket setup is shared by every
// operation: reuse-address, bind on the configured interface, join the
// multicast group. Interface resolution accepts a literal IPv4 address or a
// resolvable hostname and fails with a transport error naming the interface,
// not a generic socket error.
// =============================================================================

pub mod discovery;
pub mod publish;
pub mod subscribe;
pub mod wire;

use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::errors::{EngineError, EngineResult};

/// Default multicast group the dyno announces on.
pub const DEFAULT_MCAST_GROUP: &str = "224.0.2.10";
/// Default KLHDV port.
pub const DEFAULT_PORT: u16 = 22344;
/// Default listen interface.
pub const DEFAULT_IFACE: &str = "0.0.0.0";

/// Network parameters for the KLHDV transport.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransportConfig {
    pub multicast_group: String,
    pub port: u16,
    pub iface: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MCAST_GROUP.to_string(),
            port: DEFAULT_PORT,
            iface: DEFAULT_IFACE.to_string(),
        }
    }
}

impl TransportConfig {
    /// Read transport parameters from the environment, falling back to the
    /// documented defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            multicast_group: std::env::var("KLHDV_MCAST_GROUP")
                .unwrap_or(defaults.multicast_group),
            port: std::env::var("KLHDV_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            iface: std::env::var("KLHDV_IFACE").unwrap_or(defaults.iface),
        }
    }

    /// Parse the configured multicast group address.
    pub fn group_addr(&self) -> EngineResult<Ipv4Addr> {
        self.multicast_group.parse::<Ipv4Addr>().map_err(|_| {
            EngineError::Transport(format!(
                "invalid multicast group '{}'",
                self.multicast_group
            ))
        })
    }
}

/// Resolve the configured interface to an IPv4 address. A dotted-quad is used
/// directly; anything else goes through DNS. Failure names the interface.
pub fn resolve_iface_address(iface: &str) -> EngineResult<Ipv4Addr> {
    let target = iface.trim();
    let target = if target.is_empty() { DEFAULT_IFACE } else { target };

    if let Ok(addr) = target.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let candidates = (target, 0u16)
        .to_socket_addrs()
        .map_err(|e| EngineError::Transport(format!("invalid interface '{iface}': {e}")))?;

    for addr in candidates {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(EngineError::Transport(format!(
        "interface '{iface}' did not resolve to an IPv4 address"
    )))
}

/// Build a non-blocking UDP socket bound on the configured interface/port and
/// joined to the multicast group, wrapped for tokio.
pub fn make_socket(cfg: &TransportConfig) -> EngineResult<UdpSocket> {
    let iface_ip = resolve_iface_address(&cfg.iface)?;
    let group = cfg.group_addr()?;

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| EngineError::Transport(format!("failed to create UDP socket: {e}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| EngineError::Transport(format!("failed to set reuse-address: {e}")))?;
    #[cfg(unix)]
    let _ = socket.set_reuse_port(true);

    let bind_addr = SocketAddrV4::new(iface_ip, cfg.port);
    socket.bind(&bind_addr.into()).map_err(|e| {
        EngineError::Transport(format!("failed to bind KLHDV socket on {bind_addr}: {e}"))
    })?;

    socket.join_multicast_v4(&group, &iface_ip).map_err(|e| {
        EngineError::Transport(format!(
            "failed to join multicast group {group} on {iface_ip}: {e}"
        ))
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| EngineError::Transport(format!("failed to set non-blocking: {e}")))?;

    debug!(group = %group, iface = %iface_ip, port = cfg.port, "KLHDV socket joined");

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|e| EngineError::Transport(format!("failed to register socket with tokio: {e}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.multicast_group, "224.0.2.10");
        assert_eq!(cfg.port, 22344);
        assert_eq!(cfg.iface, "0.0.0.0");
    }

    #[test]
    fn literal_address_resolves_directly() {
        assert_eq!(
            resolve_iface_address("192.168.1.10").unwrap(),
            Ipv4Addr::new(192, 168, 1, 10)
        );
    }

    #[test]
    fn empty_interface_falls_back_to_any() {
        assert_eq!(resolve_iface_address("").unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(resolve_iface_address("  ").unwrap(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn localhost_resolves_via_dns() {
        let addr = resolve_iface_address("localhost").unwrap();
        assert!(addr.is_loopback());
    }

    #[test]
    fn unresolvable_interface_names_the_interface() {
        let err = resolve_iface_address("no-such-host.invalid.").unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("no-such-host.invalid."));
    }

    #[test]
    fn bad_group_is_a_transport_error() {
        let cfg = TransportConfig {
            multicast_group: "not-an-ip".into(),
            ..TransportConfig::default()
        };
        assert_eq!(cfg.group_addr().unwrap_err().kind(), "transport");
    }
}
