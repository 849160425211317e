use std::net::IpAddr;

use local_ip_address::{list_afinet_netifas, local_ip};
use tracing::{debug, warn};

pub trait AddressResolver: Send + Sync {
    /// Address a device on the local network can reach this machine on.
    fn resolve_local_address(&self, adapter_hint: Option<&str>) -> Option<String>;
}

/// Resolves against the host's network interfaces.
#[derive(Debug, Default)]
pub struct InterfaceAddressResolver;

impl AddressResolver for InterfaceAddressResolver {
    fn resolve_local_address(&self, adapter_hint: Option<&str>) -> Option<String> {
        let interfaces = match list_afinet_netifas() {
            Ok(interfaces) => interfaces,
            Err(err) => {
                warn!("failed to list network interfaces: {}", err);
                Vec::new()
            }
        };
        let default_route = local_ip().ok();
        let address = select_address(&interfaces, adapter_hint, default_route);
        debug!(adapter = ?adapter_hint, address = ?address, "resolved local address");
        address
    }
}

/// Picks the pairing address from `(interface name, address)` pairs.
///
/// Only non-loopback IPv4 addresses qualify. A matching adapter hint wins;
/// otherwise the default-route address is used if it qualifies, then the first
/// qualifying interface.
pub fn select_address(
    interfaces: &[(String, IpAddr)],
    adapter_hint: Option<&str>,
    default_route: Option<IpAddr>,
) -> Option<String> {
    let usable = |ip: &IpAddr| ip.is_ipv4() && !ip.is_loopback();

    if let Some(hint) = adapter_hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some((_, ip)) = interfaces
            .iter()
            .find(|(name, ip)| name == hint && usable(ip))
        {
            return Some(ip.to_string());
        }
        debug!(adapter = hint, "adapter has no usable address; using automatic selection");
    }

    if let Some(ip) = default_route.filter(usable) {
        return Some(ip.to_string());
    }

    interfaces
        .iter()
        .map(|(_, ip)| ip)
        .find(|ip| usable(*ip))
        .map(IpAddr::to_string)
}

/// Always answers with the same address; for hosts that already know it.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressResolver {
    address: Option<String>,
}

impl StaticAddressResolver {
    pub fn new(address: Option<String>) -> Self {
        Self { address }
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve_local_address(&self, _adapter_hint: Option<&str>) -> Option<String> {
        self.address.clone()
    }
}
