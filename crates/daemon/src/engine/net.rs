//! Host address discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Fallback when the host has no usable address.
pub const LOOPBACK: &str = "127.0.0.1";

/// Returns the local IP the host would use to reach the internet.
///
/// Connecting a UDP socket only selects a route; nothing is sent. Hosts
/// without a default route fall back to the first non-loopback IPv4
/// interface address, then to loopback.
pub fn outbound_ip() -> String {
    route_source_ip()
        .or_else(interface_ip)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| LOOPBACK.to_string())
}

fn route_source_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

fn interface_ip() -> Option<IpAddr> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    first_lan_ipv4(interfaces.iter().map(|iface| iface.ip()))
}

fn first_lan_ipv4(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addrs.into_iter().find(|ip| match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_unspecified(),
        IpAddr::V6(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_outbound_ip_is_parseable() {
        let ip: IpAddr = outbound_ip().parse().unwrap();
        assert!(!ip.is_unspecified());
    }

    #[test]
    fn test_interface_fallback_skips_loopback_and_ipv6() {
        let addrs = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        ];
        assert_eq!(
            first_lan_ipv4(addrs),
            Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
        assert_eq!(first_lan_ipv4([IpAddr::V4(Ipv4Addr::LOCALHOST)]), None);
    }
}
