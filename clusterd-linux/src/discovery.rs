//! Which configured nodes are remote: local interface addresses are filtered out.

use std::collections::HashSet;
use std::net::IpAddr;

use nix::ifaddrs::getifaddrs;

/// Every address bound to a local interface.
pub fn local_addresses() -> nix::Result<HashSet<IpAddr>> {
    let mut out = HashSet::new();
    for ifaddr in getifaddrs()? {
        let Some(addr) = ifaddr.address else {
            continue;
        };
        if let Some(v4) = addr.as_sockaddr_in() {
            out.insert(IpAddr::V4(v4.ip()));
        } else if let Some(v6) = addr.as_sockaddr_in6() {
            out.insert(IpAddr::V6(v6.ip()));
        }
    }
    Ok(out)
}

/// Configured nodes that are not this host, in config order.
pub fn remote_nodes(nodes: &[IpAddr], local: &HashSet<IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|ip| !local.contains(ip) && seen.insert(**ip))
        .copied()
        .collect()
}
