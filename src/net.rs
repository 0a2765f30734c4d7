//! Local network interface helpers.
//!
//! Used to pin discovery and advertisement to the interfaces of a configured
//! subnet, and to recognize our own addresses in discovered entries.

use ipnet::IpNet;
use std::io;
use std::net::IpAddr;

/// Names of the interfaces that own an address inside `subnet`.
///
/// An empty result means no interface matched; callers treat that as "use
/// all interfaces" after logging.
pub fn interfaces_for_subnet(subnet: &IpNet) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if subnet.contains(&iface.ip()) && !names.contains(&iface.name) {
            names.push(iface.name.clone());
        }
    }
    Ok(names)
}

/// Whether any local interface owns exactly this address.
pub fn is_local_address(ip: IpAddr) -> bool {
    if_addrs::get_if_addrs()
        .map(|ifaces| ifaces.iter().any(|iface| iface.ip() == ip))
        .unwrap_or(false)
}
