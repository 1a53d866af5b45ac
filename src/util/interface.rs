//! Network interface discovery.
//!
//! IPv4 address enumeration via `getifaddrs`, interface indexes via
//! `/sys/class/net` on Linux with an `if_nametoindex` fallback.

use std::net::Ipv4Addr;

use super::NetworkInterface;
use crate::types::is_public_ipv4;

/// Every IPv4 address on every interface, one entry per address.
#[cfg(unix)]
pub fn get_network_interfaces() -> Vec<NetworkInterface> {
    use std::ffi::CStr;

    let mut interfaces = Vec::new();

    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return interfaces;
    }

    let mut cursor = ifap;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;

        if ifa.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family };
        if family != libc::AF_INET as libc::sa_family_t {
            continue;
        }

        let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
        let address = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        let flags = ifa.ifa_flags;

        interfaces.push(NetworkInterface {
            index: interface_index(&name).unwrap_or(0),
            name,
            address,
            is_up: flags & libc::IFF_UP as u32 != 0,
            is_loopback: flags & libc::IFF_LOOPBACK as u32 != 0,
        });
    }

    unsafe { libc::freeifaddrs(ifap) };
    interfaces
}

#[cfg(not(unix))]
pub fn get_network_interfaces() -> Vec<NetworkInterface> {
    vec![]
}

/// The kernel's index for a named interface.
pub fn interface_index(name: &str) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string(format!("/sys/class/net/{name}/ifindex")) {
            if let Ok(index) = content.trim().parse() {
                return Some(index);
            }
        }
    }

    #[cfg(unix)]
    {
        let cname = std::ffi::CString::new(name).ok()?;
        match unsafe { libc::if_nametoindex(cname.as_ptr()) } {
            0 => None,
            index => Some(index),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = name;
        None
    }
}

/// WAN-usable IPv4 addresses assigned to a named interface.
pub fn interface_wan_ips(name: &str) -> Vec<Ipv4Addr> {
    get_network_interfaces()
        .into_iter()
        .filter(|iface| iface.name == name && iface.is_wan_candidate())
        .map(|iface| iface.address)
        .collect()
}

/// Public IPv4 addresses across all interfaces, for the probe server's
/// bind set. Private ranges are excluded here: a reflector must be
/// reachable from anywhere.
pub fn public_ipv4s() -> Vec<Ipv4Addr> {
    get_network_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up && !iface.is_loopback && is_public_ipv4(iface.address))
        .map(|iface| iface.address)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn enumerates_loopback() {
        let interfaces = get_network_interfaces();
        let lo = interfaces
            .iter()
            .find(|i| i.address == Ipv4Addr::LOCALHOST)
            .expect("loopback interface with 127.0.0.1");
        assert!(lo.is_loopback);
        assert!(lo.is_up);
        assert_ne!(lo.index, 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn loopback_has_an_index() {
        assert!(interface_index("lo").is_some());
        assert!(interface_index("definitely-not-a-nic").is_none());
    }

    #[test]
    #[cfg(unix)]
    fn loopback_is_not_a_wan_candidate() {
        let lo = get_network_interfaces()
            .into_iter()
            .find(|i| i.address == Ipv4Addr::LOCALHOST)
            .unwrap();
        assert!(!lo.is_wan_candidate());
        assert!(!interface_wan_ips(&lo.name).contains(&Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn public_set_never_contains_loopback_or_private() {
        for ip in public_ipv4s() {
            assert!(is_public_ipv4(ip), "{ip} leaked into the public set");
        }
    }
}
