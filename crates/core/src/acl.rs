//! Per-camera network access list.

use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// Ordered set of allowed network prefixes.
///
/// An empty list admits every address. Otherwise an address is admitted iff
/// at least one prefix contains it. IPv4-mapped IPv6 addresses
/// (`::ffff:10.0.0.5`) are compared as the IPv4 address they carry, so a
/// dual-stack listener does not bypass IPv4 prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    prefixes: Vec<IpNet>,
}

impl AccessList {
    pub fn new(prefixes: Vec<IpNet>) -> Self {
        Self { prefixes }
    }

    /// Admit-everything list.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn prefixes(&self) -> &[IpNet] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Whether `ip` may access the camera.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        let allowed = self.prefixes.iter().any(|prefix| prefix.contains(&ip));
        if !allowed {
            tracing::debug!(%ip, acl = ?self.prefixes, "address not in access list");
        }
        allowed
    }

    /// Whether the peer at `addr` may access the camera.
    pub fn allows_peer(&self, addr: SocketAddr) -> bool {
        self.allows(addr.ip())
    }
}

impl From<Vec<IpNet>> for AccessList {
    fn from(prefixes: Vec<IpNet>) -> Self {
        Self::new(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(prefixes: &[&str]) -> AccessList {
        AccessList::new(prefixes.iter().map(|p| p.parse().unwrap()).collect())
    }

    #[test]
    fn empty_list_admits_everything() {
        let list = AccessList::allow_all();
        assert!(list.allows("10.0.0.5".parse().unwrap()));
        assert!(list.allows("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn prefix_membership() {
        let list = acl(&["10.0.0.0/24"]);
        assert!(list.allows("10.0.0.5".parse().unwrap()));
        assert!(!list.allows("10.0.1.5".parse().unwrap()));
    }

    #[test]
    fn any_prefix_suffices() {
        let list = acl(&["192.168.1.0/24", "10.0.0.0/8", "fd00::/8"]);
        assert!(list.allows("10.200.3.4".parse().unwrap()));
        assert!(list.allows("fd12::1".parse().unwrap()));
        assert!(!list.allows("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn mapped_ipv4_matches_ipv4_prefix() {
        let list = acl(&["10.0.0.0/24"]);
        assert!(list.allows("::ffff:10.0.0.5".parse().unwrap()));
        assert!(!list.allows("::ffff:10.0.1.5".parse().unwrap()));
    }

    #[test]
    fn peer_port_ignored() {
        let list = acl(&["127.0.0.1/32"]);
        assert!(list.allows_peer("127.0.0.1:51234".parse().unwrap()));
        assert!(!list.allows_peer("127.0.0.2:51234".parse().unwrap()));
    }
}
