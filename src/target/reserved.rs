use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

const RESERVED_IPV4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

const RESERVED_IPV6: &[&str] = &[
    "::1/128",
    "64:ff9b::/96",
    "100::/64",
    "2001::/32",
    "2001:20::/28",
    "2001:db8::/32",
    "2002::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

static NOT_SCANNABLE_V4: LazyLock<Vec<Ipv4Network>> =
    LazyLock::new(|| RESERVED_IPV4.iter().filter_map(|net| net.parse().ok()).collect());

static NOT_SCANNABLE_V6: LazyLock<Vec<Ipv6Network>> =
    LazyLock::new(|| RESERVED_IPV6.iter().filter_map(|net| net.parse().ok()).collect());

/// Reserved IPv4 ranges, in declaration order.
pub fn reserved_v4() -> &'static [Ipv4Network] {
    &NOT_SCANNABLE_V4
}

/// Reserved IPv6 ranges, in declaration order.
pub fn reserved_v6() -> &'static [Ipv6Network] {
    &NOT_SCANNABLE_V6
}

pub fn is_reserved_v4(addr: Ipv4Addr) -> bool {
    NOT_SCANNABLE_V4.iter().any(|net| net.contains(addr))
}

/// IPv4-mapped addresses are checked against the IPv4 table as well.
pub fn is_reserved_v6(addr: Ipv6Addr) -> bool {
    if let Some(v4) = addr.to_ipv4_mapped() {
        return is_reserved_v4(v4);
    }
    NOT_SCANNABLE_V6.iter().any(|net| net.contains(addr))
}

pub fn is_reserved_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

/// A network is reserved when it overlaps any reserved range.
pub fn is_reserved_network(network: IpNetwork) -> bool {
    match network {
        IpNetwork::V4(net) => NOT_SCANNABLE_V4
            .iter()
            .any(|reserved| reserved.contains(net.network()) || net.contains(reserved.network())),
        IpNetwork::V6(net) => NOT_SCANNABLE_V6
            .iter()
            .any(|reserved| reserved.contains(net.network()) || net.contains(reserved.network())),
    }
}
