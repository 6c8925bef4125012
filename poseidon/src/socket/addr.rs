use std::fmt;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// An IPv6 socket address: a 16-byte address plus a port.
///
/// IPv4 addresses are stored IPv4-mapped (`::ffff:a.b.c.d`) so one
/// representation covers both families; parsing and printing use the
/// family's conventional form (`a.b.c.d:p` or `[v6]:p`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SocketAddress {
    addr: [u8; 16],
    port: u16,
}

/// `::`
pub const IPV6_UNSPECIFIED: SocketAddress = SocketAddress {
    addr: [0; 16],
    port: 0,
};

/// `::1`
pub const IPV6_LOOPBACK: SocketAddress = SocketAddress {
    addr: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
    port: 0,
};

/// `100::`, the discard prefix; returned when a real address is
/// unavailable.
pub const IPV6_INVALID: SocketAddress = SocketAddress {
    addr: [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    port: 0,
};

/// `::ffff:0.0.0.0`
pub const IPV4_UNSPECIFIED: SocketAddress = SocketAddress {
    addr: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0, 0, 0, 0],
    port: 0,
};

/// `::ffff:127.0.0.1`
pub const IPV4_LOOPBACK: SocketAddress = SocketAddress {
    addr: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 127, 0, 0, 1],
    port: 0,
};

/// `::ffff:255.255.255.255`
pub const IPV4_BROADCAST: SocketAddress = SocketAddress {
    addr: [
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    ],
    port: 0,
};

/// Coarse address class, shared by IPv4 and IPv6, so policy layers can
/// decide without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddressClass {
    Unspecified,
    Loopback,
    LinkLocal,
    Private,
    Multicast,
    Broadcast,
    Reserved,
    Public,
}

impl SocketAddress {
    pub const fn new(addr: [u8; 16], port: u16) -> Self {
        Self { addr, port }
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            addr: self.addr,
            port,
        }
    }

    pub fn addr(&self) -> &[u8; 16] {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn ipv6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.addr)
    }

    /// Classifies the address; IPv4-mapped addresses use IPv4 rules.
    pub fn classify(&self) -> IpAddressClass {
        if let Some(v4) = self.ipv6().to_ipv4_mapped() {
            let octets = v4.octets();
            return match octets {
                [0, 0, 0, 0] => IpAddressClass::Unspecified,
                [127, ..] => IpAddressClass::Loopback,
                [169, 254, ..] => IpAddressClass::LinkLocal,
                [255, 255, 255, 255] => IpAddressClass::Broadcast,
                [10, ..] => IpAddressClass::Private,
                [172, b, ..] if (16..=31).contains(&b) => IpAddressClass::Private,
                [192, 168, ..] => IpAddressClass::Private,
                [a, ..] if a >= 224 => IpAddressClass::Multicast,
                _ => IpAddressClass::Public,
            };
        }

        let a = &self.addr;
        if a.iter().all(|&b| b == 0) {
            IpAddressClass::Unspecified
        } else if *a == IPV6_LOOPBACK.addr {
            IpAddressClass::Loopback
        } else if a[0] == 0xFE && (a[1] & 0xC0) == 0x80 {
            IpAddressClass::LinkLocal
        } else if (a[0] & 0xFE) == 0xFC {
            IpAddressClass::Private
        } else if a[0] == 0xFF {
            IpAddressClass::Multicast
        } else if a[0] == 0x01 && a[1..8].iter().all(|&b| b == 0) {
            // 100::/64, the discard prefix.
            IpAddressClass::Reserved
        } else {
            IpAddressClass::Public
        }
    }

    pub(crate) fn to_sockaddr_in6(self) -> libc::sockaddr_in6 {
        let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa.sin6_port = self.port.to_be();
        sa.sin6_addr.s6_addr = self.addr;
        sa
    }

    pub(crate) fn from_sockaddr_in6(sa: &libc::sockaddr_in6) -> Self {
        Self {
            addr: sa.sin6_addr.s6_addr,
            port: u16::from_be(sa.sin6_port),
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => Self {
                addr: v4.ip().to_ipv6_mapped().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self {
                addr: v6.ip().octets(),
                port: v6.port(),
            },
        }
    }
}

impl From<SocketAddress> for SocketAddr {
    fn from(addr: SocketAddress) -> Self {
        match addr.ipv6().to_ipv4_mapped() {
            Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, addr.port)),
            None => SocketAddr::V6(SocketAddrV6::new(addr.ipv6(), addr.port, 0, 0)),
        }
    }
}

impl FromStr for SocketAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v4) = SocketAddrV4::from_str(s) {
            return Ok(SocketAddr::V4(v4).into());
        }
        SocketAddrV6::from_str(s).map(|v6| SocketAddr::V6(v6).into())
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ipv6().to_ipv4_mapped() {
            Some(v4) => write!(f, "{}:{}", v4, self.port),
            None => write!(f, "[{}]:{}", self.ipv6(), self.port),
        }
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("127.0.0.1:80")]
    #[case("0.0.0.0:0")]
    #[case("192.168.1.23:65535")]
    #[case("[::]:3802")]
    #[case("[::1]:1300")]
    #[case("[fedc:ba98:7654:3210:fedc:ba98:7654:3210]:65535")]
    #[case("[fe80::1]:22")]
    fn test_parse_print_round_trip(#[case] text: &str) {
        let addr: SocketAddress = text.parse().unwrap();
        assert_eq!(addr.to_string(), text);

        let again: SocketAddress = addr.to_string().parse().unwrap();
        assert_eq!(again, addr);
        assert_eq!(again.port(), addr.port());
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "1.2.3.4", "[::1]", "nonsense:80", "1.2.3.4:99999"] {
            assert!(bad.parse::<SocketAddress>().is_err(), "accepted {:?}", bad);
        }
    }

    #[rstest]
    #[case("[::]:0", IpAddressClass::Unspecified)]
    #[case("[::1]:0", IpAddressClass::Loopback)]
    #[case("0.0.0.0:0", IpAddressClass::Unspecified)]
    #[case("127.1.2.3:0", IpAddressClass::Loopback)]
    #[case("169.254.10.10:0", IpAddressClass::LinkLocal)]
    #[case("10.0.0.1:0", IpAddressClass::Private)]
    #[case("172.20.0.1:0", IpAddressClass::Private)]
    #[case("192.168.0.1:0", IpAddressClass::Private)]
    #[case("224.0.0.251:0", IpAddressClass::Multicast)]
    #[case("255.255.255.255:0", IpAddressClass::Broadcast)]
    #[case("93.184.216.34:0", IpAddressClass::Public)]
    #[case("[fe80::1]:0", IpAddressClass::LinkLocal)]
    #[case("[fd00::1]:0", IpAddressClass::Private)]
    #[case("[ff02::1]:0", IpAddressClass::Multicast)]
    #[case("[2606:2800:220:1::1]:0", IpAddressClass::Public)]
    fn test_classify(#[case] text: &str, #[case] expected: IpAddressClass) {
        let addr: SocketAddress = text.parse().unwrap();
        assert_eq!(addr.classify(), expected);
    }

    #[test]
    fn test_invalid_sentinel_is_reserved() {
        assert_eq!(IPV6_INVALID.classify(), IpAddressClass::Reserved);
    }

    #[test]
    fn test_sockaddr_round_trip() {
        let addr: SocketAddress = "[2001:db8::5]:8443".parse().unwrap();
        let sa = addr.to_sockaddr_in6();
        assert_eq!(SocketAddress::from_sockaddr_in6(&sa), addr);
    }

    #[test]
    fn test_v4_mapped_constants() {
        assert_eq!(IPV4_LOOPBACK.to_string(), "127.0.0.1:0");
        assert_eq!(IPV4_BROADCAST.to_string(), "255.255.255.255:0");
        assert_eq!(IPV4_UNSPECIFIED.to_string(), "0.0.0.0:0");
        assert_eq!(IPV6_LOOPBACK.to_string(), "[::1]:0");
    }
}
