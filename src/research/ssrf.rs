//! The one place that decides whether an address may be contacted.
//!
//! Every outbound research request is checked here against the resolved
//! addresses, and the fetch is then pinned to those same addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ResearchError;

/// True for loopback, private, link-local, shared, reserved, documentation,
/// multicast, and any IPv6 form that embeds one of those IPv4 ranges.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 0                                   // 0.0.0.0/8 "this network"
        || a == 10                           // 10/8 private
        || (a == 100 && (b & 0xc0) == 64)    // 100.64/10 CGNAT
        || a == 127                          // loopback
        || (a == 169 && b == 254)            // link-local
        || (a == 172 && (b & 0xf0) == 16)    // 172.16/12 private
        || (a == 192 && b == 0 && c == 0)    // 192.0.0/24 IETF assignments
        || (a == 192 && b == 0 && c == 2)    // TEST-NET-1
        || (a == 192 && b == 168)            // 192.168/16 private
        || (a == 198 && (b & 0xfe) == 18)    // 198.18/15 benchmarking
        || (a == 198 && b == 51 && c == 100) // TEST-NET-2
        || (a == 203 && b == 0 && c == 113)  // TEST-NET-3
        || a >= 224 // multicast, reserved, broadcast
}

fn v4_from(hi: u16, lo: u16) -> Ipv4Addr {
    let [a, b] = hi.to_be_bytes();
    let [c, d] = lo.to_be_bytes();
    Ipv4Addr::new(a, b, c, d)
}

/// IPv4 addresses carried inside an IPv6 address, for every transition
/// format a resolver might hand back.
fn embedded_v4(ip: Ipv6Addr) -> Vec<Ipv4Addr> {
    let s = ip.segments();
    let mut out = Vec::new();

    // ::ffff:a.b.c.d (mapped) and ::a.b.c.d (compatible)
    if s[..5] == [0; 5] && (s[5] == 0xffff || s[5] == 0) {
        out.push(v4_from(s[6], s[7]));
    }
    // ::ffff:0:a.b.c.d (translated)
    if s[..4] == [0; 4] && s[4] == 0xffff && s[5] == 0 {
        out.push(v4_from(s[6], s[7]));
    }
    // 64:ff9b::/96 NAT64
    if s[0] == 0x64 && s[1] == 0xff9b && s[2..6] == [0; 4] {
        out.push(v4_from(s[6], s[7]));
    }
    // 2002::/16 6to4
    if s[0] == 0x2002 {
        out.push(v4_from(s[1], s[2]));
    }
    // 2001::/32 Teredo: server in 32..63, client obfuscated in 96..127
    if s[0] == 0x2001 && s[1] == 0 {
        out.push(v4_from(s[2], s[3]));
        out.push(v4_from(!s[6], !s[7]));
    }
    out
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    if ip.is_unspecified() || ip.is_loopback() {
        return true;
    }
    if (s[0] & 0xfe00) == 0xfc00    // fc00::/7 ULA
        || (s[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
        || (s[0] & 0xffc0) == 0xfec0 // fec0::/10 site-local
        || (s[0] & 0xff00) == 0xff00 // ff00::/8 multicast
        || (s[0] == 0x2001 && s[1] == 0x0db8) // documentation
        || (s[0] == 0x64 && s[1] == 0xff9b && s[2] == 1)
    // 64:ff9b:1::/48 local-use NAT64
    {
        return true;
    }
    embedded_v4(ip).into_iter().any(is_forbidden_v4)
}

/// Reject a domain if any resolved address is forbidden, or if it resolved to nothing.
pub fn check_resolved(domain: &str, addresses: &[IpAddr]) -> Result<(), ResearchError> {
    let forbidden: Vec<IpAddr> = addresses
        .iter()
        .copied()
        .filter(|ip| is_forbidden_ip(*ip))
        .collect();
    if !forbidden.is_empty() || addresses.is_empty() {
        return Err(ResearchError::SsrfBlocked {
            domain: domain.to_string(),
            addresses: forbidden,
        });
    }
    Ok(())
}
