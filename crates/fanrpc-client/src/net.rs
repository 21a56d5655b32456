use std::net::{IpAddr, SocketAddr};

/// How an address string names its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// Literal `ip:port` or `[ipv6]:port`
    Ip,
    /// `host:port` with a resolvable host name
    Dns,
    /// Missing port or malformed host
    Invalid,
}

/// Classifies `addr` without touching the resolver.
pub fn addr_kind(addr: &str) -> AddrKind {
    if addr.parse::<SocketAddr>().is_ok() {
        return AddrKind::Ip;
    }
    let Some((host, port)) = split_host_port(addr) else {
        return AddrKind::Invalid;
    };
    if port.parse::<u16>().is_err() {
        return AddrKind::Invalid;
    }
    if host.parse::<IpAddr>().is_ok() {
        return AddrKind::Ip;
    }
    if is_valid_hostname(host) {
        AddrKind::Dns
    } else {
        AddrKind::Invalid
    }
}

pub fn is_ip_addr(addr: &str) -> bool {
    addr_kind(addr) == AddrKind::Ip
}

/// Splits `host:port`, stripping the brackets of an IPv6 host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || port.is_empty() {
        return None;
    }
    Some((host, port))
}

fn is_valid_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
