//! Client identity resolution.
//!
//! A connection's effective IP and "secure" flag are decided once, between
//! the WebSocket upgrade and the upstream dial, from three inputs: a PROXY
//! protocol header decoded by the listener, the `X-Forwarded-For` /
//! `X-Forwarded-Proto` request headers, and the snapshot's trusted-proxy
//! network list. Untrusted peers cannot spoof either value.

use std::net::IpAddr;

use ipnet::IpNet;

/// Identity attributed to one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    /// Client IP asserted by a trusted intermediary, when one was accepted.
    pub proxied_ip: Option<IpAddr>,
    /// Whether the client's hop to us is considered encrypted.
    pub secure: bool,
}

/// Forwarding-relevant HTTP request headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardingHeaders<'a> {
    pub forwarded_for: Option<&'a str>,
    pub forwarded_proto: Option<&'a str>,
}

pub fn ip_in_nets(ip: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// Walk an `X-Forwarded-For` value from right to left, peeling addresses
/// belonging to trusted proxies, and return the first untrusted one (the
/// real client as seen by the outermost trusted hop). If every address is
/// trusted, the leftmost wins. Any unparseable entry voids the header.
pub fn forwarded_for_ip(header: &str, trusted: &[IpNet]) -> Option<IpAddr> {
    let mut candidate = None;
    for entry in header.rsplit(',') {
        let ip: IpAddr = entry.trim().parse().ok()?;
        if !ip_in_nets(ip, trusted) {
            return Some(ip);
        }
        candidate = Some(ip);
    }
    candidate
}

/// Decide the connection's effective identity.
///
/// * A PROXY-header IP survives only if the transport peer is in the trusted
///   list; anything else is spoofing and is dropped.
/// * Failing that, `X-Forwarded-For` is consulted (right to left); the result
///   is kept only when it differs from the transport peer, since a redundant
///   header carries no information.
/// * `secure` is set when we terminated TLS ourselves or the listener is a
///   Tor listener; otherwise only a trusted peer claiming
///   `X-Forwarded-Proto: https` is believed.
pub fn resolve_identity(
    proxied_ip: Option<IpAddr>,
    peer_ip: IpAddr,
    tls_terminated: bool,
    tor: bool,
    headers: ForwardingHeaders<'_>,
    trusted: &[IpNet],
) -> ConnInfo {
    let peer_trusted = ip_in_nets(peer_ip, trusted);

    let mut effective = None;
    if let Some(ip) = proxied_ip {
        if peer_trusted {
            effective = Some(ip);
        }
    } else if let Some(header) = headers.forwarded_for {
        if let Some(ip) = forwarded_for_ip(header, trusted) {
            if ip != peer_ip {
                effective = Some(ip);
            }
        }
    }

    let secure = if tls_terminated || tor {
        true
    } else {
        peer_trusted && headers.forwarded_proto == Some("https")
    };

    ConnInfo {
        proxied_ip: effective,
        secure,
    }
}

/// Render an IP the way it must appear as an IRC hostname-style parameter:
/// IPv6 strings beginning with `:` get a `0` prefix so the value can never
/// be mistaken for a trailing-parameter marker.
pub fn ip_to_hostname_string(ip: IpAddr) -> String {
    let s = ip.to_string();
    if s.starts_with(':') {
        format!("0{s}")
    } else {
        s
    }
}
