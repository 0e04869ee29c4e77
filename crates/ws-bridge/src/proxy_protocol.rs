//! PROXY protocol (v1/v2) decoding.
//!
//! Listeners configured with `proxy: true` expect every accepted connection
//! to begin with a HAProxy PROXY preamble carrying the original peer
//! address. The header is consumed from the raw stream before TLS and HTTP
//! ever see it. Works over any byte stream, so it applies to TCP and Unix
//! listeners alike.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyHeaderError;

/// Longest permitted v1 header line, per the PROXY protocol spec.
const MAX_V1_HEADER_LEN: usize = 107;

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Read and decode one PROXY header from the front of `stream`.
///
/// Returns the advertised source address, or `None` when the header is
/// well-formed but carries no usable address (v1 `UNKNOWN`, v2 `LOCAL`, or a
/// v2 address family we do not route on). The header bytes are consumed
/// either way.
pub async fn read_proxy_header<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    match first[0] {
        b'P' => read_v1(stream).await,
        0x0d => read_v2(stream).await,
        _ => Err(ProxyHeaderError::InvalidSignature),
    }
}

/// v1: one CRLF-terminated ASCII line,
/// `PROXY TCP4|TCP6|UNKNOWN <src> <dst> <sport> <dport>`.
/// The leading `P` has already been consumed.
async fn read_v1<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    // Read byte-by-byte: nothing past the CRLF may be consumed, and the
    // header is short enough for this to be cheap.
    let mut line = vec![b'P'];
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() > MAX_V1_HEADER_LEN {
            return Err(ProxyHeaderError::MalformedV1);
        }
    }

    let header = std::str::from_utf8(&line).map_err(|_| ProxyHeaderError::MalformedV1)?;
    let parts: Vec<&str> = header.trim_end().split(' ').collect();
    if parts.first() != Some(&"PROXY") {
        return Err(ProxyHeaderError::InvalidSignature);
    }
    match parts.get(1) {
        Some(&"TCP4") | Some(&"TCP6") => {}
        // UNKNOWN carries no address; fall back to the transport peer.
        Some(&"UNKNOWN") => return Ok(None),
        _ => return Err(ProxyHeaderError::MalformedV1),
    }
    if parts.len() != 6 {
        return Err(ProxyHeaderError::MalformedV1);
    }

    let ip: IpAddr = parts[2].parse().map_err(|_| ProxyHeaderError::MalformedV1)?;
    let port: u16 = parts[4].parse().map_err(|_| ProxyHeaderError::MalformedV1)?;
    Ok(Some(SocketAddr::new(ip, port)))
}

/// v2: 12-byte signature, version/command byte, family/transport byte,
/// 2-byte length, then the address block. The first signature byte has
/// already been consumed.
async fn read_v2<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<SocketAddr>, ProxyHeaderError> {
    let mut sig = [0u8; 11];
    stream.read_exact(&mut sig).await?;
    if sig[..] != V2_SIGNATURE[1..] {
        return Err(ProxyHeaderError::InvalidSignature);
    }

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let version = head[0] >> 4;
    let command = head[0] & 0x0f;
    let family = head[1] >> 4;
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;

    if version != 2 {
        return Err(ProxyHeaderError::UnsupportedVersion(version));
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;

    // LOCAL: the sender is speaking for itself; keep the transport address.
    if command == 0 {
        return Ok(None);
    }
    if command != 1 {
        return Err(ProxyHeaderError::MalformedV2);
    }

    match family {
        // AF_INET: src (4), dst (4), sport (2), dport (2)
        1 => {
            if data.len() < 12 {
                return Err(ProxyHeaderError::MalformedV2);
            }
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        // AF_INET6: src (16), dst (16), sport (2), dport (2)
        2 => {
            if data.len() < 36 {
                return Err(ProxyHeaderError::MalformedV2);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([data[32], data[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(ip), port)))
        }
        // AF_UNSPEC / AF_UNIX carry nothing we can route on.
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode(bytes: &[u8]) -> Result<Option<SocketAddr>, ProxyHeaderError> {
        let mut stream = bytes;
        read_proxy_header(&mut stream).await
    }

    #[tokio::test]
    async fn v1_tcp4() {
        let addr = decode(b"PROXY TCP4 203.0.113.5 10.0.0.1 56324 443\r\n")
            .await
            .unwrap();
        assert_eq!(addr, Some("203.0.113.5:56324".parse().unwrap()));
    }

    #[tokio::test]
    async fn v1_tcp6() {
        let addr = decode(b"PROXY TCP6 2001:db8::1 2001:db8::2 4000 443\r\n")
            .await
            .unwrap();
        assert_eq!(addr, Some("[2001:db8::1]:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn v1_unknown_yields_no_address() {
        let addr = decode(b"PROXY UNKNOWN\r\n").await.unwrap();
        assert_eq!(addr, None);
    }

    #[tokio::test]
    async fn v1_overlong_is_rejected() {
        let mut header = b"PROXY TCP4 ".to_vec();
        header.extend(std::iter::repeat(b'1').take(200));
        header.extend_from_slice(b"\r\n");
        assert!(matches!(
            decode(&header).await,
            Err(ProxyHeaderError::MalformedV1)
        ));
    }

    #[tokio::test]
    async fn v1_bad_address_is_rejected() {
        assert!(matches!(
            decode(b"PROXY TCP4 not-an-ip 10.0.0.1 1 2\r\n").await,
            Err(ProxyHeaderError::MalformedV1)
        ));
    }

    fn v2_header(command: u8, family: u8, data: &[u8]) -> Vec<u8> {
        let mut out = V2_SIGNATURE.to_vec();
        out.push(0x20 | command);
        out.push(family << 4 | 0x01);
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    #[tokio::test]
    async fn v2_inet() {
        let mut data = vec![203, 0, 113, 5, 10, 0, 0, 1];
        data.extend_from_slice(&56324u16.to_be_bytes());
        data.extend_from_slice(&443u16.to_be_bytes());
        let addr = decode(&v2_header(1, 1, &data)).await.unwrap();
        assert_eq!(addr, Some("203.0.113.5:56324".parse().unwrap()));
    }

    #[tokio::test]
    async fn v2_inet6() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut data = src.octets().to_vec();
        data.extend_from_slice(&dst.octets());
        data.extend_from_slice(&4000u16.to_be_bytes());
        data.extend_from_slice(&443u16.to_be_bytes());
        let addr = decode(&v2_header(1, 2, &data)).await.unwrap();
        assert_eq!(addr, Some("[2001:db8::1]:4000".parse().unwrap()));
    }

    #[tokio::test]
    async fn v2_local_yields_no_address() {
        let addr = decode(&v2_header(0, 0, &[])).await.unwrap();
        assert_eq!(addr, None);
    }

    #[tokio::test]
    async fn garbage_is_rejected() {
        assert!(matches!(
            decode(b"GET / HTTP/1.1\r\n").await,
            Err(ProxyHeaderError::InvalidSignature)
        ));
    }
}
