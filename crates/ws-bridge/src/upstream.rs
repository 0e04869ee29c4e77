//! Upstream dialing and the WEBIRC handshake.

use std::net::IpAddr;
use std::sync::OnceLock;

use hickory_resolver::TokioResolver;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{error, warn};

use irc_wire::{assemble_line, is_valid_non_final_param, DEFAULT_MAX_LINE_LEN};

use crate::config::{GatewayConfig, UpstreamSpec};
use crate::error::DialError;
use crate::identity::ip_to_hostname_string;
use crate::stream::UpstreamStream;

/// Pick an upstream uniformly at random and connect to it.
///
/// There is deliberately no health checking, stickiness, or retry: a failed
/// connect fails the session.
pub async fn dial_upstream(
    config: &GatewayConfig,
) -> Result<(UpstreamSpec, UpstreamStream), DialError> {
    let index = rand::thread_rng().gen_range(0..config.upstreams.len());
    let upstream = config.upstreams[index].clone();

    let stream = tokio::time::timeout(config.dial_timeout, connect(&upstream))
        .await
        .map_err(|_| DialError::Timeout {
            address: upstream.address.clone(),
        })??;

    Ok((upstream, stream))
}

async fn connect(upstream: &UpstreamSpec) -> Result<UpstreamStream, DialError> {
    let address = &upstream.address;
    let connect_err = |source| DialError::Connect {
        address: address.clone(),
        source,
    };

    if address.starts_with('/') {
        let sock = UnixStream::connect(address).await.map_err(connect_err)?;
        match &upstream.tls {
            Some(tls) => {
                let connector = TlsConnector::from(tls.clone());
                let stream = connector
                    .connect(server_name(address)?, sock)
                    .await
                    .map_err(connect_err)?;
                Ok(UpstreamStream::TlsUnix(Box::new(stream)))
            }
            None => Ok(UpstreamStream::Unix(sock)),
        }
    } else {
        let sock = TcpStream::connect(address).await.map_err(connect_err)?;
        match &upstream.tls {
            Some(tls) => {
                let connector = TlsConnector::from(tls.clone());
                let stream = connector
                    .connect(server_name(address)?, sock)
                    .await
                    .map_err(connect_err)?;
                Ok(UpstreamStream::TlsTcp(Box::new(stream)))
            }
            None => Ok(UpstreamStream::Tcp(sock)),
        }
    }
}

/// Derive the TLS server name from an upstream address: the host portion,
/// with any port suffix and IPv6 brackets removed.
fn server_name(address: &str) -> Result<ServerName<'static>, DialError> {
    let host = match address.rsplit_once(':') {
        // Only treat the suffix as a port if it looks like one; a bare IPv6
        // address also contains colons.
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|_| DialError::ServerName {
        address: address.to_string(),
    })
}

/// Send the WEBIRC handshake line ahead of any client traffic.
///
/// `WEBIRC <password> <gateway> <hostname> <ip> :<flags>` where flags is the
/// single token `secure` or empty. A failure to build or send the line is
/// logged but does not abort the session; the upstream will simply see the
/// gateway's own address.
pub async fn send_webirc(
    stream: &mut UpstreamStream,
    config: &GatewayConfig,
    password: &str,
    ip: IpAddr,
    secure: bool,
) {
    let ip_string = ip_to_hostname_string(ip);
    let hostname = if config.lookup_hostnames {
        lookup_hostname(ip, config.forward_confirm_hostnames)
            .await
            .unwrap_or_else(|| ip_string.clone())
    } else {
        ip_string.clone()
    };

    let flags = if secure { "secure" } else { "" };
    let params = [
        password.to_string(),
        config.gateway_name.clone(),
        hostname,
        ip_string,
        flags.to_string(),
    ];

    let result = match assemble_line(None, None, "WEBIRC", &params, DEFAULT_MAX_LINE_LEN) {
        Ok(mut line) => {
            line.extend_from_slice(b"\r\n");
            let write = async {
                stream.write_all(&line).await?;
                stream.flush().await
            };
            write.await.map_err(anyhow::Error::from)
        }
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        error!(error = %e, "error sending WEBIRC to upstream");
        // but keep going
    }
}

fn resolver() -> Option<&'static TokioResolver> {
    static RESOLVER: OnceLock<Option<TokioResolver>> = OnceLock::new();
    RESOLVER
        .get_or_init(|| match TokioResolver::builder_tokio() {
            Ok(builder) => Some(builder.build()),
            Err(e) => {
                warn!(error = %e, "system DNS configuration unavailable; hostname lookups disabled");
                None
            }
        })
        .as_ref()
}

/// Reverse-resolve `ip`, optionally requiring the name to forward-resolve
/// back to the same address. Returns `None` when no acceptable hostname
/// exists; the caller falls back to the IP string.
async fn lookup_hostname(ip: IpAddr, forward_confirm: bool) -> Option<String> {
    let resolver = resolver()?;
    let ptr = resolver.reverse_lookup(ip).await.ok()?;
    let name = ptr.iter().next()?.to_string();
    let hostname = name.trim_end_matches('.');
    if !is_valid_non_final_param(hostname) {
        return None;
    }
    if forward_confirm {
        let forward = resolver.lookup_ip(hostname).await.ok()?;
        if !forward.iter().any(|addr| addr == ip) {
            return None;
        }
    }
    Some(hostname.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_strips_port_and_brackets() {
        assert!(server_name("irc.example.com:6697").is_ok());
        assert!(server_name("irc.example.com").is_ok());
        assert!(server_name("203.0.113.5:6697").is_ok());
        assert!(server_name("[2001:db8::1]:6697").is_ok());
    }

    #[test]
    fn webirc_line_shape() {
        // secure connection, lookups disabled: hostname is the IP string
        let line = assemble_line(
            None,
            None,
            "WEBIRC",
            &[
                "P".to_string(),
                "wp.example".to_string(),
                "203.0.113.5".to_string(),
                "203.0.113.5".to_string(),
                "secure".to_string(),
            ],
            DEFAULT_MAX_LINE_LEN,
        )
        .unwrap();
        assert_eq!(line, b"WEBIRC P wp.example 203.0.113.5 203.0.113.5 :secure");
        assert!(line.len() + 2 <= DEFAULT_MAX_LINE_LEN);

        let insecure = assemble_line(
            None,
            None,
            "WEBIRC",
            &[
                "*".to_string(),
                "wp.example".to_string(),
                "0::1".to_string(),
                "0::1".to_string(),
                String::new(),
            ],
            DEFAULT_MAX_LINE_LEN,
        )
        .unwrap();
        assert_eq!(insecure, b"WEBIRC * wp.example 0::1 0::1 :");
    }
}
