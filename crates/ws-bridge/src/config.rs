//! Runtime configuration snapshot.
//!
//! A [`GatewayConfig`] is immutable once built. The process publishes the
//! active snapshot through an `arc_swap::ArcSwap`; readers take one atomic
//! load per operation boundary and sessions keep the `Arc` they captured at
//! accept time, so a reload never disturbs connections already in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;

use irc_transcode::Transcoder;

use crate::origin::OriginPolicy;

/// Default timeout for dialing the upstream ircd.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a required PROXY protocol header to arrive after accept.
pub const DEFAULT_PROXY_DEADLINE: Duration = Duration::from_secs(60);

/// Per-listener options, applied at accept time.
///
/// Mutable only through a whole-spec swap on reload; sessions see the spec
/// that was live when they were accepted.
#[derive(Clone)]
pub struct ListenerSpec {
    /// TLS termination, when the listener carries certificates.
    pub tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
    /// Require a PROXY v1/v2 preamble before the HTTP handshake.
    pub require_proxy: bool,
    /// Tor listener: connections count as secure without TLS.
    pub tor: bool,
    /// How long to wait for a required PROXY header.
    pub proxy_deadline: Duration,
}

impl ListenerSpec {
    pub fn new() -> Self {
        Self {
            tls: None,
            require_proxy: false,
            tor: false,
            proxy_deadline: DEFAULT_PROXY_DEADLINE,
        }
    }
}

impl Default for ListenerSpec {
    fn default() -> Self {
        Self::new()
    }
}

/// One upstream ircd the bridge may forward to.
#[derive(Clone)]
pub struct UpstreamSpec {
    /// TCP `host:port`, or a filesystem path for a Unix socket (any `unix:`
    /// prefix is stripped during configuration load).
    pub address: String,
    /// TLS client configuration; `None` dials in plaintext.
    pub tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    /// WEBIRC handshake, when enabled for this upstream.
    pub webirc: Option<WebircSpec>,
}

/// WEBIRC handshake parameters for one upstream.
#[derive(Clone)]
pub struct WebircSpec {
    /// Configured password; an empty value is replaced with `*` at load time.
    pub password: String,
}

/// The immutable configuration snapshot shared by every component.
pub struct GatewayConfig {
    /// Listener address -> options. Addresses are the raw configuration keys.
    pub listeners: HashMap<String, ListenerSpec>,
    /// Upstreams; one is chosen uniformly at random per session.
    pub upstreams: Vec<UpstreamSpec>,
    /// Compiled Origin allow-list; empty accepts all origins.
    pub origin_policy: OriginPolicy,
    /// Networks trusted to supply PROXY headers and X-Forwarded-* data.
    pub proxy_allowed_from: Vec<IpNet>,
    /// Gateway name announced in the WEBIRC handshake.
    pub gateway_name: String,
    /// Timeout for dialing an upstream.
    pub dial_timeout: Duration,
    /// Resolve client IPs to hostnames for WEBIRC.
    pub lookup_hostnames: bool,
    /// Only accept reverse-DNS results that forward-resolve to the same IP.
    pub forward_confirm_hostnames: bool,
    /// Maximum IRC line length (including CRLF, excluding tag data); >= 512.
    pub max_line_len: usize,
    /// Cap on a single inbound WebSocket message or upstream line.
    pub max_readq_bytes: usize,
    /// File mode applied to Unix listener sockets after bind.
    pub unix_bind_mode: u32,
    /// Active transcoding strategy for upstream-to-client text frames.
    pub transcoder: Transcoder,
    /// Configured log level. Applied to the subscriber at startup; a changed
    /// value is reported on reload but takes effect on restart.
    pub log_level: String,
}
