//! WebSocket listener: socket binding, per-connection setup, and handoff to
//! the bridge.
//!
//! One `WsListener` serves one configured address. Its accept loop snapshots
//! the live [`GatewayConfig`] once per accepted connection; the session holds
//! that snapshot for its whole life, so configuration reloads only affect
//! sessions accepted afterwards. Listener-local options (TLS, PROXY
//! requirement, Tor mode) live in an [`ArcSwap`] that in-place reloads swap
//! without touching the bound socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{run_session, FrameMode, SessionLabels};
use crate::config::{GatewayConfig, ListenerSpec};
use crate::error::{BindError, ReloadError};
use crate::identity::{resolve_identity, ForwardingHeaders};
use crate::proxy_protocol::read_proxy_header;
use crate::stream::{ClientStream, SessionStream};
use crate::upstream::{dial_upstream, send_webirc};

/// Deadline for the TLS and WebSocket handshakes, each.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Advertised subprotocols, most preferred first.
const SUBPROTOCOLS: [&str; 2] = ["text.ircv3.net", "binary.ircv3.net"];

/// The stream transport a listener is bound on. This is the listener's
/// fundamental mode: it can never change across an in-place reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTransport {
    Tcp,
    Unix,
}

/// Classify a configured listener address. `unix:`-prefixed values and bare
/// absolute paths select the Unix transport.
pub fn transport_of(addr: &str) -> BindTransport {
    let addr = addr.strip_prefix("unix:").unwrap_or(addr);
    if addr.starts_with('/') {
        BindTransport::Unix
    } else {
        BindTransport::Tcp
    }
}

enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundSocket {
    /// Accept one connection, reporting the transport peer's IP. Peers on a
    /// Unix socket count as loopback.
    async fn accept(&self) -> std::io::Result<(ClientStream, IpAddr, String)> {
        match self {
            BoundSocket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((ClientStream::Tcp(stream), peer.ip(), peer.to_string()))
            }
            BoundSocket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
                Ok((ClientStream::Unix(stream), loopback, "<unix>".to_string()))
            }
        }
    }
}

/// A serving WebSocket listener.
///
/// Lifecycle: `bind` -> serving -> (`reload` -> serving)* -> `stop`.
/// Stopping closes the accepting socket; sessions already accepted keep
/// running until their own I/O ends.
pub struct WsListener {
    addr: String,
    transport: BindTransport,
    spec: Arc<ArcSwap<ListenerSpec>>,
    shutdown: CancellationToken,
    bound_addr: Option<SocketAddr>,
}

impl WsListener {
    /// Bind `addr` and start accepting.
    ///
    /// Unix socket paths are unlinked first and have `unix_bind_mode`
    /// applied after binding.
    pub async fn bind(
        addr: &str,
        spec: ListenerSpec,
        unix_bind_mode: u32,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Result<Self, BindError> {
        let transport = transport_of(addr);
        let bind_err = |source| BindError {
            addr: addr.to_string(),
            source,
        };

        let (socket, bound_addr) = match transport {
            BindTransport::Unix => {
                let path = addr.strip_prefix("unix:").unwrap_or(addr);
                // A leftover socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                if unix_bind_mode != 0 {
                    use std::os::unix::fs::PermissionsExt;
                    if let Err(e) = std::fs::set_permissions(
                        path,
                        std::fs::Permissions::from_mode(unix_bind_mode),
                    ) {
                        warn!(path, error = %e, "failed to set unix socket mode");
                    }
                }
                (BoundSocket::Unix(listener), None)
            }
            BindTransport::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local = listener.local_addr().ok();
                (BoundSocket::Tcp(listener), local)
            }
        };

        info!(
            addr,
            tls = spec.tls.is_some(),
            proxy = spec.require_proxy,
            tor = spec.tor,
            "now listening"
        );

        let spec = Arc::new(ArcSwap::from_pointee(spec));
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            socket,
            addr.to_string(),
            Arc::clone(&spec),
            config,
            shutdown.clone(),
        ));

        Ok(Self {
            addr: addr.to_string(),
            transport,
            spec,
            shutdown,
            bound_addr,
        })
    }

    /// The configured address this listener serves.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The concrete socket address, when bound over TCP. Useful with a
    /// configured port of zero.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Apply a new spec in place. `addr` must be the address this listener
    /// was created under; a spec whose address implies a different stream
    /// transport cannot be applied without rebinding and is refused with
    /// [`ReloadError::IncompatibleMode`].
    pub fn reload(&self, addr: &str, spec: ListenerSpec) -> Result<(), ReloadError> {
        if transport_of(addr) != self.transport {
            return Err(ReloadError::IncompatibleMode);
        }
        self.spec.store(Arc::new(spec));
        Ok(())
    }

    /// Close the accepting socket. Idempotent; live sessions are unaffected.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    socket: BoundSocket,
    addr: String,
    spec: Arc<ArcSwap<ListenerSpec>>,
    config: Arc<ArcSwap<GatewayConfig>>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(%addr, "stopped listening");
                return;
            }
            accepted = socket.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_ip, peer_desc)) => {
                // Sessions keep the snapshot and listener options that were
                // live at accept time.
                let snapshot = config.load_full();
                let spec = spec.load_full();
                tokio::spawn(handle_connection(stream, peer_ip, peer_desc, snapshot, spec));
            }
            Err(e) => {
                error!(%addr, error = %e, "failed to accept connection");
            }
        }
    }
}

/// Headers and negotiation results captured inside the upgrade callback.
#[derive(Default)]
struct CapturedHandshake {
    forwarded_for: Option<String>,
    forwarded_proto: Option<String>,
    subprotocol: Option<&'static str>,
}

/// Pick the first of our advertised subprotocols that the client offered.
fn negotiate_subprotocol(req: &HsRequest) -> Option<&'static str> {
    let offered: Vec<&str> = req
        .headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .collect();
    SUBPROTOCOLS
        .iter()
        .copied()
        .find(|ours| offered.iter().any(|offer| offer == ours))
}

/// Drive one accepted connection from raw stream to running bridge.
async fn handle_connection(
    mut stream: ClientStream,
    peer_ip: IpAddr,
    peer_desc: String,
    snapshot: Arc<GatewayConfig>,
    spec: Arc<ListenerSpec>,
) {
    // 1. PROXY preamble, when this listener requires one.
    let mut header_ip = None;
    if spec.require_proxy {
        let decoded = tokio::time::timeout(spec.proxy_deadline, read_proxy_header(&mut stream)).await;
        match decoded {
            Ok(Ok(source)) => header_ip = source.map(|sa| sa.ip()),
            Ok(Err(e)) => {
                info!(peer = %peer_desc, error = %e, "rejecting connection with bad PROXY header");
                return;
            }
            Err(_) => {
                info!(peer = %peer_desc, "rejecting connection: no PROXY header within deadline");
                return;
            }
        }
    }

    // 2. TLS termination, when configured.
    let tls_terminated = spec.tls.is_some();
    let stream = match &spec.tls {
        Some(tls_config) => {
            let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => SessionStream::Tls(Box::new(tls_stream)),
                Ok(Err(e)) => {
                    info!(peer = %peer_desc, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    info!(peer = %peer_desc, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => SessionStream::Plain(stream),
    };

    // 3. WebSocket upgrade. The callback enforces the Origin allow-list,
    //    negotiates the subprotocol, and captures the forwarding headers.
    let captured: Arc<Mutex<CapturedHandshake>> = Arc::new(Mutex::new(CapturedHandshake::default()));
    let callback = {
        let captured = Arc::clone(&captured);
        let snapshot = Arc::clone(&snapshot);
        move |req: &HsRequest, mut response: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let origin = req
                .headers()
                .get("Origin")
                .and_then(|v| v.to_str().ok());
            if !snapshot.origin_policy.allows(origin) {
                let mut rejection = ErrorResponse::new(Some("Origin not allowed".to_string()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }

            let subprotocol = negotiate_subprotocol(req);
            if let Some(proto) = subprotocol {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(proto));
            }

            if let Ok(mut guard) = captured.lock() {
                guard.forwarded_for = req
                    .headers()
                    .get("X-Forwarded-For")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                guard.forwarded_proto = req
                    .headers()
                    .get("X-Forwarded-Proto")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                guard.subprotocol = subprotocol;
            }
            Ok(response)
        }
    };

    // Bound every inbound message to the readq cap; a larger message fails
    // the read and ends the session.
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(snapshot.max_readq_bytes))
        .max_frame_size(Some(snapshot.max_readq_bytes));

    let upgrade = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)),
    )
    .await;
    let ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            info!(peer = %peer_desc, error = %e, "websocket upgrade error");
            return;
        }
        Err(_) => {
            info!(peer = %peer_desc, "websocket handshake timed out");
            return;
        }
    };

    let (mode, headers) = {
        let guard = match captured.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let mode = match guard.subprotocol {
            Some("binary.ircv3.net") => FrameMode::Binary,
            _ => FrameMode::Text,
        };
        (
            mode,
            (guard.forwarded_for.clone(), guard.forwarded_proto.clone()),
        )
    };

    // 4. Resolve the client's effective identity against the trust list.
    let info = resolve_identity(
        header_ip,
        peer_ip,
        tls_terminated,
        spec.tor,
        ForwardingHeaders {
            forwarded_for: headers.0.as_deref(),
            forwarded_proto: headers.1.as_deref(),
        },
        &snapshot.proxy_allowed_from,
    );
    let effective_ip = info.proxied_ip.unwrap_or(peer_ip);

    // 5. Dial the upstream; a failure here fails only this session.
    let (upstream_spec, mut upstream_stream) = match dial_upstream(&snapshot).await {
        Ok(dialed) => dialed,
        Err(e) => {
            error!(peer = %peer_desc, error = %e, "could not reach upstream ircd");
            return;
        }
    };

    info!(
        peer = %peer_desc,
        upstream = %upstream_spec.address,
        secure = info.secure,
        "received connection, forwarding"
    );

    // 6. Announce the real client to the upstream before any client traffic.
    if let Some(webirc) = &upstream_spec.webirc {
        send_webirc(
            &mut upstream_stream,
            &snapshot,
            &webirc.password,
            effective_ip,
            info.secure,
        )
        .await;
    }

    // 7. Bridge until either side ends.
    let labels = SessionLabels {
        client: peer_desc,
        upstream: upstream_spec.address.clone(),
    };
    run_session(ws, upstream_stream, mode, snapshot, labels).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert_eq!(transport_of("127.0.0.1:8067"), BindTransport::Tcp);
        assert_eq!(transport_of("[::1]:8067"), BindTransport::Tcp);
        assert_eq!(transport_of("/run/bridge.sock"), BindTransport::Unix);
        assert_eq!(transport_of("unix:/run/bridge.sock"), BindTransport::Unix);
    }

    #[test]
    fn subprotocol_preference_order() {
        let req = |protos: &[&str]| {
            let mut builder = tokio_tungstenite::tungstenite::http::Request::builder().uri("/");
            for p in protos {
                builder = builder.header("Sec-WebSocket-Protocol", *p);
            }
            builder.body(()).unwrap()
        };

        assert_eq!(
            negotiate_subprotocol(&req(&["text.ircv3.net"])),
            Some("text.ircv3.net")
        );
        assert_eq!(
            negotiate_subprotocol(&req(&["binary.ircv3.net"])),
            Some("binary.ircv3.net")
        );
        // Both offered: text wins regardless of client order.
        assert_eq!(
            negotiate_subprotocol(&req(&["binary.ircv3.net, text.ircv3.net"])),
            Some("text.ircv3.net")
        );
        assert_eq!(negotiate_subprotocol(&req(&["xmpp"])), None);
        assert_eq!(negotiate_subprotocol(&req(&[])), None);
    }
}
