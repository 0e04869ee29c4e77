//! Loopback end-to-end tests: a real listener, a real WebSocket client, and
//! a fake upstream ircd on an ephemeral TCP port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use irc_transcode::Transcoder;
use irc_wire::LineReader;
use ws_bridge::{
    GatewayConfig, ListenerSpec, OriginPolicy, ReloadError, UpstreamSpec, WebircSpec, WsListener,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_config(upstream_addr: &str, webirc: bool) -> GatewayConfig {
    GatewayConfig {
        listeners: HashMap::from([("127.0.0.1:0".to_string(), ListenerSpec::new())]),
        upstreams: vec![UpstreamSpec {
            address: upstream_addr.to_string(),
            tls: None,
            webirc: webirc.then(|| WebircSpec {
                password: "*".to_string(),
            }),
        }],
        origin_policy: OriginPolicy::allow_all(),
        proxy_allowed_from: Vec::new(),
        gateway_name: "wp.example".to_string(),
        dial_timeout: Duration::from_secs(5),
        lookup_hostnames: false,
        forward_confirm_hostnames: false,
        max_line_len: 512,
        max_readq_bytes: 4094 + 512 + 1024,
        unix_bind_mode: 0,
        transcoder: Transcoder::replacement(),
        log_level: "info".to_string(),
    }
}

struct Harness {
    listener: WsListener,
    config: Arc<ArcSwap<GatewayConfig>>,
    upstream: TcpListener,
}

impl Harness {
    async fn start(webirc: bool) -> Self {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let config = Arc::new(ArcSwap::from_pointee(test_config(&upstream_addr, webirc)));
        let listener = WsListener::bind(
            "127.0.0.1:0",
            ListenerSpec::new(),
            0,
            Arc::clone(&config),
        )
        .await
        .unwrap();
        Self {
            listener,
            config,
            upstream,
        }
    }

    /// Open a client WebSocket offering `subprotocol`, and accept the
    /// corresponding upstream connection.
    async fn connect(
        &self,
        subprotocol: &str,
    ) -> (
        tokio_tungstenite::WebSocketStream<TcpStream>,
        TcpStream,
    ) {
        let addr = self.listener.bound_addr().unwrap();
        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            subprotocol.parse().unwrap(),
        );
        let stream = TcpStream::connect(addr).await.unwrap();
        let client = tokio_tungstenite::client_async(request, stream);
        let accepted = self.upstream.accept();
        let (client, upstream) = tokio::time::timeout(TEST_TIMEOUT, async move {
            let (client, accepted) = tokio::join!(client, accepted);
            let (client, _response) = client.unwrap();
            (client, accepted.unwrap().0)
        })
        .await
        .unwrap();
        (client, upstream)
    }
}

#[tokio::test]
async fn text_session_end_to_end() {
    let harness = Harness::start(true).await;
    let (mut client, upstream) = harness.connect("text.ircv3.net").await;
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut upstream_lines = LineReader::new(upstream_read, 8192);

    // The WEBIRC handshake arrives before any client traffic. Loopback with
    // hostname lookups disabled: both hostname and ip are the IP string, and
    // the connection is not secure.
    let webirc = upstream_lines.read_line().await.unwrap();
    assert_eq!(webirc, b"WEBIRC * wp.example 127.0.0.1 127.0.0.1 :");

    // Client frame -> upstream line.
    client
        .send(Message::Text("NICK alice".into()))
        .await
        .unwrap();
    assert_eq!(upstream_lines.read_line().await.unwrap(), b"NICK alice");

    // Upstream line -> client text frame, identity for valid UTF-8.
    upstream_write
        .write_all(b"PRIVMSG #ircv3 :hi there\r\n")
        .await
        .unwrap();
    let frame = tokio::time::timeout(TEST_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("PRIVMSG #ircv3 :hi there".into()));

    // A non-UTF-8 upstream line is transcoded before hitting the text frame.
    upstream_write
        .write_all(b"PRIVMSG #ircv3 :caf\xe9\r\n")
        .await
        .unwrap();
    let frame = tokio::time::timeout(TEST_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        frame,
        Message::Text("PRIVMSG #ircv3 :caf\u{fffd}".into())
    );

    harness.listener.stop();
}

#[tokio::test]
async fn binary_session_passes_bytes_through() {
    let harness = Harness::start(false).await;
    let (mut client, upstream) = harness.connect("binary.ircv3.net").await;
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut upstream_lines = LineReader::new(upstream_read, 8192);

    client
        .send(Message::Binary(b"NICK bob".to_vec().into()))
        .await
        .unwrap();
    assert_eq!(upstream_lines.read_line().await.unwrap(), b"NICK bob");

    // Raw legacy bytes survive untouched in binary mode.
    upstream_write
        .write_all(b"PRIVMSG #c :caf\xe9\r\n")
        .await
        .unwrap();
    let frame = tokio::time::timeout(TEST_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Binary(b"PRIVMSG #c :caf\xe9".to_vec().into()));

    harness.listener.stop();
}

#[tokio::test]
async fn oversize_client_message_tears_down_both_sides() {
    let harness = Harness::start(false).await;
    let (mut client, upstream) = harness.connect("text.ircv3.net").await;
    let (upstream_read, _upstream_write) = upstream.into_split();
    let mut upstream_lines = LineReader::new(upstream_read, 1 << 20);

    let cap = harness.config.load().max_readq_bytes;
    let oversize = "a".repeat(cap + 1);
    // The server may tear the connection down while we are still flushing,
    // so the send itself is allowed to fail.
    let _ = client.send(Message::Text(oversize.into())).await;

    // The read-limit failure closes the whole session: the upstream side
    // observes end-of-stream.
    let result = tokio::time::timeout(TEST_TIMEOUT, upstream_lines.read_line())
        .await
        .unwrap();
    assert!(result.is_err(), "upstream should see the session end");

    harness.listener.stop();
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let mut config = test_config(&upstream_addr, false);
    config.origin_policy =
        OriginPolicy::compile(&["https://*.example.com".to_string()]).unwrap();
    let config = Arc::new(ArcSwap::from_pointee(config));
    let listener = WsListener::bind("127.0.0.1:0", ListenerSpec::new(), 0, Arc::clone(&config))
        .await
        .unwrap();
    let addr = listener.bound_addr().unwrap();

    // Allowed origin upgrades fine.
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        "text.ircv3.net".parse().unwrap(),
    );
    request
        .headers_mut()
        .insert("Origin", "https://chat.example.com".parse().unwrap());
    let stream = TcpStream::connect(addr).await.unwrap();
    let connect = tokio_tungstenite::client_async(request, stream);
    let (result, _) = tokio::join!(connect, upstream.accept());
    assert!(result.is_ok());

    // Disallowed origin is rejected during the handshake.
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.com".parse().unwrap());
    let stream = TcpStream::connect(addr).await.unwrap();
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        tokio_tungstenite::client_async(request, stream),
    )
    .await
    .unwrap();
    assert!(result.is_err());

    // No Origin at all fails the same way when an allow-list is configured.
    let request = format!("ws://{addr}/").into_client_request().unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let result = tokio::time::timeout(
        TEST_TIMEOUT,
        tokio_tungstenite::client_async(request, stream),
    )
    .await
    .unwrap();
    assert!(result.is_err());

    listener.stop();
}

#[tokio::test]
async fn reload_leaves_live_sessions_untouched() {
    let harness = Harness::start(false).await;
    let (mut client, upstream) = harness.connect("text.ircv3.net").await;
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let mut upstream_lines = LineReader::new(upstream_read, 8192);

    client
        .send(Message::Text("before reload".into()))
        .await
        .unwrap();
    assert_eq!(upstream_lines.read_line().await.unwrap(), b"before reload");

    // Publish a new snapshot and reload the listener spec in place.
    let old = harness.config.load_full();
    let mut reloaded = test_config(&old.upstreams[0].address, false);
    reloaded.max_line_len = 1024;
    reloaded.max_readq_bytes = 4094 + 1024 + 1024;
    harness.config.store(Arc::new(reloaded));
    harness
        .listener
        .reload("127.0.0.1:0", ListenerSpec::new())
        .unwrap();

    // The established session still works in both directions, against the
    // snapshot it captured at accept time.
    client
        .send(Message::Text("after reload".into()))
        .await
        .unwrap();
    assert_eq!(upstream_lines.read_line().await.unwrap(), b"after reload");

    upstream_write.write_all(b"PONG :ok\r\n").await.unwrap();
    let frame = tokio::time::timeout(TEST_TIMEOUT, client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("PONG :ok".into()));

    harness.listener.stop();
}

#[tokio::test]
async fn listener_refuses_transport_change_in_place() {
    let harness = Harness::start(false).await;
    let result = harness
        .listener
        .reload("unix:/tmp/bridge.sock", ListenerSpec::new());
    assert!(matches!(result, Err(ReloadError::IncompatibleMode)));
    harness.listener.stop();
}

#[tokio::test]
async fn stopping_the_listener_closes_the_accept_socket() {
    let harness = Harness::start(false).await;
    let addr = harness.listener.bound_addr().unwrap();
    harness.listener.stop();
    // Give the accept loop a moment to observe the cancellation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}
