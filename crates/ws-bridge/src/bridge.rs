//! The duplex bridge: two forwarders and a once-only teardown latch.
//!
//! Each session runs exactly two tasks. One drains WebSocket messages from
//! the client and writes them to the upstream as CRLF-framed lines; the
//! other reads CRLF-framed lines from the upstream and sends them to the
//! client as WebSocket frames, transcoding to UTF-8 when the negotiated
//! subprotocol is text. The forwarders share no state except the close
//! latch: whichever direction ends first trips it, the peer observes the
//! cancellation, and both halves of both connections are torn down exactly
//! once by ownership.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use irc_wire::LineReader;

use crate::config::GatewayConfig;
use crate::stream::UpstreamStream;

/// Initial size of the outbound line buffer.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Frame type used for upstream-to-client traffic, fixed by the negotiated
/// subprotocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `text.ircv3.net`: UTF-8 text frames, transcoded as needed.
    Text,
    /// `binary.ircv3.net`: opaque binary frames, passed through untouched.
    Binary,
}

/// Idempotent, once-only session teardown signal.
///
/// May be tripped concurrently from both forwarders (or anyone holding a
/// clone); every trip after the first is a no-op, and waiters are released
/// exactly once.
#[derive(Clone, Default)]
pub struct CloseLatch {
    token: CancellationToken,
}

impl CloseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch. Safe to call any number of times from any task.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Resolves once the latch has been tripped.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Addresses used only for log context.
#[derive(Clone)]
pub struct SessionLabels {
    pub client: String,
    pub upstream: String,
}

/// Run one bridge session to completion.
///
/// Consumes both connections and returns when both forwarders have exited
/// and every half has been dropped.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    upstream: UpstreamStream,
    mode: FrameMode,
    snapshot: Arc<GatewayConfig>,
    labels: SessionLabels,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let latch = CloseLatch::new();
    let (ws_sink, ws_stream) = ws.split();
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let to_upstream = tokio::spawn(client_to_upstream(
        ws_stream,
        upstream_write,
        latch.clone(),
        labels.clone(),
    ));
    let to_client = tokio::spawn(upstream_to_client(
        upstream_read,
        ws_sink,
        mode,
        snapshot,
        latch.clone(),
        labels,
    ));

    // Both tasks exit promptly once either trips the latch.
    let _ = tokio::join!(to_upstream, to_client);
}

/// Client-to-upstream forwarder: one WebSocket message becomes one IRC line.
///
/// No transcoding happens in this direction; the client owns its frame
/// content. The line and its CRLF go out as a single write so the line
/// stays atomic from the upstream reader's point of view.
async fn client_to_upstream<S>(
    mut ws: SplitStream<WebSocketStream<S>>,
    mut upstream: WriteHalf<UpstreamStream>,
    latch: CloseLatch,
    labels: SessionLabels,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line_buf: Vec<u8> = Vec::with_capacity(INITIAL_BUFFER_SIZE);
    let reason = loop {
        let next = tokio::select! {
            _ = latch.closed() => break "session closed by peer direction".to_string(),
            next = ws.next() => next,
        };
        let payload = match next {
            None | Some(Ok(Message::Close(_))) => break "client closed connection".to_string(),
            Some(Err(e)) => {
                break format!("error reading from websocket conn at {}: {e}", labels.client)
            }
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => msg.into_data(),
            // Ping/pong bookkeeping is the library's business.
            Some(Ok(_)) => continue,
        };

        debug!(
            from = %labels.client,
            to = %labels.upstream,
            line = %String::from_utf8_lossy(&payload),
            "input"
        );

        line_buf.clear();
        line_buf.extend_from_slice(&payload);
        line_buf.extend_from_slice(b"\r\n");
        if let Err(e) = write_line(&mut upstream, &line_buf).await {
            break format!("error writing to upstream conn at {}: {e}", labels.upstream);
        }
    };

    latch.close();
    let _ = upstream.shutdown().await;
    info!(client = %labels.client, upstream = %labels.upstream, %reason, "client-to-upstream forwarder ended");
}

async fn write_line(
    upstream: &mut WriteHalf<UpstreamStream>,
    line: &[u8],
) -> std::io::Result<()> {
    upstream.write_all(line).await?;
    upstream.flush().await
}

/// Upstream-to-client forwarder: one IRC line becomes one WebSocket frame.
async fn upstream_to_client<S>(
    upstream: ReadHalf<UpstreamStream>,
    mut ws: SplitSink<WebSocketStream<S>, Message>,
    mode: FrameMode,
    snapshot: Arc<GatewayConfig>,
    latch: CloseLatch,
    labels: SessionLabels,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = LineReader::new(upstream, snapshot.max_readq_bytes);
    let reason = loop {
        let line = tokio::select! {
            _ = latch.closed() => break "session closed by peer direction".to_string(),
            line = reader.read_line() => match line {
                Ok(line) => line,
                Err(e) => {
                    break format!("error reading from upstream conn at {}: {e}", labels.upstream)
                }
            },
        };

        debug!(
            from = %labels.upstream,
            to = %labels.client,
            line = %String::from_utf8_lossy(&line),
            "output"
        );

        let message = match mode {
            FrameMode::Binary => Message::Binary(line.into()),
            FrameMode::Text => {
                // The chardet detector and message reassembly sit behind this
                // boundary; a fault there costs the session, not the process.
                let transcoded = catch_unwind(AssertUnwindSafe(|| {
                    snapshot
                        .transcoder
                        .transcode(&line, snapshot.max_line_len)
                        .into_owned()
                }));
                match transcoded {
                    Ok(bytes) => {
                        Message::Text(String::from_utf8_lossy(&bytes).into_owned().into())
                    }
                    Err(panic) => {
                        error!(
                            upstream = %labels.upstream,
                            panic = panic_message(&panic),
                            line = %String::from_utf8_lossy(&line),
                            "panic while transcoding upstream line"
                        );
                        break "panic while transcoding".to_string();
                    }
                }
            }
        };

        if let Err(e) = ws.send(message).await {
            break format!("error writing to websocket conn at {}: {e}", labels.client);
        }
    };

    latch.close();
    let _ = ws.close().await;
    info!(client = %labels.client, upstream = %labels.upstream, %reason, "upstream-to-client forwarder ended");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
