//! Stream type unification.
//!
//! Accepted connections and upstream dials can each take several concrete
//! shapes (TCP or Unix socket, with or without TLS). These enums fold every
//! shape into a single `AsyncRead + AsyncWrite` type per role so the rest of
//! the crate stays generic-free.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// A raw accepted client connection, before any TLS handshake.
pub enum ClientStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// A client connection ready for the WebSocket handshake.
pub enum SessionStream {
    Plain(ClientStream),
    Tls(Box<tokio_rustls::server::TlsStream<ClientStream>>),
}

/// A connection to the upstream ircd.
pub enum UpstreamStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    TlsTcp(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsUnix(Box<tokio_rustls::client::TlsStream<UnixStream>>),
}

macro_rules! delegate_async_io {
    ($type:ident, $($variant:ident),+) => {
        impl AsyncRead for $type {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($type::$variant(s) => Pin::new(s).poll_read(cx, buf),)+
                }
            }
        }

        impl AsyncWrite for $type {
            fn poll_write(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<io::Result<usize>> {
                match self.get_mut() {
                    $($type::$variant(s) => Pin::new(s).poll_write(cx, buf),)+
                }
            }

            fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($type::$variant(s) => Pin::new(s).poll_flush(cx),)+
                }
            }

            fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                match self.get_mut() {
                    $($type::$variant(s) => Pin::new(s).poll_shutdown(cx),)+
                }
            }

            fn poll_write_vectored(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                bufs: &[io::IoSlice<'_>],
            ) -> Poll<io::Result<usize>> {
                match self.get_mut() {
                    $($type::$variant(s) => Pin::new(s).poll_write_vectored(cx, bufs),)+
                }
            }

            fn is_write_vectored(&self) -> bool {
                match self {
                    $($type::$variant(s) => s.is_write_vectored(),)+
                }
            }
        }
    };
}

delegate_async_io!(ClientStream, Tcp, Unix);
delegate_async_io!(SessionStream, Plain, Tls);
delegate_async_io!(UpstreamStream, Tcp, Unix, TlsTcp, TlsUnix);
