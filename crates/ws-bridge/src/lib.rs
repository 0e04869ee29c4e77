//! # ws-bridge
//!
//! The per-connection pipeline of the webirc-bridge proxy: accept an
//! IRCv3-over-WebSocket client, establish who it is, dial an ircd, and pump
//! bytes both ways until either side gives up.
//!
//! # Architecture
//!
//! ```text
//! Browser  <--WS-->  WsListener  --[identity]-->  dial_upstream  <--TCP/Unix/TLS-->  ircd
//!                        |                                |
//!                  [OriginPolicy]                    [WEBIRC line]
//!                  [PROXY header]                         |
//!                        +------------ bridge ------------+
//!                              text <-> transcoder
//! ```
//!
//! Configuration enters as an immutable [`GatewayConfig`] snapshot behind an
//! `ArcSwap`; each accepted session pins the snapshot it saw at accept time.

pub mod bridge;
pub mod config;
pub mod error;
pub mod identity;
pub mod listener;
pub mod origin;
pub mod proxy_protocol;
pub mod stream;
pub mod upstream;

// Re-export the primary types at the crate root for convenience.
pub use bridge::{CloseLatch, FrameMode};
pub use config::{GatewayConfig, ListenerSpec, UpstreamSpec, WebircSpec};
pub use error::{BindError, DialError, ProxyHeaderError, ReloadError};
pub use identity::{ConnInfo, ForwardingHeaders};
pub use listener::{transport_of, BindTransport, WsListener};
pub use origin::OriginPolicy;
