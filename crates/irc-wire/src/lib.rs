//! # irc-wire
//!
//! Minimal IRC wire-format support for the webirc-bridge proxy.
//!
//! The proxy does not interpret IRC semantics; it only needs to take a raw
//! line apart, put it back together within the protocol's length budget, and
//! read CRLF-framed lines off a byte stream. The crate is organised
//! accordingly:
//!
//! 1. **[`message`]** -- zero-copy parsing of a line into
//!    `{tags, source, command, params}` and strict reassembly bounded by a
//!    maximum line length.
//! 2. **[`reader`]** -- an async CRLF line reader with a small initial buffer
//!    that grows exactly once up to a hard cap.
//!
//! ## Quick start
//!
//! ```rust
//! use irc_wire::parse_line;
//!
//! let parsed = parse_line(b"PRIVMSG #chan :hi there").unwrap();
//! assert_eq!(parsed.command, b"PRIVMSG");
//! assert_eq!(parsed.params, vec![&b"#chan"[..], &b"hi there"[..]]);
//! ```

pub mod message;
pub mod reader;

// Re-export the most commonly used items at the crate root.
pub use message::{assemble_line, is_valid_non_final_param, parse_line, AssembleError, ParseError, ParsedLine};
pub use reader::{LineReader, LineReadError};

/// Default maximum IRC line length in bytes, including the trailing CRLF.
pub const DEFAULT_MAX_LINE_LEN: usize = 512;

/// Maximum number of bytes of client-only tag data permitted by the IRCv3
/// message-tags framing (the `@` and trailing space are not counted).
pub const MAX_CLIENT_TAG_DATA: usize = 4094;
