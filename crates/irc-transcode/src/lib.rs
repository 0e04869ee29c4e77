//! # irc-transcode
//!
//! Makes raw IRC lines from legacy-encoded upstreams safe to carry in UTF-8
//! text frames, without introducing new protocol violations.
//!
//! A [`Transcoder`] holds exactly one of three strategies:
//!
//! 1. **Replacement** -- substitute U+FFFD for each invalid byte, leaving the
//!    IRCv3 tag section untouched (tag data is UTF-8 by definition).
//! 2. **Chardet** -- parse the line and run each parameter through a
//!    heuristic encoding detector ([`chardetng`]), decoding with the guessed
//!    charset.
//! 3. **Fixed encoding list** -- parse the line and decode each parameter
//!    with the first configured encoding that decodes it losslessly.
//!
//! Well-formed UTF-8 lines take an identity fast path and are returned
//! borrowed. Whatever the strategy, the output is valid UTF-8 and, together
//! with a trailing CRLF, fits within the configured maximum line length.

use std::borrow::Cow;

use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use thiserror::Error;
use tracing::warn;

use irc_wire::{assemble_line, parse_line, AssembleError};

/// Substitute line sent to the client when the upstream line cannot even be
/// represented as an IRC message.
const INVALID_MESSAGE_WARNING: &[u8] =
    b"WARN * INVALID_MESSAGE :Upstream server sent a syntactically invalid message";

/// UTF-8 encoding of U+FFFD REPLACEMENT CHARACTER.
const REPLACEMENT: &[u8] = b"\xef\xbf\xbd";

/// A transcoding label that the IANA/WHATWG registry does not know.
#[derive(Debug, Error)]
#[error("unknown encoding label {0:?}")]
pub struct UnknownEncoding(pub String);

enum Strategy {
    Replacement,
    Chardet,
    Encodings(Vec<&'static Encoding>),
}

/// Converts raw upstream lines to valid, length-bounded UTF-8.
pub struct Transcoder {
    strategy: Strategy,
}

impl Transcoder {
    /// Replacement-character strategy (the default).
    pub fn replacement() -> Self {
        Self {
            strategy: Strategy::Replacement,
        }
    }

    /// Heuristic per-parameter charset detection.
    pub fn chardet() -> Self {
        Self {
            strategy: Strategy::Chardet,
        }
    }

    /// Fixed list of candidate encodings, tried per parameter in order.
    ///
    /// Labels are resolved through the registry (`Encoding::for_label`);
    /// unknown labels are a configuration error.
    pub fn fixed_encodings(labels: &[String]) -> Result<Self, UnknownEncoding> {
        let mut encodings = Vec::with_capacity(labels.len());
        for label in labels {
            let encoding = Encoding::for_label(label.as_bytes())
                .ok_or_else(|| UnknownEncoding(label.clone()))?;
            encodings.push(encoding);
        }
        Ok(Self {
            strategy: Strategy::Encodings(encodings),
        })
    }

    /// Transcode a raw IRC line (no trailing CRLF) to UTF-8.
    ///
    /// The result plus a CRLF fits within `max_line_len` bytes, not counting
    /// tag data. Lines that are already valid UTF-8 are returned borrowed,
    /// untouched.
    pub fn transcode<'a>(&self, line: &'a [u8], max_line_len: usize) -> Cow<'a, [u8]> {
        if std::str::from_utf8(line).is_ok() {
            return Cow::Borrowed(line);
        }
        let out = match &self.strategy {
            Strategy::Replacement => replace_invalid(line, max_line_len),
            Strategy::Chardet => transcode_params(line, max_line_len, decode_param_chardet),
            Strategy::Encodings(encodings) => {
                transcode_params(line, max_line_len, |p| decode_param_list(p, encodings))
            }
        };
        Cow::Owned(out)
    }
}

/// Width of the UTF-8 sequence starting at `line[i]`, or `None` if the bytes
/// there do not form a valid sequence. Overlong forms and surrogates are
/// rejected by the `str` validator.
fn utf8_sequence_len(line: &[u8], i: usize) -> Option<usize> {
    let width = match line[i] {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return None,
    };
    if i + width > line.len() {
        return None;
    }
    std::str::from_utf8(&line[i..i + width]).ok().map(|_| width)
}

/// Replace each invalid byte with U+FFFD, passing the tag section through
/// verbatim. The replacement character is three bytes where the offending
/// byte was one, so emission stops before the body would outgrow
/// `max_line_len - 2`; a multi-byte sequence is never split.
fn replace_invalid(line: &[u8], max_line_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut body = line;

    if line.first() == Some(&b'@') {
        match line.iter().position(|&b| b == b' ') {
            Some(idx) => {
                out.extend_from_slice(&line[..idx + 1]);
                body = &line[idx + 1..];
            }
            // IRC lines must contain a command; this message is invalid.
            None => return INVALID_MESSAGE_WARNING.to_vec(),
        }
    }

    let budget = max_line_len.saturating_sub(2);
    let mut body_len = 0;
    let mut i = 0;
    while i < body.len() {
        match utf8_sequence_len(body, i) {
            Some(width) => {
                if body_len + width > budget {
                    break;
                }
                out.extend_from_slice(&body[i..i + width]);
                i += width;
                body_len += width;
            }
            None => {
                if body_len + REPLACEMENT.len() > budget {
                    break;
                }
                out.extend_from_slice(REPLACEMENT);
                i += 1;
                body_len += REPLACEMENT.len();
            }
        }
    }
    out
}

/// Parse the line, run every parameter through `decode`, and reassemble.
fn transcode_params(
    line: &[u8],
    max_line_len: usize,
    decode: impl Fn(&[u8]) -> String,
) -> Vec<u8> {
    let parsed = match parse_line(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, line = %String::from_utf8_lossy(line), "invalid message from upstream");
            return INVALID_MESSAGE_WARNING.to_vec();
        }
    };

    // Tags are validated as UTF-8 by the parser. The source is a black box;
    // reinterpret it if it is not UTF-8. The command must be UTF-8.
    let command = match std::str::from_utf8(parsed.command) {
        Ok(command) => command,
        Err(_) => {
            warn!(command = ?parsed.command, "invalid command from upstream");
            return INVALID_MESSAGE_WARNING.to_vec();
        }
    };
    let source = parsed.source.map(|s| match std::str::from_utf8(s) {
        Ok(s) => s.to_string(),
        Err(_) => reinterpret_bytes(s),
    });

    let params: Vec<String> = parsed.params.iter().map(|p| decode(p)).collect();

    match assemble_line(parsed.tags, source.as_deref(), command, &params, max_line_len) {
        Ok(out) => out,
        // Over-length bodies come back truncated and usable.
        Err(AssembleError::BodyTooLong { line }) => line,
        Err(e) => {
            warn!(error = %e, "error reassembling message after transcoding");
            INVALID_MESSAGE_WARNING.to_vec()
        }
    }
}

/// Chardet strategy for one parameter: UTF-8 passes through; otherwise trust
/// the detector's best guess, falling back to byte reinterpretation when the
/// guessed charset cannot decode the bytes.
fn decode_param_chardet(param: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(param) {
        return s.to_string();
    }
    let mut detector = EncodingDetector::new();
    detector.feed(param, true);
    let encoding = detector.guess(None, true);
    match encoding.decode_without_bom_handling_and_without_replacement(param) {
        Some(decoded) => decoded.into_owned(),
        None => {
            warn!(
                charset = encoding.name(),
                "detected charset could not decode parameter"
            );
            reinterpret_bytes(param)
        }
    }
}

/// Fixed-list strategy for one parameter: first lossless decode wins.
fn decode_param_list(param: &[u8], encodings: &[&'static Encoding]) -> String {
    for encoding in encodings {
        if let Some(decoded) = encoding.decode_without_bom_handling_and_without_replacement(param) {
            return decoded.into_owned();
        }
    }
    reinterpret_bytes(param)
}

/// Last-resort lossy conversion: treat each raw byte as a code point.
fn reinterpret_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
