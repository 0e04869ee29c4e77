//! Parsing and reassembly of single IRC lines.
//!
//! Parsing is zero-copy: [`ParsedLine`] borrows its pieces from the input
//! buffer. Parameters are kept as raw byte slices because upstream servers
//! may send arbitrary legacy encodings; only the tag section is required to
//! be UTF-8 by the IRCv3 framing. Reassembly via [`assemble_line`] takes
//! decoded (UTF-8) fields and enforces the line-length budget.

use thiserror::Error;

/// A raw IRC line taken apart into its framing components.
///
/// All fields borrow from the input line. The tag section is the text between
/// `@` and the first space, kept as one string so it round-trips through
/// reassembly byte-for-byte (tag order is preserved).
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    /// Raw tag section without the leading `@`.
    pub tags: Option<&'a str>,
    /// Message source without the leading `:`.
    pub source: Option<&'a [u8]>,
    /// The command (verb or numeric).
    pub command: &'a [u8],
    /// Parameters; a `:`-prefixed trailing parameter consumes the rest of the
    /// line and may contain spaces.
    pub params: Vec<&'a [u8]>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message contains no command")]
    MissingCommand,
    #[error("tag section is not valid UTF-8")]
    NonUtf8Tags,
}

/// Errors from [`assemble_line`].
#[derive(Debug, Error)]
pub enum AssembleError {
    /// The body exceeded the length budget. The carried line has been
    /// truncated at a UTF-8 boundary to fit and is safe to send; callers that
    /// tolerate truncation should treat this as success.
    #[error("line body exceeded the length budget and was truncated")]
    BodyTooLong { line: Vec<u8> },
    /// A field contained bytes that cannot be framed (space in an interior
    /// parameter, CR/LF/NUL anywhere, a `:`-initial token, or an empty
    /// command).
    #[error("field cannot be framed as part of an IRC line: {0:?}")]
    InvalidField(String),
}

fn split_token(input: &[u8]) -> (&[u8], &[u8]) {
    match input.iter().position(|&b| b == b' ') {
        Some(idx) => (&input[..idx], &input[idx + 1..]),
        None => (input, &input[input.len()..]),
    }
}

fn skip_spaces(mut input: &[u8]) -> &[u8] {
    while input.first() == Some(&b' ') {
        input = &input[1..];
    }
    input
}

/// Parse a raw IRC line (with or without its trailing CRLF) into its
/// components.
///
/// Runs of spaces between tokens are tolerated. A line consisting only of a
/// tag section, or with an empty command, is rejected: IRC lines must carry a
/// command.
pub fn parse_line(line: &[u8]) -> Result<ParsedLine<'_>, ParseError> {
    let mut rest = line;
    while matches!(rest.last(), Some(b'\r') | Some(b'\n')) {
        rest = &rest[..rest.len() - 1];
    }

    let tags = if rest.first() == Some(&b'@') {
        match rest.iter().position(|&b| b == b' ') {
            Some(idx) => {
                let section = &rest[1..idx];
                let section = std::str::from_utf8(section).map_err(|_| ParseError::NonUtf8Tags)?;
                rest = &rest[idx + 1..];
                Some(section)
            }
            // Tags with nothing after them: there is no command.
            None => return Err(ParseError::MissingCommand),
        }
    } else {
        None
    };

    rest = skip_spaces(rest);

    let source = if rest.first() == Some(&b':') {
        let (token, after) = split_token(&rest[1..]);
        rest = skip_spaces(after);
        Some(token)
    } else {
        None
    };

    let (command, after) = split_token(rest);
    if command.is_empty() {
        return Err(ParseError::MissingCommand);
    }
    rest = after;

    let mut params = Vec::new();
    loop {
        rest = skip_spaces(rest);
        if rest.is_empty() {
            break;
        }
        if rest[0] == b':' {
            params.push(&rest[1..]);
            break;
        }
        let (token, after) = split_token(rest);
        params.push(token);
        rest = after;
    }

    Ok(ParsedLine {
        tags,
        source,
        command,
        params,
    })
}

/// Whether `s` is usable as a non-final IRC parameter: nonempty, no spaces,
/// no initial `:`, no CR/LF/NUL. The gateway name configured for WEBIRC must
/// satisfy this.
pub fn is_valid_non_final_param(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(':')
        && !s.bytes().any(|b| matches!(b, b' ' | b'\r' | b'\n' | b'\0'))
}

fn check_token(s: &str) -> Result<(), AssembleError> {
    if is_valid_non_final_param(s) {
        Ok(())
    } else {
        Err(AssembleError::InvalidField(s.to_string()))
    }
}

/// Reassemble an IRC line from decoded components.
///
/// The returned line has no trailing CRLF, but `max_line_len` budgets for it:
/// the body (everything after the tag section) is held to `max_line_len - 2`
/// bytes. A body that would run over is truncated at a character boundary and
/// reported as [`AssembleError::BodyTooLong`], with the truncated line
/// attached. Tag data does not count against the budget.
///
/// The final parameter is always serialized with a leading `:`, which is
/// valid for any parameter and keeps empty or space-containing values framed
/// correctly.
pub fn assemble_line(
    tags: Option<&str>,
    source: Option<&str>,
    command: &str,
    params: &[String],
    max_line_len: usize,
) -> Result<Vec<u8>, AssembleError> {
    if let Some(tags) = tags {
        if tags.is_empty() || tags.bytes().any(|b| matches!(b, b' ' | b'\r' | b'\n' | b'\0')) {
            return Err(AssembleError::InvalidField(tags.to_string()));
        }
    }
    if let Some(source) = source {
        check_token(source)?;
    }
    check_token(command)?;
    if let Some((_, interior)) = params.split_last() {
        for param in interior {
            check_token(param)?;
        }
    }
    if let Some(last) = params.last() {
        if last.bytes().any(|b| matches!(b, b'\r' | b'\n' | b'\0')) {
            return Err(AssembleError::InvalidField(last.to_string()));
        }
    }

    let mut body = String::new();
    if let Some(source) = source {
        body.push(':');
        body.push_str(source);
        body.push(' ');
    }
    body.push_str(command);
    if let Some((last, interior)) = params.split_last() {
        for param in interior {
            body.push(' ');
            body.push_str(param);
        }
        body.push_str(" :");
        body.push_str(last);
    }

    let budget = max_line_len.saturating_sub(2);
    let truncated = body.len() > budget;
    if truncated {
        let mut cut = budget;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    let mut line = Vec::with_capacity(tags.map_or(0, |t| t.len() + 2) + body.len());
    if let Some(tags) = tags {
        line.push(b'@');
        line.extend_from_slice(tags.as_bytes());
        line.push(b' ');
    }
    line.extend_from_slice(body.as_bytes());

    if truncated {
        Err(AssembleError::BodyTooLong { line })
    } else {
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // parse_line
    // -----------------------------------------------------------------------

    #[test]
    fn parse_plain_command() {
        let parsed = parse_line(b"PING").unwrap();
        assert_eq!(parsed.tags, None);
        assert_eq!(parsed.source, None);
        assert_eq!(parsed.command, b"PING");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn parse_trailing_param_keeps_spaces() {
        let parsed = parse_line(b"PRIVMSG #chan :hi there friend").unwrap();
        assert_eq!(parsed.params, vec![&b"#chan"[..], &b"hi there friend"[..]]);
    }

    #[test]
    fn parse_source_and_tags() {
        let parsed =
            parse_line(b"@time=2021-10-13T05:27:37.293Z :nick!user@host PRIVMSG #chan :hi")
                .unwrap();
        assert_eq!(parsed.tags, Some("time=2021-10-13T05:27:37.293Z"));
        assert_eq!(parsed.source, Some(&b"nick!user@host"[..]));
        assert_eq!(parsed.command, b"PRIVMSG");
    }

    #[test]
    fn parse_strips_crlf() {
        let parsed = parse_line(b"PING :token\r\n").unwrap();
        assert_eq!(parsed.params, vec![&b"token"[..]]);
    }

    #[test]
    fn parse_tolerates_space_runs() {
        let parsed = parse_line(b":src   CMD   a   :b c").unwrap();
        assert_eq!(parsed.source, Some(&b"src"[..]));
        assert_eq!(parsed.command, b"CMD");
        assert_eq!(parsed.params, vec![&b"a"[..], &b"b c"[..]]);
    }

    #[test]
    fn parse_empty_trailing_param() {
        let parsed = parse_line(b"CMD a :").unwrap();
        assert_eq!(parsed.params, vec![&b"a"[..], &b""[..]]);
    }

    #[test]
    fn parse_tags_without_command_is_rejected() {
        assert_eq!(parse_line(b"@only-tags-no-body"), Err(ParseError::MissingCommand));
        assert_eq!(parse_line(b"@tags "), Err(ParseError::MissingCommand));
    }

    #[test]
    fn parse_non_utf8_tags_rejected() {
        assert_eq!(parse_line(b"@k=\xff CMD"), Err(ParseError::NonUtf8Tags));
    }

    #[test]
    fn parse_non_utf8_params_pass_through() {
        let parsed = parse_line(b"PRIVMSG #chan :caf\xe9").unwrap();
        assert_eq!(parsed.params[1], b"caf\xe9");
    }

    // -----------------------------------------------------------------------
    // assemble_line
    // -----------------------------------------------------------------------

    #[test]
    fn assemble_round_trip() {
        let line = assemble_line(
            Some("msgid=abc;time=x"),
            Some("nick!user@host"),
            "PRIVMSG",
            &["#chan".to_string(), "hi there".to_string()],
            512,
        )
        .unwrap();
        assert_eq!(line, b"@msgid=abc;time=x :nick!user@host PRIVMSG #chan :hi there");
    }

    #[test]
    fn assemble_final_param_always_gets_colon() {
        let line = assemble_line(None, None, "WEBIRC", &["p".into(), "gw".into(), "h".into(), "1.2.3.4".into(), "secure".into()], 512).unwrap();
        assert_eq!(line, b"WEBIRC p gw h 1.2.3.4 :secure");

        let line = assemble_line(None, None, "WEBIRC", &["p".into(), "gw".into(), "h".into(), "1.2.3.4".into(), String::new()], 512).unwrap();
        assert_eq!(line, b"WEBIRC p gw h 1.2.3.4 :");
    }

    #[test]
    fn assemble_rejects_interior_param_with_space() {
        let err = assemble_line(None, None, "CMD", &["a b".into(), "c".into()], 512).unwrap_err();
        assert!(matches!(err, AssembleError::InvalidField(_)));
    }

    #[test]
    fn assemble_rejects_bad_command() {
        assert!(matches!(
            assemble_line(None, None, "", &[], 512),
            Err(AssembleError::InvalidField(_))
        ));
        assert!(matches!(
            assemble_line(None, None, "WITH SPACE", &[], 512),
            Err(AssembleError::InvalidField(_))
        ));
    }

    #[test]
    fn assemble_truncates_overlong_body() {
        let long = "x".repeat(600);
        let err = assemble_line(None, None, "PRIVMSG", &["#chan".into(), long], 512).unwrap_err();
        match err {
            AssembleError::BodyTooLong { line } => {
                assert_eq!(line.len(), 510);
                assert!(line.starts_with(b"PRIVMSG #chan :"));
            }
            other => panic!("expected BodyTooLong, got {other:?}"),
        }
    }

    #[test]
    fn assemble_truncates_at_char_boundary() {
        // Fill so that the budget lands inside the final multi-byte character.
        let body_prefix_len = "PRIVMSG #c :".len();
        let fill = 510 - body_prefix_len - 1; // one byte short of the budget
        let mut text = "a".repeat(fill);
        text.push('é'); // two bytes; straddles the boundary
        let err = assemble_line(None, None, "PRIVMSG", &["#c".into(), text], 512).unwrap_err();
        match err {
            AssembleError::BodyTooLong { line } => {
                assert!(line.len() <= 510);
                assert!(std::str::from_utf8(&line).is_ok());
            }
            other => panic!("expected BodyTooLong, got {other:?}"),
        }
    }

    #[test]
    fn assemble_tags_do_not_count_toward_budget() {
        let tags = "t".repeat(600);
        let line = assemble_line(Some(&tags), None, "PING", &[], 512).unwrap();
        assert_eq!(line.len(), 600 + 2 + "PING".len());
    }

    #[test]
    fn valid_non_final_param() {
        assert!(is_valid_non_final_param("wp.example"));
        assert!(!is_valid_non_final_param(""));
        assert!(!is_valid_non_final_param("has space"));
        assert!(!is_valid_non_final_param(":leading"));
    }
}
