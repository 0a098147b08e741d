//! HTTP/1.1 wire codec.
//!
//! Translates between raw bytes and the structured message model. Nothing in
//! here performs I/O; callers buffer socket data and re-invoke
//! [`parse_message_head`] until it reports a complete head.
//!
//! ```text
//! <start-line>\r\n
//! (<name>: <value>\r\n)*
//! \r\n
//! <body>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::ParseLimits;
use crate::http::error::ParseError;
use crate::http::headers::{HeaderTable, RawHeader};
use crate::net::transport::Protocol;

/// Sequence terminating a head.
pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

/// A complete start line plus header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start_line: String,
    pub headers: Vec<RawHeader>,
    /// Bytes consumed including the terminator; the rest of the buffer is body.
    pub len: usize,
}

/// `<METHOD> <target> HTTP/<version>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    /// Version digits, e.g. `1.1`.
    pub version: String,
}

/// `HTTP/1.1 <code> <reason>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
}

/// Locate and split the head at the front of `buf`.
///
/// Returns `Ok(None)` while the terminator has not arrived yet.
pub fn parse_message_head(
    buf: &[u8],
    limits: &ParseLimits,
) -> Result<Option<MessageHead>, ParseError> {
    let end = match find_terminator(buf) {
        Some(pos) => pos,
        None => {
            if buf.len() > limits.max_header_bytes {
                return Err(ParseError::HeadersTooLarge {
                    limit: limits.max_header_bytes,
                });
            }
            return Ok(None);
        }
    };
    if end > limits.max_header_bytes {
        return Err(ParseError::HeadersTooLarge {
            limit: limits.max_header_bytes,
        });
    }

    let block = String::from_utf8_lossy(&buf[..end]);
    let mut lines = block.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if headers.len() >= limits.max_headers {
            return Err(ParseError::TooManyHeaders {
                limit: limits.max_headers,
            });
        }
        headers.push(parse_header_line(line)?);
    }

    Ok(Some(MessageHead {
        start_line,
        headers,
        len: end + HEAD_TERMINATOR.len(),
    }))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

fn parse_header_line(line: &str) -> Result<RawHeader, ParseError> {
    if line.starts_with([' ', '\t']) {
        return Err(ParseError::InvalidHeader(line.to_string()));
    }
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
    if name.is_empty() || name.ends_with([' ', '\t']) {
        return Err(ParseError::InvalidHeader(line.to_string()));
    }
    Ok(RawHeader::new(name, value.trim()))
}

/// Split a request line on single spaces.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let invalid = || ParseError::InvalidRequestLine(line.to_string());

    let mut parts = line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(invalid()),
    };
    if method.is_empty() || target.is_empty() {
        return Err(invalid());
    }
    let version = version.strip_prefix("HTTP/").ok_or_else(invalid)?;
    if version.is_empty() {
        return Err(invalid());
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
    })
}

/// Parse a status line anchored to the literal `HTTP/1.1`.
pub fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    let invalid = || ParseError::InvalidStatusLine(line.to_string());

    let rest = line.strip_prefix("HTTP/1.1 ").ok_or_else(invalid)?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let status_code = code.parse().map_err(|_| invalid())?;

    Ok(StatusLine {
        version: "1.1".to_string(),
        status_code,
        reason: reason.to_string(),
    })
}

/// Start line of an outgoing message.
#[derive(Debug, Clone, Copy)]
pub enum Head<'a> {
    Request {
        method: &'a str,
        path: &'a str,
        host: &'a str,
        port: u16,
        protocol: Protocol,
    },
    Response {
        status_code: u16,
        reason: &'a str,
    },
}

/// Value of an implied `Host` header.
pub fn host_header(host: &str, port: u16, protocol: Protocol) -> String {
    if port == protocol.default_port() {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Serialize a start line and header block, including the blank line.
pub fn serialize_head(head: &Head<'_>, headers: &HeaderTable) -> Bytes {
    let mut out = BytesMut::with_capacity(128 + headers.len() * 32);

    match *head {
        Head::Request {
            method,
            path,
            host,
            port,
            protocol,
        } => {
            put_line(&mut out, &format!("{} {} HTTP/1.1", method, path));
            if !headers.contains("host") {
                put_header(&mut out, "host", &host_header(host, port, protocol));
            }
        }
        Head::Response {
            status_code,
            reason,
        } => {
            put_line(&mut out, &format!("HTTP/1.1 {} {}", status_code, reason));
        }
    }

    for (name, value) in headers.iter() {
        for v in value.values() {
            put_header(&mut out, name, v);
        }
    }
    out.put_slice(CRLF);
    out.freeze()
}

fn put_line(out: &mut BytesMut, line: &str) {
    out.put_slice(line.as_bytes());
    out.put_slice(CRLF);
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(CRLF);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::headers::{HeaderMap, HeaderValue};
    use proptest::prelude::*;

    fn limits() -> ParseLimits {
        ParseLimits::default()
    }

    #[test]
    fn incomplete_head_waits_for_more_bytes() {
        let parsed = parse_message_head(b"GET / HTTP/1.1\r\nHost: a\r\n", &limits()).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn splits_head_from_remainder() {
        let buf = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let head = parse_message_head(buf, &limits()).unwrap().unwrap();

        assert_eq!(head.start_line, "POST /a HTTP/1.1");
        assert_eq!(head.headers, vec![RawHeader::new("Content-Length", "3")]);
        assert_eq!(&buf[head.len..], b"abc");
    }

    #[test]
    fn header_values_are_trimmed_and_casing_kept() {
        let buf = b"GET / HTTP/1.1\r\nX-Mixed-Case:   spaced value  \r\nEmpty:\r\n\r\n";
        let head = parse_message_head(buf, &limits()).unwrap().unwrap();

        assert_eq!(head.headers[0], RawHeader::new("X-Mixed-Case", "spaced value"));
        assert_eq!(head.headers[1], RawHeader::new("Empty", ""));
    }

    #[test]
    fn value_may_contain_colons() {
        let buf = b"GET / HTTP/1.1\r\nHost: example.test:8080\r\n\r\n";
        let head = parse_message_head(buf, &limits()).unwrap().unwrap();
        assert_eq!(head.headers[0].value, "example.test:8080");
    }

    #[test]
    fn malformed_header_lines_fail() {
        for bad in [
            &b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\n: empty-name\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nA: 1\r\n folded\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nName : space\r\n\r\n"[..],
        ] {
            assert!(matches!(
                parse_message_head(bad, &limits()),
                Err(ParseError::InvalidHeader(_))
            ));
        }
    }

    #[test]
    fn oversized_heads_are_rejected() {
        let limits = ParseLimits {
            max_header_bytes: 32,
            max_headers: 2,
        };
        let long = vec![b'a'; 64];
        assert_eq!(
            parse_message_head(&long, &limits),
            Err(ParseError::HeadersTooLarge { limit: 32 })
        );

        let many = b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n";
        let limits = ParseLimits {
            max_header_bytes: 1024,
            max_headers: 2,
        };
        assert_eq!(
            parse_message_head(many, &limits),
            Err(ParseError::TooManyHeaders { limit: 2 })
        );
    }

    #[test]
    fn request_line_accepts_any_method_token() {
        let line = parse_request_line("BREW /pot HTTP/1.0").unwrap();
        assert_eq!(line.method, "BREW");
        assert_eq!(line.target, "/pot");
        assert_eq!(line.version, "1.0");
    }

    #[test]
    fn request_line_requires_single_space_separated_triplet() {
        for bad in ["GET /", "GET  / HTTP/1.1", "GET / HTTP/1.1 extra", "GET / FTP/1.1", ""] {
            assert!(parse_request_line(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn status_line_is_anchored_to_http_1_1() {
        let line = parse_status_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(line.status_code, 404);
        assert_eq!(line.reason, "Not Found");

        let bare = parse_status_line("HTTP/1.1 204").unwrap();
        assert_eq!(bare.reason, "");

        for bad in ["HTTP/1.0 200 OK", "HTTP/1.1 20 OK", "HTTP/1.1 abc OK", "garbage"] {
            assert!(parse_status_line(bad).is_err(), "{:?} should fail", bad);
        }
    }

    #[test]
    fn request_head_with_implied_host_on_default_port() {
        let head = Head::Request {
            method: "GET",
            path: "/",
            host: "example.test",
            port: 80,
            protocol: Protocol::Http,
        };
        let bytes = serialize_head(&head, &HeaderTable::new());
        assert_eq!(&bytes[..], b"GET / HTTP/1.1\r\nhost: example.test\r\n\r\n");
    }

    #[test]
    fn request_head_with_explicit_port_and_existing_host() {
        let head = Head::Request {
            method: "PUT",
            path: "/x",
            host: "example.test",
            port: 8443,
            protocol: Protocol::Https,
        };
        let bytes = serialize_head(&head, &HeaderTable::new());
        assert!(bytes.starts_with(b"PUT /x HTTP/1.1\r\nhost: example.test:8443\r\n"));

        let mut headers = HeaderTable::new();
        headers.set("Host", "override.test".into());
        let bytes = serialize_head(&head, &headers);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("ost: ").count(), 1);
        assert!(text.contains("Host: override.test\r\n"));
    }

    #[test]
    fn response_head_repeats_list_values() {
        let mut headers = HeaderTable::new();
        headers.set("Set-Cookie", vec!["a=1", "b=2"].into());
        let head = Head::Response {
            status_code: 200,
            reason: "OK",
        };
        let bytes = serialize_head(&head, &headers);
        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n"
        );
    }

    fn header_name() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z0-9-]{0,11}"
    }

    fn header_value() -> impl Strategy<Value = String> {
        "[!-~]([ -~]{0,14}[!-~])?"
    }

    proptest! {
        #[test]
        fn serialize_then_parse_recovers_folded_headers(
            entries in proptest::collection::vec((header_name(), header_value()), 0..8)
        ) {
            let mut table = HeaderTable::new();
            let mut expected: Vec<RawHeader> = Vec::new();
            for (name, value) in &entries {
                let value = match table.get(name) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merged.push(value.clone());
                        merged
                    }
                    None => HeaderValue::Single(value.clone()),
                };
                table.set(name, value);
            }
            for (name, value) in table.iter() {
                for v in value.values() {
                    expected.push(RawHeader::new(name, v));
                }
            }

            let head = Head::Response { status_code: 200, reason: "OK" };
            let bytes = serialize_head(&head, &table);
            let parsed = parse_message_head(&bytes, &ParseLimits::default()).unwrap().unwrap();

            prop_assert_eq!(parsed.len, bytes.len());
            prop_assert_eq!(&parsed.headers, &expected);
            prop_assert_eq!(HeaderMap::fold(&parsed.headers), HeaderMap::fold(&expected));
        }
    }
}
