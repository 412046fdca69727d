//! `Host` header rewriting for forwarded request bytes.
//!
//! Only the first two CRLF-delimited lines of a chunk are inspected, and the
//! header is recognised only on the second line. Anything the rewriter cannot
//! make sense of is forwarded untouched.

use std::borrow::Cow;

use tracing::debug;

const CRLF: &[u8] = b"\r\n";
const HOST_HEADER: &str = "Host";

/// Rewrite the `Host` header on the second line of `chunk` to `target`.
///
/// A numeric port on the original value is kept (`Host: localhost:3000`
/// becomes `Host: <target>:3000`). Returns the chunk unchanged when no target
/// is set, when the chunk has fewer than two lines, when the prefix is not
/// valid UTF-8, or when the second line is not a `Host` header.
pub fn rewrite_host<'a>(chunk: &'a [u8], target: Option<&str>) -> Cow<'a, [u8]> {
    let Some(target) = target else {
        return Cow::Borrowed(chunk);
    };

    let Some(prefix_len) = two_line_prefix_len(chunk) else {
        return Cow::Borrowed(chunk);
    };
    let Ok(prefix) = std::str::from_utf8(&chunk[..prefix_len]) else {
        return Cow::Borrowed(chunk);
    };
    let Some((first, second)) = prefix.split_once("\r\n") else {
        return Cow::Borrowed(chunk);
    };

    let Some(value) = header_value(second, HOST_HEADER) else {
        return Cow::Borrowed(chunk);
    };

    let mut host_line = format!("{HOST_HEADER}: {target}");
    if let Some(port) = numeric_port(value) {
        host_line.push(':');
        host_line.push_str(port);
    }
    debug!(from = %second, to = %host_line, "Rewrote Host header");

    let rest = &chunk[prefix_len..];
    let mut out = Vec::with_capacity(first.len() + CRLF.len() + host_line.len() + rest.len());
    out.extend_from_slice(first.as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(host_line.as_bytes());
    out.extend_from_slice(rest);
    Cow::Owned(out)
}

/// Byte length of the first two lines, excluding the CRLF that ends the
/// second one. `None` if the chunk has no CRLF at all.
fn two_line_prefix_len(chunk: &[u8]) -> Option<usize> {
    let first_end = find_crlf(chunk)?;
    let second_start = first_end + CRLF.len();
    let second_len = find_crlf(&chunk[second_start..]).unwrap_or(chunk.len() - second_start);
    Some(second_start + second_len)
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(CRLF.len()).position(|w| w == CRLF)
}

/// Value of `line` when its header name is exactly `name`.
fn header_value<'l>(line: &'l str, name: &str) -> Option<&'l str> {
    let mut parts = line.split(": ");
    if parts.next()? != name {
        return None;
    }
    parts.next()
}

/// Port text after the first `:` when it is a non-zero decimal number.
///
/// The value is not range-checked: `x:99999` keeps `99999`, since the text
/// is copied as-is. Zero (`x:0`, `x:000`) and anything with non-digits is
/// dropped.
fn numeric_port(value: &str) -> Option<&str> {
    let port = value.split(':').nth(1)?;
    let digits = port.trim();
    let numeric = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
    (numeric && digits.bytes().any(|b| b != b'0')).then_some(port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rewrite(input: &str, target: Option<&str>) -> String {
        String::from_utf8(rewrite_host(input.as_bytes(), target).into_owned()).unwrap()
    }

    #[test]
    fn no_target_returns_chunk_unchanged() {
        let input = "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let out = rewrite_host(input.as_bytes(), None);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, input.as_bytes());
    }

    #[test]
    fn rewrites_host_on_second_line() {
        let input = "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let out = rewrite(input, Some("my.host.com"));

        let lines: Vec<&str> = out.split("\r\n").collect();
        assert_eq!(lines[0], "GET / HTTP/1.1");
        assert_eq!(lines[1], "Host: my.host.com");
        assert!(out.ends_with("\r\n\r\n"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com\r\n\r\n");
    }

    #[test]
    fn keeps_numeric_port() {
        let out = rewrite("GET / HTTP/1.1\r\nHost: localhost:3001\r\n\r\n", Some("my.host.com"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com:3001\r\n\r\n");
    }

    #[test]
    fn drops_non_numeric_port() {
        let out = rewrite("GET / HTTP/1.1\r\nHost: localhost:abc\r\n\r\n", Some("my.host.com"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com\r\n\r\n");
    }

    #[test]
    fn out_of_range_port_is_kept_verbatim() {
        let out = rewrite("GET / HTTP/1.1\r\nHost: localhost:99999\r\n\r\n", Some("my.host.com"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com:99999\r\n\r\n");
    }

    #[test]
    fn zero_port_is_dropped() {
        let out = rewrite("GET / HTTP/1.1\r\nHost: localhost:000\r\n\r\n", Some("my.host.com"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com\r\n\r\n");
    }

    #[test]
    fn non_http_lines_are_untouched() {
        let input = "1\r\n2\r\n3\r\n4";
        assert_eq!(rewrite(input, Some("my.host.com")), input);
    }

    #[test]
    fn single_line_is_untouched() {
        let input = "GET / HTTP/1.1";
        assert_eq!(rewrite(input, Some("my.host.com")), input);
    }

    #[test]
    fn host_not_on_second_line_is_untouched() {
        let input = "GET / HTTP/1.1\r\nAccept: */*\r\nHost: localhost\r\n\r\n";
        assert_eq!(rewrite(input, Some("my.host.com")), input);
    }

    #[test]
    fn header_name_is_case_sensitive() {
        let input = "GET / HTTP/1.1\r\nhost: localhost\r\n\r\n";
        assert_eq!(rewrite(input, Some("my.host.com")), input);
    }

    #[test]
    fn two_lines_without_trailing_bytes() {
        let out = rewrite("GET / HTTP/1.1\r\nHost: localhost", Some("my.host.com"));
        assert_eq!(out, "GET / HTTP/1.1\r\nHost: my.host.com");
    }

    #[test]
    fn multibyte_value_splices_on_byte_offsets() {
        let input = "GET /päth HTTP/1.1\r\nHost: bücher.example\r\nX-Name: ☃\r\n\r\nbody";
        let out = rewrite(input, Some("ünïcode.example"));
        assert_eq!(
            out,
            "GET /päth HTTP/1.1\r\nHost: ünïcode.example\r\nX-Name: ☃\r\n\r\nbody"
        );
    }

    #[test]
    fn invalid_utf8_prefix_is_untouched() {
        let mut input = b"GET /\xff HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec();
        input.extend_from_slice(b"rest");
        let out = rewrite_host(&input, Some("my.host.com"));
        assert_eq!(&*out, input.as_slice());
    }

    #[test]
    fn binary_body_after_headers_is_preserved() {
        let mut input = b"POST / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec();
        input.extend_from_slice(&[0xff, 0x00, 0xfe]);
        let out = rewrite_host(&input, Some("x.y"));

        let mut expected = b"POST / HTTP/1.1\r\nHost: x.y\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xff, 0x00, 0xfe]);
        assert_eq!(&*out, expected.as_slice());
    }
}
