//! Decoders and encoders for inline request payloads
//!
//! SSH request payloads are built from two primitives: a `uint32` in
//! network byte order and a `string`, which is a `uint32` length followed
//! by that many bytes (RFC 4251 section 5). Every decoder here returns
//! `None` on short or inconsistent input and never panics, whatever the
//! peer sends.
//!
//! ```text
//! pty-req        string term, uint32 cols, uint32 rows, [ignored tail]
//! window-change  uint32 cols, uint32 rows, [ignored tail]
//! ```

use bytes::Bytes;

use crate::pty::{Pty, Window};

/// Read a length-prefixed byte string, returning it and the remainder.
pub fn parse_bytes(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = parse_u32(buf)?;
    let len = usize::try_from(len).ok()?;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Read a length-prefixed string. Invalid UTF-8 is replaced, not rejected.
pub fn parse_string(buf: &[u8]) -> Option<(String, &[u8])> {
    let (raw, rest) = parse_bytes(buf)?;
    Some((String::from_utf8_lossy(raw).into_owned(), rest))
}

/// Read a big-endian `uint32`.
pub fn parse_u32(buf: &[u8]) -> Option<(u32, &[u8])> {
    if buf.len() < 4 {
        return None;
    }
    let (head, rest) = buf.split_at(4);
    let value = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    Some((value, rest))
}

/// Decode a `pty-req` payload.
///
/// Dimensions are taken as-is: a 0x0 terminal is a legal allocation
/// (the client may not know its size yet). Pixel sizes and encoded
/// terminal modes after the row count are ignored.
pub fn parse_pty_request(buf: &[u8]) -> Option<Pty> {
    let (term, rest) = parse_string(buf)?;
    let (width, rest) = parse_u32(rest)?;
    let (height, _) = parse_u32(rest)?;
    Some(Pty {
        term,
        window: Window { width, height },
    })
}

/// Decode a `window-change` payload.
///
/// Unlike allocation, a resize to a zero dimension is malformed.
pub fn parse_winch_request(buf: &[u8]) -> Option<Window> {
    let (width, rest) = parse_u32(buf)?;
    if width < 1 {
        return None;
    }
    let (height, _) = parse_u32(rest)?;
    if height < 1 {
        return None;
    }
    Some(Window { width, height })
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append a length-prefixed string.
///
/// Inputs longer than `u32::MAX` cannot be represented and are truncated.
pub fn put_string(buf: &mut Vec<u8>, value: &[u8]) {
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    put_u32(buf, len);
    buf.extend_from_slice(&value[..len as usize]);
}

/// Build a full `pty-req` payload, including the fields the decoder skips.
pub fn encode_pty_request(
    term: &str,
    window: Window,
    pix_width: u32,
    pix_height: u32,
    modes: &[u8],
) -> Bytes {
    let mut buf = Vec::with_capacity(term.len() + modes.len() + 24);
    put_string(&mut buf, term.as_bytes());
    put_u32(&mut buf, window.width);
    put_u32(&mut buf, window.height);
    put_u32(&mut buf, pix_width);
    put_u32(&mut buf, pix_height);
    put_string(&mut buf, modes);
    buf.into()
}

pub fn encode_winch_request(window: Window, pix_width: u32, pix_height: u32) -> Bytes {
    let mut buf = Vec::with_capacity(16);
    put_u32(&mut buf, window.width);
    put_u32(&mut buf, window.height);
    put_u32(&mut buf, pix_width);
    put_u32(&mut buf, pix_height);
    buf.into()
}

/// Payload made of a single string (`exec`, `subsystem`, `signal`).
pub fn encode_string(value: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(value.len() + 4);
    put_string(&mut buf, value);
    buf.into()
}

/// Payload of an `env` request.
pub fn encode_env_request(name: &str, value: &str) -> Bytes {
    let mut buf = Vec::with_capacity(name.len() + value.len() + 8);
    put_string(&mut buf, name.as_bytes());
    put_string(&mut buf, value.as_bytes());
    buf.into()
}

/// Decode an `env` request into its name and value.
pub fn parse_env_request(buf: &[u8]) -> Option<(String, String)> {
    let (name, rest) = parse_string(buf)?;
    let (value, _) = parse_string(rest)?;
    Some((name, value))
}

/// Extra data of a `direct-tcpip` or `forwarded-tcpip` channel open.
///
/// For `direct-tcpip` the address is where the client wants to connect;
/// for `forwarded-tcpip` it is the listening address that accepted the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipChannelData {
    pub host: String,
    pub port: u32,
    pub originator_host: String,
    pub originator_port: u32,
}

impl TcpipChannelData {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (host, rest) = parse_string(buf)?;
        let (port, rest) = parse_u32(rest)?;
        let (originator_host, rest) = parse_string(rest)?;
        let (originator_port, _) = parse_u32(rest)?;
        Some(Self {
            host,
            port,
            originator_host,
            originator_port,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.host.len() + self.originator_host.len() + 16);
        put_string(&mut buf, self.host.as_bytes());
        put_u32(&mut buf, self.port);
        put_string(&mut buf, self.originator_host.as_bytes());
        put_u32(&mut buf, self.originator_port);
        buf.into()
    }
}

/// Payload of `tcpip-forward` and `cancel-tcpip-forward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub bind_host: String,
    pub bind_port: u32,
}

impl ForwardRequest {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (bind_host, rest) = parse_string(buf)?;
        let (bind_port, _) = parse_u32(rest)?;
        Some(Self {
            bind_host,
            bind_port,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.bind_host.len() + 8);
        put_string(&mut buf, self.bind_host.as_bytes());
        put_u32(&mut buf, self.bind_port);
        buf.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pty_payload(term: &str, width: u32, height: u32) -> Vec<u8> {
        encode_pty_request(term, Window::new(width, height), 0, 0, &[]).to_vec()
    }

    #[test]
    fn test_parse_pty_request_xterm() {
        let pty = parse_pty_request(&pty_payload("xterm", 80, 24)).expect("valid pty-req");
        assert_eq!(pty.term, "xterm");
        assert_eq!(pty.window, Window::new(80, 24));
    }

    #[test]
    fn test_parse_pty_request_accepts_zero_size() {
        let pty = parse_pty_request(&pty_payload("dumb terminal", 0, 0)).expect("0x0 is legal");
        assert_eq!(pty.term, "dumb terminal");
        assert_eq!(pty.window, Window::new(0, 0));
    }

    #[test]
    fn test_parse_pty_request_ignores_tail() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"vt100");
        put_u32(&mut buf, 132);
        put_u32(&mut buf, 43);
        let pty = parse_pty_request(&buf).expect("minimal pty-req");
        assert_eq!(pty.window, Window::new(132, 43));
    }

    #[test]
    fn test_parse_pty_request_missing_height() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"xterm");
        put_u32(&mut buf, 80);
        assert!(parse_pty_request(&buf).is_none());
    }

    #[test]
    fn test_parse_pty_request_every_truncation_fails() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"xterm-256color");
        put_u32(&mut buf, 200);
        put_u32(&mut buf, 50);
        for cut in 0..buf.len() {
            assert!(
                parse_pty_request(&buf[..cut]).is_none(),
                "truncated at {} should fail",
                cut
            );
        }
        assert!(parse_pty_request(&buf).is_some());
    }

    #[test]
    fn test_parse_string_length_exceeds_buffer() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 10);
        buf.extend_from_slice(b"short");
        assert!(parse_string(&buf).is_none());
    }

    #[test]
    fn test_parse_string_huge_length() {
        let buf = [0xff, 0xff, 0xff, 0xff, b'a'];
        assert!(parse_string(&buf).is_none());
    }

    #[test]
    fn test_parse_string_returns_remainder() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"abc");
        buf.extend_from_slice(b"tail");
        let (s, rest) = parse_string(&buf).unwrap();
        assert_eq!(s, "abc");
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn test_parse_u32_short() {
        assert!(parse_u32(&[0, 0, 1]).is_none());
        assert_eq!(parse_u32(&[0, 0, 1, 0]).map(|(v, _)| v), Some(256));
    }

    #[test]
    fn test_parse_winch_request_valid() {
        let buf = encode_winch_request(Window::new(120, 40), 0, 0);
        assert_eq!(parse_winch_request(&buf), Some(Window::new(120, 40)));
    }

    #[test]
    fn test_parse_winch_request_zero_width() {
        let buf = encode_winch_request(Window::new(0, 24), 0, 0);
        assert!(parse_winch_request(&buf).is_none());
    }

    #[test]
    fn test_parse_winch_request_zero_height() {
        let buf = encode_winch_request(Window::new(80, 0), 0, 0);
        assert!(parse_winch_request(&buf).is_none());
    }

    #[test]
    fn test_parse_winch_request_minimum() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        put_u32(&mut buf, 1);
        assert_eq!(parse_winch_request(&buf), Some(Window::new(1, 1)));
    }

    #[test]
    fn test_parse_winch_request_truncated() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 80);
        put_u32(&mut buf, 24);
        for cut in 0..buf.len() {
            assert!(parse_winch_request(&buf[..cut]).is_none());
        }
    }

    #[test]
    fn test_parse_env_request() {
        let buf = encode_env_request("LANG", "C.UTF-8");
        assert_eq!(
            parse_env_request(&buf),
            Some(("LANG".to_string(), "C.UTF-8".to_string()))
        );
        assert!(parse_env_request(&buf[..6]).is_none());
    }

    #[test]
    fn test_tcpip_channel_data() {
        let data = TcpipChannelData {
            host: "example.com".to_string(),
            port: 443,
            originator_host: "10.0.0.2".to_string(),
            originator_port: 51000,
        };
        let encoded = data.encode();
        assert_eq!(TcpipChannelData::parse(&encoded), Some(data));
        assert!(TcpipChannelData::parse(&encoded[..encoded.len() - 1]).is_none());
    }

    #[test]
    fn test_forward_request() {
        let mut buf = Vec::new();
        put_string(&mut buf, b"0.0.0.0");
        put_u32(&mut buf, 8080);
        let req = ForwardRequest::parse(&buf).unwrap();
        assert_eq!(req.bind_host, "0.0.0.0");
        assert_eq!(req.bind_port, 8080);
    }
}
