//! HTTP head codec for the opening handshake
//!
//! Reads and writes the CR-LF delimited start line plus headers that frame
//! a WebSocket upgrade. Header names are case-insensitive; comma-joined and
//! repeated headers are exposed both raw and as split lists, which
//! normalizes multiple `Sec-WebSocket-Protocol` headers into one ordered
//! list. Lines longer than the configured ceiling are rejected.

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::MAX_HEAD_LINE;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ordered header collection with case-insensitive lookup
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, raw
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every entry for `name` with a single value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
        self
    }

    /// Add an entry without disturbing existing ones with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push((name.into(), value.into()));
        self
    }

    /// All values for `name`, merging repeated headers and splitting
    /// comma-separated lists, in order of appearance
    pub fn values(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        for (n, v) in &self.entries {
            if n.eq_ignore_ascii_case(name) {
                for part in v.split(',') {
                    let part = part.trim();
                    if !part.is_empty() {
                        out.push(part.to_string());
                    }
                }
            }
        }
        out
    }

    /// Set `name` to a comma-joined list
    pub fn set_values(&mut self, name: impl Into<String>, values: &[String]) -> &mut Self {
        self.set(name, values.join(", "))
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Request head: start line plus headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// HTTP method
    pub method: String,
    /// Request target, e.g. `/chat?room=1`
    pub target: String,
    /// HTTP version token
    pub version: String,
    /// Header collection
    pub headers: Headers,
}

impl RequestHead {
    /// Create a `HTTP/1.1` request head
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
        }
    }

    /// Read a request head from the stream
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_head_line(reader).await?;
        let mut parts = line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
            _ => return Err(HandshakeError::MalformedStartLine(line).into()),
        };
        let headers = read_headers(reader).await?;
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Write the head, including the terminating empty line
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut out = format!("{} {} {}\r\n", self.method, self.target, self.version);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Response head: status line plus headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: u16,
    /// Status reason phrase
    pub reason: String,
    /// Header collection
    pub headers: Headers,
}

impl ResponseHead {
    /// Create a response head
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    /// Read a response head from the stream
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = read_head_line(reader).await?;
        let mut parts = line.split_whitespace();
        let _version = parts
            .next()
            .ok_or_else(|| HandshakeError::MalformedStartLine(line.clone()))?;
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| HandshakeError::MalformedStartLine(line.clone()))?;
        let reason = parts.collect::<Vec<_>>().join(" ");
        let headers = read_headers(reader).await?;
        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Write the head, including the terminating empty line
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Read one CR-LF terminated line, enforcing the line ceiling
async fn read_head_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take((MAX_HEAD_LINE + 1) as u64);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "unexpected EOF (head)",
        )
        .into());
    }
    if !line.ends_with(b"\n") {
        if line.len() > MAX_HEAD_LINE {
            return Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_LINE }.into());
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "unexpected EOF (head)",
        )
        .into());
    }
    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Read `Name: value` lines up to and including the empty terminator
async fn read_headers<R>(reader: &mut R) -> Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    loop {
        let line = read_head_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::MalformedHeader(line.clone()))?;
        headers.append(name.trim(), value.trim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn parse_request(raw: &str) -> Result<RequestHead> {
        let mut reader = std::io::Cursor::new(raw.as_bytes().to_vec());
        RequestHead::read(&mut reader).await
    }

    #[tokio::test]
    async fn parses_upgrade_request() {
        let raw = "GET /chat?room=1 HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\
                   \r\n";
        let head = parse_request(raw).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat?room=1");
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("UPGRADE"), Some("websocket"));
    }

    #[tokio::test]
    async fn merges_repeated_and_comma_joined_protocol_headers() {
        let raw = "GET / HTTP/1.1\r\n\
                   Sec-WebSocket-Protocol: chat, superchat\r\n\
                   sec-websocket-protocol: log\r\n\
                   \r\n";
        let head = parse_request(raw).await.unwrap();
        assert_eq!(
            head.headers.values("Sec-WebSocket-Protocol"),
            vec!["chat", "superchat", "log"]
        );
        // raw value of the first entry is still reachable
        assert_eq!(
            head.headers.get("Sec-WebSocket-Protocol"),
            Some("chat, superchat")
        );
    }

    #[tokio::test]
    async fn rejects_oversize_line() {
        let raw = format!("GET /{} HTTP/1.1\r\n\r\n", "x".repeat(MAX_HEAD_LINE));
        match parse_request(&raw).await {
            Err(Error::Handshake(HandshakeError::HeadTooLarge { .. })) => {}
            other => panic!("expected HeadTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejects_header_without_colon() {
        let raw = "GET / HTTP/1.1\r\nnot-a-header\r\n\r\n";
        assert!(parse_request(raw).await.is_err());
    }

    #[tokio::test]
    async fn response_round_trip() {
        let mut head = ResponseHead::new(101, "Switching Protocols");
        head.headers
            .set("Upgrade", "websocket")
            .set("Connection", "Upgrade,keep-alive");

        let mut out = Vec::new();
        head.write(&mut out).await.unwrap();
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let mut reader = std::io::Cursor::new(out);
        let parsed = ResponseHead::read(&mut reader).await.unwrap();
        assert_eq!(parsed.status, 101);
        assert_eq!(parsed.headers.get("connection"), Some("Upgrade,keep-alive"));
    }

    #[tokio::test]
    async fn set_replaces_all_matching_entries() {
        let mut headers = Headers::new();
        headers.append("X-Test", "a").append("x-test", "b");
        headers.set("X-TEST", "c");
        assert_eq!(headers.values("x-test"), vec!["c"]);
    }
}
