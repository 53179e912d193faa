//! Server name extraction from a TLS ClientHello.
//!
//! The intercepted-TLS listener decides on the SNI before it knows whether
//! it will splice or terminate, so the ClientHello is read with
//! `TcpStream::peek` and left in the socket for whoever handles it next.

use std::time::Duration;
use tokio::net::TcpStream;

/// Largest ClientHello we are willing to buffer.
pub const MAX_CLIENT_HELLO: usize = 16 * 1024;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

/// What a (possibly partial) ClientHello says about the server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHelloSni {
    /// A host name was offered.
    Found(String),
    /// A complete ClientHello without a usable server name.
    Absent,
    /// More bytes are needed.
    Incomplete,
    /// The bytes are not a TLS ClientHello.
    NotTls,
}

/// Byte cursor over a ClientHello. Every read reports running short as
/// `None`, which the caller turns into `Incomplete` or `NotTls`.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}

/// Parse the server name out of the start of a TLS stream.
///
/// Only the first record is considered. A ClientHello split across records
/// is reported as `Absent`, which the proxy denies.
pub fn parse_client_hello(buf: &[u8]) -> ClientHelloSni {
    let mut record = Reader::new(buf);
    let header = match record.take(RECORD_HEADER_LEN) {
        Some(h) => h,
        None if !buf.is_empty() && buf[0] != CONTENT_TYPE_HANDSHAKE => {
            return ClientHelloSni::NotTls;
        }
        None => return ClientHelloSni::Incomplete,
    };
    if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 0x03 {
        return ClientHelloSni::NotTls;
    }
    let record_len = usize::from(u16::from_be_bytes([header[3], header[4]]));
    let Some(body) = record.take(record_len) else {
        return if RECORD_HEADER_LEN + record_len > MAX_CLIENT_HELLO {
            ClientHelloSni::NotTls
        } else {
            ClientHelloSni::Incomplete
        };
    };

    match parse_handshake(body) {
        Some(Some(name)) => ClientHelloSni::Found(name),
        Some(None) => ClientHelloSni::Absent,
        None => ClientHelloSni::NotTls,
    }
}

/// `None` means malformed, `Some(None)` means no host name.
fn parse_handshake(body: &[u8]) -> Option<Option<String>> {
    let mut r = Reader::new(body);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = r.u24()?;
    let Some(hello) = r.take(len) else {
        return Some(None);
    };

    let mut r = Reader::new(hello);
    r.take(2)?; // legacy_version
    r.take(32)?; // random
    r.vec8()?; // session id
    r.vec16()?; // cipher suites
    r.vec8()?; // compression methods
    let Some(extensions) = r.vec16() else {
        return Some(None);
    };

    let mut r = Reader::new(extensions);
    while let Some(kind) = r.u16() {
        let data = r.vec16()?;
        if kind == EXTENSION_SERVER_NAME {
            return Some(parse_server_name_list(data));
        }
    }
    Some(None)
}

fn parse_server_name_list(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);
    let list = r.vec16()?;
    let mut r = Reader::new(list);
    while let Some(name_type) = r.u8() {
        let name = r.vec16()?;
        if name_type == NAME_TYPE_HOST {
            let name = std::str::from_utf8(name).ok()?;
            if name.is_empty() {
                return None;
            }
            return Some(name.trim_end_matches('.').to_ascii_lowercase());
        }
    }
    None
}

/// Peek at `stream` until the ClientHello can be parsed.
///
/// Returns `Incomplete` if the client stalls past `timeout` or closes.
pub async fn peek_sni(stream: &TcpStream, timeout: Duration) -> std::io::Result<ClientHelloSni> {
    let mut buf = vec![0u8; MAX_CLIENT_HELLO];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_len = 0;

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(ClientHelloSni::Incomplete),
        };
        if n == 0 {
            return Ok(ClientHelloSni::Incomplete);
        }
        match parse_client_hello(&buf[..n]) {
            ClientHelloSni::Incomplete if n < buf.len() => {
                // peek returns the same bytes until more arrive; wait for
                // readability only once the buffer stopped growing.
                if n == last_len {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(ClientHelloSni::Incomplete);
                    }
                }
                last_len = n;
            }
            ClientHelloSni::Incomplete => return Ok(ClientHelloSni::NotTls),
            done => return Ok(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16be(n: usize) -> [u8; 2] {
        (n as u16).to_be_bytes()
    }

    /// Build a minimal ClientHello record, optionally with an SNI extension.
    fn client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        // An unrelated extension first (supported_versions).
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);
        if let Some(name) = sni {
            let mut list = vec![NAME_TYPE_HOST];
            list.extend_from_slice(&u16be(name.len()));
            list.extend_from_slice(name.as_bytes());

            let mut ext = Vec::new();
            ext.extend_from_slice(&u16be(list.len()));
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&u16be(ext.len()));
            extensions.extend_from_slice(&ext);
        }

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0xAB; 32]);
        hello.push(0); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        hello.extend_from_slice(&u16be(extensions.len()));
        hello.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO, 0];
        handshake.extend_from_slice(&u16be(hello.len()));
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&u16be(handshake.len()));
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_extracts_server_name() {
        let hello = client_hello(Some("API.GitHub.com."));
        assert_eq!(
            parse_client_hello(&hello),
            ClientHelloSni::Found("api.github.com".to_string())
        );
    }

    #[test]
    fn test_missing_server_name() {
        assert_eq!(parse_client_hello(&client_hello(None)), ClientHelloSni::Absent);
    }

    #[test]
    fn test_partial_hello_needs_more() {
        let hello = client_hello(Some("pypi.org"));
        assert_eq!(parse_client_hello(&[]), ClientHelloSni::Incomplete);
        assert_eq!(parse_client_hello(&hello[..3]), ClientHelloSni::Incomplete);
        assert_eq!(
            parse_client_hello(&hello[..hello.len() - 4]),
            ClientHelloSni::Incomplete
        );
    }

    #[test]
    fn test_plain_http_is_not_tls() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\nHost: evil.io\r\n\r\n"),
            ClientHelloSni::NotTls
        );
        assert_eq!(parse_client_hello(b"G"), ClientHelloSni::NotTls);
    }

    #[test]
    fn test_truncated_extension_is_malformed() {
        let mut hello = client_hello(Some("pypi.org"));
        // Claim a longer SNI extension than the record holds, keeping the
        // record and handshake lengths consistent.
        let pos = hello.len() - "pypi.org".len() - 7;
        hello[pos] = 0xFF;
        assert_eq!(parse_client_hello(&hello), ClientHelloSni::NotTls);
    }

    #[tokio::test]
    async fn test_peek_leaves_bytes_in_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hello = client_hello(Some("pypi.org"));

        let sent = hello.clone();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Two writes so the server may observe a partial hello first.
            stream.write_all(&sent[..10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(&sent[10..]).await.unwrap();
            stream
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let sni = peek_sni(&server, Duration::from_secs(5)).await.unwrap();
        assert_eq!(sni, ClientHelloSni::Found("pypi.org".to_string()));

        let mut received = vec![0u8; hello.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, hello);
        drop(client.await.unwrap());
    }
}
