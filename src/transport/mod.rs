//! Outbound WebSocket transport.
//!
//! Dials a plain `ws://` endpoint, either directly or through an HTTP
//! CONNECT proxy with optional basic authentication. The proxy handshake is
//! bounded by its own timeout and the whole dial (TCP connect, proxy
//! handshake, WebSocket upgrade) by the connect timeout.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{client_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Stream type produced by [`dial`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the CONNECT response headers read from a proxy.
const MAX_PROXY_RESPONSE_BYTES: usize = 8 * 1024;

/// HTTP CONNECT proxy parameters.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy endpoint, e.g. `http://127.0.0.1:3128`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bound on the CONNECT handshake.
    pub timeout: Duration,
}

impl ProxySettings {
    fn wants_auth(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

/// Everything needed for one connection attempt.
#[derive(Debug, Clone)]
pub struct DialSettings {
    /// WebSocket endpoint, e.g. `ws://host:port/path`.
    pub url: String,
    pub proxy: Option<ProxySettings>,
    /// Bound on the whole dial.
    pub connect_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid WebSocket URL \"{url}\": {message}")]
    InvalidUrl { url: String, message: String },

    #[error("connect timed out after {0:.1?}")]
    Timeout(Duration),

    #[error("proxy {url}: {message}")]
    Proxy { url: String, message: String },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Target {
    host: String,
    port: u16,
}

/// Establish a WebSocket connection according to `settings`.
pub async fn dial(settings: &DialSettings) -> Result<WsStream, TransportError> {
    let target = parse_ws_url(&settings.url)?;
    tokio::time::timeout(settings.connect_timeout, async {
        let tcp = match &settings.proxy {
            Some(proxy) => connect_via_proxy(proxy, &target).await?,
            None => TcpStream::connect((target.host.as_str(), target.port)).await?,
        };
        tcp.set_nodelay(true)?;
        let (stream, _response) =
            client_async(settings.url.as_str(), MaybeTlsStream::Plain(tcp)).await?;
        Ok(stream)
    })
    .await
    .map_err(|_| TransportError::Timeout(settings.connect_timeout))?
}

fn parse_ws_url(raw: &str) -> Result<Target, TransportError> {
    let url = Url::parse(raw).map_err(|error| TransportError::InvalidUrl {
        url: raw.to_string(),
        message: error.to_string(),
    })?;
    if url.scheme() != "ws" {
        return Err(TransportError::InvalidUrl {
            url: raw.to_string(),
            message: format!("unsupported scheme \"{}\"", url.scheme()),
        });
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl {
            url: raw.to_string(),
            message: "missing host".to_string(),
        })?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(Target { host, port })
}

async fn connect_via_proxy(
    proxy: &ProxySettings,
    target: &Target,
) -> Result<TcpStream, TransportError> {
    let proxy_error = |message: String| TransportError::Proxy {
        url: proxy.url.clone(),
        message,
    };
    let parsed =
        Url::parse(&proxy.url).map_err(|error| proxy_error(format!("invalid URL: {}", error)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| proxy_error("missing host".to_string()))?
        .to_string();
    let port = parsed.port_or_known_default().unwrap_or(8080);

    debug!("establishing tunnel to {}:{} via {}", target.host, target.port, proxy.url);
    tokio::time::timeout(proxy.timeout, async {
        let mut tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.write_all(connect_request(target, proxy).as_bytes())
            .await?;
        read_connect_response(&mut tcp, &proxy.url).await?;
        Ok(tcp)
    })
    .await
    .map_err(|_| proxy_error("CONNECT handshake timed out".to_string()))?
}

fn connect_request(target: &Target, proxy: &ProxySettings) -> String {
    let mut request = format!(
        "CONNECT {0}:{1} HTTP/1.1\r\nHost: {0}:{1}\r\n",
        target.host, target.port
    );
    if proxy.wants_auth() {
        let credentials = format!(
            "{}:{}",
            proxy.username.as_deref().unwrap_or(""),
            proxy.password.as_deref().unwrap_or("")
        );
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    request
}

async fn read_connect_response<S>(stream: &mut S, proxy_url: &str) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    let proxy_error = |message: String| TransportError::Proxy {
        url: proxy_url.to_string(),
        message,
    };

    // Read byte-wise so nothing past the header block is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE_BYTES {
            return Err(proxy_error("CONNECT response headers too large".to_string()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(proxy_error(
                "connection closed during CONNECT handshake".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status.starts_with('2') {
        Ok(())
    } else {
        Err(proxy_error(format!("CONNECT rejected: {}", status_line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_settings(username: Option<&str>, password: Option<&str>) -> ProxySettings {
        ProxySettings {
            url: "http://127.0.0.1:3128".to_string(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn parses_ws_urls() {
        let target = parse_ws_url("ws://example.com:9100/agent").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 9100);

        let target = parse_ws_url("ws://example.com/").unwrap();
        assert_eq!(target.port, 80, "ws defaults to port 80");
    }

    #[test]
    fn rejects_non_ws_schemes_and_bad_urls() {
        assert!(matches!(
            parse_ws_url("https://example.com/"),
            Err(TransportError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_ws_url("not a url"),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn connect_request_without_auth() {
        let target = Target {
            host: "example.com".to_string(),
            port: 9100,
        };
        let request = connect_request(&target, &proxy_settings(None, None));
        assert_eq!(
            request,
            "CONNECT example.com:9100 HTTP/1.1\r\nHost: example.com:9100\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_with_basic_auth() {
        let target = Target {
            host: "example.com".to_string(),
            port: 9100,
        };
        let request = connect_request(&target, &proxy_settings(Some("user"), Some("secret")));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpzZWNyZXQ=\r\n"));

        // Either credential half alone still produces the header.
        let request = connect_request(&target, &proxy_settings(Some("user"), None));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjo=\r\n"));
    }

    #[tokio::test]
    async fn accepts_a_2xx_connect_response() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
        read_connect_response(&mut client, "http://proxy/").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_a_non_2xx_connect_response() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
        let error = read_connect_response(&mut client, "http://proxy/")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("CONNECT rejected"));
    }

    #[tokio::test]
    async fn rejects_a_truncated_connect_response() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        let error = read_connect_response(&mut client, "http://proxy/")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("closed during CONNECT"));
    }

    #[tokio::test]
    async fn leaves_bytes_after_the_headers_unread() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"HTTP/1.1 200 OK\r\n\r\npayload")
            .await
            .unwrap();
        read_connect_response(&mut client, "http://proxy/").await.unwrap();

        let mut rest = [0u8; 7];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }
}
