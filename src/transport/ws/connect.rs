use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::{AdapterError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Get proxy URL from environment variables
fn get_proxy_url() -> Option<String> {
    std::env::var("HTTPS_PROXY")
        .or_else(|_| std::env::var("https_proxy"))
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .or_else(|_| std::env::var("http_proxy"))
        .or_else(|_| std::env::var("ALL_PROXY"))
        .or_else(|_| std::env::var("all_proxy"))
        .ok()
}

/// Parse proxy URL into host and port
pub(crate) fn parse_proxy_url(proxy_url: &str) -> Option<(String, u16)> {
    // Accepts "http://127.0.0.1:7897" as well as "127.0.0.1:7897"
    let url = if proxy_url.contains("://") {
        Url::parse(proxy_url).ok()?
    } else {
        Url::parse(&format!("http://{}", proxy_url)).ok()?
    };

    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(8080);
    Some((host, port))
}

/// Connect to target host through HTTP CONNECT proxy
async fn connect_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream> {
    debug!(
        "Connecting to {}:{} via proxy {}:{}",
        target_host, target_port, proxy_host, proxy_port
    );

    let proxy_addr = format!("{}:{}", proxy_host, proxy_port);
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| AdapterError::Transport(format!("Proxy connection timeout: {}", proxy_addr)))?
        .map_err(|e| AdapterError::Transport(format!("Failed to connect to proxy: {}", e)))?;

    let stream = open_tunnel(stream, target_host, target_port).await?;
    debug!("Proxy tunnel established to {}:{}", target_host, target_port);
    Ok(stream)
}

/// [`proxy_handshake`] bounded by the connect timeout
async fn open_tunnel<S>(stream: S, target_host: &str, target_port: u16) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(
        CONNECT_TIMEOUT,
        proxy_handshake(stream, target_host, target_port),
    )
    .await
    .map_err(|_| {
        AdapterError::Transport(format!(
            "Proxy CONNECT to {}:{} timed out",
            target_host, target_port
        ))
    })?
}

/// Send `CONNECT` and consume the proxy's reply up to the blank line
async fn proxy_handshake<S>(stream: S, target_host: &str, target_port: u16) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connect_request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\nConnection: keep-alive\r\n\r\n",
        target_host, target_port, target_host, target_port
    );

    let mut buf_reader = BufReader::new(stream);
    buf_reader
        .get_mut()
        .write_all(connect_request.as_bytes())
        .await
        .map_err(|e| AdapterError::Transport(format!("Failed to send CONNECT: {}", e)))?;

    let mut response_line = String::new();
    buf_reader
        .read_line(&mut response_line)
        .await
        .map_err(|e| AdapterError::Transport(format!("Failed to read proxy response: {}", e)))?;

    if !response_line.contains("200") {
        return Err(AdapterError::Transport(format!(
            "Proxy CONNECT failed: {}",
            response_line.trim()
        )));
    }

    // Drain remaining headers up to the blank line
    loop {
        let mut line = String::new();
        let read = buf_reader
            .read_line(&mut line)
            .await
            .map_err(|e| AdapterError::Transport(format!("Failed to read proxy headers: {}", e)))?;
        if read == 0 {
            return Err(AdapterError::Transport(
                "Proxy closed the tunnel during CONNECT".to_string(),
            ));
        }
        if line.trim().is_empty() {
            break;
        }
    }

    Ok(buf_reader.into_inner())
}

/// Connect a WebSocket, tunnelling through `proxy` (or the environment proxy) when set
pub async fn connect_websocket(url: &Url, proxy: Option<&str>) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| AdapterError::Validation(format!("No host in URL: {}", url)))?;
    let secure = url.scheme() == "wss";
    let port = url.port().unwrap_or(if secure { 443 } else { 80 });

    let proxy_url = proxy.map(str::to_string).or_else(get_proxy_url);
    if let Some((proxy_host, proxy_port)) = proxy_url.as_deref().and_then(parse_proxy_url) {
        info!("Using proxy {}:{} for venue WebSocket", proxy_host, proxy_port);

        let tcp_stream = connect_via_proxy(&proxy_host, proxy_port, host, port).await?;

        let stream = if secure {
            let connector = native_tls::TlsConnector::new()
                .map_err(|e| AdapterError::Transport(format!("TLS connector error: {}", e)))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tls_stream = timeout(CONNECT_TIMEOUT, connector.connect(host, tcp_stream))
                .await
                .map_err(|_| AdapterError::Transport("TLS handshake timeout".to_string()))?
                .map_err(|e| AdapterError::Transport(format!("TLS handshake failed: {}", e)))?;
            MaybeTlsStream::NativeTls(tls_stream)
        } else {
            MaybeTlsStream::Plain(tcp_stream)
        };

        let (ws_stream, _response) = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::client_async(url.as_str(), stream),
        )
        .await
        .map_err(|_| AdapterError::Transport("WebSocket handshake timeout".to_string()))?
        .map_err(|e| AdapterError::Transport(format!("WebSocket handshake failed: {}", e)))?;

        return Ok(ws_stream);
    }

    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| AdapterError::Transport("WebSocket connection timeout".to_string()))?
        .map_err(AdapterError::WebSocket)?;

    Ok(ws_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxy_with_and_without_scheme() {
        assert_eq!(
            parse_proxy_url("http://127.0.0.1:7897"),
            Some(("127.0.0.1".to_string(), 7897))
        );
        assert_eq!(
            parse_proxy_url("proxy.internal:3128"),
            Some(("proxy.internal".to_string(), 3128))
        );
        assert_eq!(
            parse_proxy_url("http://proxy.internal"),
            Some(("proxy.internal".to_string(), 8080))
        );
    }

    #[tokio::test]
    async fn proxy_handshake_consumes_reply_headers() {
        let (client, mut proxy) = tokio::io::duplex(1024);
        proxy
            .write_all(b"HTTP/1.1 200 Connection established\r\nProxy-Agent: test\r\n\r\n")
            .await
            .unwrap();

        let tunnel = proxy_handshake(client, "api-pub.bitfinex.com", 443).await;
        assert!(tunnel.is_ok());

        let mut request = vec![0u8; 128];
        let n = tokio::io::AsyncReadExt::read(&mut proxy, &mut request)
            .await
            .unwrap();
        let request = String::from_utf8_lossy(&request[..n]);
        assert!(request.starts_with("CONNECT api-pub.bitfinex.com:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn proxy_refusal_is_reported() {
        let (client, mut proxy) = tokio::io::duplex(1024);
        proxy
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        let err = proxy_handshake(client, "api-pub.bitfinex.com", 443)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_proxy_times_out() {
        // proxy end stays open but never answers
        let (client, _proxy) = tokio::io::duplex(1024);

        let started = tokio::time::Instant::now();
        let err = open_tunnel(client, "api-pub.bitfinex.com", 443)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() >= CONNECT_TIMEOUT);
    }
}
