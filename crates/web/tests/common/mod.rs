#![allow(dead_code, reason = "each test binary uses a different subset of the helpers")]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use onion_web::{HttpHandler, Server, ServerConfig};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> ServerConfig {
    ServerConfig::default()
        .with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(0)
        .with_shutdown_delay(Duration::from_millis(20))
        .with_socket_timeout(Duration::from_secs(2))
}

pub async fn start_server<H: HttpHandler + 'static>(config: ServerConfig, root: H) -> (Server, SocketAddr) {
    let server = Server::new(config, root);
    server.start().await.expect("server starts");
    let addr = server.local_addr().expect("server is bound");
    (server, addr)
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).expect("utf-8 body")
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

/// Sends one `Connection: close` request and reads the response up to EOF.
pub async fn send(addr: SocketAddr, request: &str) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connects");
    stream.write_all(request.as_bytes()).await.expect("request is written");
    read_response(&mut stream).await.expect("a response")
}

/// Reads exactly one response from a keep-alive stream. `None` when the
/// server closed the connection before sending anything.
pub async fn read_response(stream: &mut TcpStream) -> Option<RawResponse> {
    tokio::time::timeout(READ_TIMEOUT, read_response_inner(stream)).await.expect("response within timeout")
}

async fn read_response_inner(stream: &mut TcpStream) -> Option<RawResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];

    let (head_len, status, headers) = loop {
        let mut parsed_headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut parsed_headers);
        if let httparse::Status::Complete(len) = response.parse(&buf).expect("valid response head") {
            let status = response.code.expect("status code");
            let headers = response
                .headers
                .iter()
                .map(|h| (h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned()))
                .collect::<Vec<_>>();
            break (len, status, headers);
        }

        let n = stream.read(&mut chunk).await.expect("read");
        if n == 0 {
            assert!(buf.is_empty(), "connection closed mid response");
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut body = buf.split_off(head_len);
    let content_length = headers.iter().find(|(name, _)| name == "content-length").map(|(_, value)| value.parse::<usize>().expect("numeric length"));

    match content_length {
        Some(length) => {
            while body.len() < length {
                let n = stream.read(&mut chunk).await.expect("read");
                assert_ne!(n, 0, "connection closed mid body");
                body.extend_from_slice(&chunk[..n]);
            }
        }
        None => {
            stream.read_to_end(&mut body).await.expect("read to end");
        }
    }

    Some(RawResponse { status, headers, body })
}

/// True once the peer has closed `stream`.
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut byte = [0_u8; 1];
    matches!(tokio::time::timeout(READ_TIMEOUT, stream.read(&mut byte)).await, Ok(Ok(0) | Err(_)))
}
