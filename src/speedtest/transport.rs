use crate::error::TransportError;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

pub const NDT7_PROTOCOL: &str = "net.measurementlab.ndt.v7";

pub trait Discovery: Send + Sync {
    fn locate(&self) -> impl Future<Output = Result<Vec<String>, TransportError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Binary(usize),
    Text(String),
}

pub trait SocketConnection: Send {
    /// `None` once the peer has closed the connection.
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Option<Result<SocketMessage, TransportError>>> + Send;

    fn close(&mut self, reason: &str) -> impl Future<Output = ()> + Send;
}

pub trait SocketTransport: Send + Sync {
    type Conn: SocketConnection;

    fn open(
        &self,
        url: &str,
        protocol: &str,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

pub trait HttpTransport: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}

// ---------------------------------------------------------------------------
// Locate service

#[derive(Debug, Deserialize)]
struct LocateResponse {
    #[serde(default)]
    results: Vec<LocateResult>,
}

#[derive(Debug, Deserialize)]
struct LocateResult {
    #[serde(default)]
    urls: std::collections::HashMap<String, String>,
}

impl LocateResult {
    fn download_url(&self) -> Option<&str> {
        self.urls
            .iter()
            .filter(|(key, _)| key.starts_with("wss"))
            .find(|(key, _)| key.as_str() == "wss" || key.contains("download"))
            .map(|(_, url)| url.as_str())
    }
}

pub struct LocateClient {
    client: reqwest::Client,
    url: String,
}

impl LocateClient {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl Discovery for LocateClient {
    async fn locate(&self) -> Result<Vec<String>, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let body: LocateResponse = response.json().await?;
        Ok(body
            .results
            .iter()
            .filter_map(LocateResult::download_url)
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport

pub struct WsTransport;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SocketTransport for WsTransport {
    type Conn = WsConnection;

    async fn open(&self, url: &str, protocol: &str) -> Result<WsConnection, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let protocol = HeaderValue::from_str(protocol)
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", protocol);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::from_connect_message(e.to_string()))?;
        debug!("WebSocket open to {} ({})", url, response.status());

        Ok(WsConnection { stream })
    }
}

impl SocketConnection for WsConnection {
    async fn next_message(&mut self) -> Option<Result<SocketMessage, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::WebSocket(e.to_string()))),
            };
            match message {
                Message::Binary(data) => return Some(Ok(SocketMessage::Binary(data.len()))),
                Message::Text(text) => return Some(Ok(SocketMessage::Text(text))),
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        debug!("Socket closed code={} reason={}", frame.code, frame.reason);
                    }
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("Socket close failed: {}", e);
        }
        if let Err(e) = self.stream.flush().await {
            debug!("Socket flush after close failed: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Plain HTTP downloads

pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for HttpClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body)
    }
}
