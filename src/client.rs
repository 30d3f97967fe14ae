//! Single-shot QSTP client
//!
//! One connection per exchange: connect, handshake, send one payload,
//! receive one payload, close. A refused TCP connect is reported in-band as
//! status `1 CONNECTION REFUSED` by [`QstpClient::request`] so callers can
//! branch on it like any other response.

use crate::address::Address;
use crate::crypto::KemAlgorithm;
use crate::protocol::{Request, Response, StatusCode};
use crate::session::SecureSession;
use crate::QstpError;
use async_trait::async_trait;
use log::debug;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Sends a request to `request.address` and returns the upstream's answer.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: &Request) -> Result<Response, QstpError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QstpClient {
    kem: KemAlgorithm,
    connect_timeout: Option<Duration>,
}

impl QstpClient {
    pub fn new(kem: KemAlgorithm) -> Self {
        Self {
            kem,
            connect_timeout: None,
        }
    }

    /// Give up on the TCP connect after `timeout` with [`QstpError::Timeout`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn kem(&self) -> KemAlgorithm {
        self.kem
    }

    /// Send one opaque payload and return the reply payload.
    ///
    /// A refused connect is `Err(QstpError::ConnectionRefused)` here.
    pub async fn exchange(&self, address: &Address, payload: &[u8]) -> Result<Vec<u8>, QstpError> {
        let mut stream = self.connect(address).await?;

        let result = async {
            let session = SecureSession::initiate(&mut stream, &self.kem).await?;
            session.send(&mut stream, payload).await?;
            session.receive(&mut stream).await
        }
        .await;

        let _ = stream.shutdown().await;
        result
    }

    /// Send `request` to `request.address` and parse the reply.
    pub async fn request(&self, request: &Request) -> Result<Response, QstpError> {
        match self.exchange(&request.address, &request.to_frame()).await {
            Ok(frame) => Response::from_frame(&frame),
            Err(QstpError::ConnectionRefused(addr)) => {
                debug!("Connection to {} refused", addr);
                Ok(Response::new(StatusCode::ConnectionRefused))
            }
            Err(e) => Err(e),
        }
    }

    async fn connect(&self, address: &Address) -> Result<TcpStream, QstpError> {
        let connecting = TcpStream::connect((address.host.as_str(), address.port));
        let connected = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| QstpError::Timeout("connect"))?,
            None => connecting.await,
        };

        let stream = connected.map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionRefused => QstpError::ConnectionRefused(address.to_string()),
            _ => QstpError::Io(e),
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Forwarder for QstpClient {
    async fn forward(&self, request: &Request) -> Result<Response, QstpError> {
        self.request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Method;
    use tokio::net::{TcpListener, TcpSocket};

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_refused_maps_to_status_one() {
        let port = closed_port().await;
        let request = Request::new(Address::new("127.0.0.1", port), Method::Get, "/").unwrap();

        let response = QstpClient::default().request(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::ConnectionRefused);
        assert_eq!(response.status.code(), 1);
    }

    #[tokio::test]
    async fn test_refused_exchange_is_error() {
        let port = closed_port().await;
        let err = QstpClient::default()
            .exchange(&Address::new("127.0.0.1", port), b"raw")
            .await
            .unwrap_err();
        assert!(matches!(err, QstpError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let err = QstpClient::default()
            .exchange(&Address::from(addr), b"raw")
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        // Nothing accepts, so once the backlog is full new SYNs go unanswered.
        let mut queued = Vec::new();
        for _ in 0..16 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }

        let err = QstpClient::default()
            .with_connect_timeout(Duration::from_millis(200))
            .exchange(&Address::from(addr), b"QSTP/1 GET /")
            .await
            .unwrap_err();
        assert!(matches!(err, QstpError::Timeout("connect")), "{:?}", err);
        assert!(err.is_transport());
        drop(listener);
    }
}
