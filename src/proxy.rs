//! Transparent proxy: an opaque, hookable relay between two secure sessions
//!
//! Each downstream payload is decrypted, optionally rewritten by the
//! client-data hook, sent to the fixed upstream over a fresh client
//! connection, and the upstream's reply is optionally rewritten by the
//! server-data hook before going back downstream. No QSTP parsing happens
//! here unless a hook built with [`request_hook`] / [`response_hook`] does it.

use crate::address::Address;
use crate::client::QstpClient;
use crate::protocol::{Request, Response, StatusCode};
use crate::server::FrameHandler;
use crate::QstpError;
use async_trait::async_trait;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;

/// Rewrites a relayed payload; receives the downstream peer's address.
pub type ByteHook = Arc<dyn Fn(Vec<u8>, SocketAddr) -> Vec<u8> + Send + Sync>;

pub struct TransparentProxy {
    upstream: Address,
    client: QstpClient,
    client_hook: Option<ByteHook>,
    server_hook: Option<ByteHook>,
}

impl TransparentProxy {
    pub fn new(upstream: Address, client: QstpClient) -> Self {
        Self {
            upstream,
            client,
            client_hook: None,
            server_hook: None,
        }
    }

    /// Hook applied to payloads travelling from the client to the upstream.
    pub fn on_client_data<H>(mut self, hook: H) -> Self
    where
        H: Fn(Vec<u8>, SocketAddr) -> Vec<u8> + Send + Sync + 'static,
    {
        self.client_hook = Some(Arc::new(hook));
        self
    }

    /// Hook applied to replies travelling from the upstream to the client.
    pub fn on_server_data<H>(mut self, hook: H) -> Self
    where
        H: Fn(Vec<u8>, SocketAddr) -> Vec<u8> + Send + Sync + 'static,
    {
        self.server_hook = Some(Arc::new(hook));
        self
    }

    pub fn upstream(&self) -> &Address {
        &self.upstream
    }

    /// Relay one payload. A refused upstream connect yields a
    /// `1 CONNECTION REFUSED` frame; other failures are errors.
    pub async fn relay(&self, payload: Vec<u8>, peer: SocketAddr) -> Result<Vec<u8>, QstpError> {
        let outbound = match &self.client_hook {
            Some(hook) => hook(payload, peer),
            None => payload,
        };

        debug!(
            "Relaying {} bytes from {} to {}",
            outbound.len(),
            peer,
            self.upstream
        );
        let reply = match self.client.exchange(&self.upstream, &outbound).await {
            Ok(reply) => reply,
            Err(QstpError::ConnectionRefused(addr)) => {
                warn!("Upstream {} refused connection", addr);
                Response::new(StatusCode::ConnectionRefused).to_frame()
            }
            Err(e) => return Err(e),
        };

        Ok(match &self.server_hook {
            Some(hook) => hook(reply, peer),
            None => reply,
        })
    }
}

#[async_trait]
impl FrameHandler for TransparentProxy {
    async fn handle(&self, payload: Vec<u8>, peer: SocketAddr) -> anyhow::Result<Vec<u8>> {
        Ok(self.relay(payload, peer).await?)
    }
}

/// Adapt a typed request rewrite into a client-data hook. Payloads that do
/// not parse as a request are relayed unchanged.
pub fn request_hook<F>(rewrite: F) -> impl Fn(Vec<u8>, SocketAddr) -> Vec<u8> + Send + Sync + 'static
where
    F: Fn(Request) -> Request + Send + Sync + 'static,
{
    move |payload, peer| match Request::from_frame(&payload, Address::from(peer)) {
        Ok(request) => rewrite(request).to_frame(),
        Err(e) => {
            debug!("Relaying unparsed client payload from {}: {}", peer, e);
            payload
        }
    }
}

/// Adapt a typed response rewrite into a server-data hook. Payloads that do
/// not parse as a response are relayed unchanged.
pub fn response_hook<F>(rewrite: F) -> impl Fn(Vec<u8>, SocketAddr) -> Vec<u8> + Send + Sync + 'static
where
    F: Fn(Response) -> Response + Send + Sync + 'static,
{
    move |payload, peer| match Response::from_frame(&payload) {
        Ok(response) => rewrite(response).to_frame(),
        Err(e) => {
            debug!("Relaying unparsed upstream payload to {}: {}", peer, e);
            payload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Method;

    fn peer() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn test_request_hook_rewrites() {
        let hook = request_hook(|req| req.with_header("X-Seen", "1").unwrap());
        let frame = Request::new(Address::new("x", 1), Method::Get, "/a").unwrap().to_frame();

        let rewritten = hook(frame, peer());
        let parsed = Request::from_frame(&rewritten, Address::from(peer())).unwrap();
        assert_eq!(parsed.headers.get("X-Seen"), Some("1"));
        assert_eq!(parsed.path(), "/a");
    }

    #[test]
    fn test_hooks_pass_through_garbage() {
        let req_hook = request_hook(|req| req.with_data("changed"));
        let resp_hook = response_hook(|resp| resp.with_data("changed"));

        assert_eq!(req_hook(b"not qstp".to_vec(), peer()), b"not qstp");
        assert_eq!(resp_hook(b"\xff\xfe".to_vec(), peer()), b"\xff\xfe");
    }

    #[test]
    fn test_response_hook_rewrites() {
        let hook = response_hook(|resp| resp.with_data("sv_mod"));
        let frame = Response::new(StatusCode::Ok).to_frame();

        let rewritten = Response::from_frame(&hook(frame, peer())).unwrap();
        assert_eq!(rewritten.status, StatusCode::Ok);
        assert_eq!(&rewritten.data[..], b"sv_mod");
    }

    #[tokio::test]
    async fn test_refused_upstream_is_status_one() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let proxy = TransparentProxy::new(Address::new("127.0.0.1", port), QstpClient::default());
        let reply = proxy.relay(b"anything".to_vec(), peer()).await.unwrap();
        assert_eq!(
            Response::from_frame(&reply).unwrap().status,
            StatusCode::ConnectionRefused
        );
    }
}
