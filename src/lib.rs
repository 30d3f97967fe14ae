//! QSTP: a request/response protocol over a post-quantum secured transport
//!
//! Every TCP connection runs one ML-KEM handshake, then carries exactly one
//! AES-256-CBC encrypted, length-prefixed request and one response. On top of
//! that transport the crate provides an HTTP-like frame protocol, a path
//! router, a concurrent connection server, a single-shot client, and two
//! proxies (an opaque byte relay and a `Host`-routed reverse proxy).
//!
//! ## Quick Start
//!
//! ### Serving
//!
//! ```rust,no_run
//! use qstp::{Method, QstpServer, Response, Router, ServerConfig, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.route("/users/<user>", &[Method::Get], |_req, params| async move {
//!         let user = params.get("user").cloned().unwrap_or_default();
//!         Ok(Response::new(StatusCode::Ok).with_data(user))
//!     });
//!
//!     let server = QstpServer::builder(ServerConfig::default())
//!         .router(router)
//!         .bind()
//!         .await?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Requesting
//!
//! ```rust,no_run
//! use qstp::{Address, Method, QstpClient, Request};
//!
//! # async fn example() -> Result<(), qstp::QstpError> {
//! let client = QstpClient::default();
//! let request = Request::new("127.0.0.1:8080".parse::<Address>()?, Method::Get, "/users/bwp09")?;
//! let response = client.request(&request).await?;
//! println!("{}", response);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  handshake + 1 frame  ┌──────────────┐
//! │  Client  │──────────────────────▶│ SecureServer │── FrameHandler
//! └──────────┘                       └──────────────┘        │
//!                                       ┌────────────────────┼──────────────────┐
//!                                       ▼                    ▼                  ▼
//!                                 ┌────────────┐    ┌──────────────────┐ ┌──────────────┐
//!                                 │ Dispatcher │    │ TransparentProxy │ │ ReverseProxy │
//!                                 │  (Router)  │    └──────────────────┘ │  (Handler)   │
//!                                 └────────────┘                         └──────────────┘
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod framing;
pub mod protocol;
pub mod proxy;
pub mod reverse_proxy;
pub mod router;
pub mod server;
pub mod session;

// Re-export core types
pub use address::Address;
pub use client::{Forwarder, QstpClient};
pub use config::{ProxyConfig, QstpConfig, ReverseProxyConfig, ServerConfig};
pub use crypto::{KemAlgorithm, KemProvider, SessionKey};
pub use dispatch::{Dispatcher, Handler, QstpServer, QstpServerBuilder};
pub use protocol::{Headers, Method, ParseError, Request, Response, StatusCode};
pub use proxy::{ByteHook, TransparentProxy};
pub use reverse_proxy::{ReverseProxy, RouteTable, RouteTarget};
pub use router::{PathParams, RouteHandler, Router};
pub use server::{ConnectionState, FrameHandler, SecureServer, ServerCloser};
pub use session::SecureSession;

/// Errors
#[derive(Debug, thiserror::Error)]
pub enum QstpError {
    #[error("Invalid method: {0:?}")]
    InvalidMethod(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Connection closed while reading {0}")]
    ConnectionClosed(&'static str),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid response frame: {0}")]
    InvalidResponse(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QstpError {
    /// Whether this error aborts a single connection (socket failure,
    /// truncated stream, failed handshake) rather than describing bad input.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QstpError::ConnectionRefused(_)
                | QstpError::ConnectionClosed(_)
                | QstpError::FrameTooLarge { .. }
                | QstpError::Handshake(_)
                | QstpError::Crypto(_)
                | QstpError::Timeout(_)
                | QstpError::Io(_)
        )
    }
}
