//! QSTP dispatch on top of the connection server
//!
//! [`Dispatcher`] parses each decrypted payload as a [`Request`] and hands it
//! to the catch-all [`Handler`] when one is set, otherwise to the [`Router`].
//! Every outcome becomes a response frame:
//!
//! | outcome | status |
//! |---|---|
//! | frame does not parse | 201 / 202 / 203 |
//! | no route matches | 204, echoing `request-method` and `request-path` |
//! | handler returns `Err` or panics | 101 |

use crate::address::Address;
use crate::config::ServerConfig;
use crate::crypto::KemAlgorithm;
use crate::protocol::{Method, Request, Response, StatusCode};
use crate::router::{PathParams, Router};
use crate::server::{FrameHandler, SecureServer, ServerCloser};
use crate::QstpError;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info};
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Catch-all request handler; takes precedence over any routes.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Request) -> anyhow::Result<Response>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> anyhow::Result<Response> {
        (self)(request).await
    }
}

/// Turns request frames into response frames.
#[derive(Default)]
pub struct Dispatcher {
    handler: Option<Arc<dyn Handler>>,
    router: Router,
}

impl Dispatcher {
    pub fn new(router: Router) -> Self {
        Self {
            handler: None,
            router,
        }
    }

    pub fn with_handler<H: Handler + 'static>(handler: H) -> Self {
        Self {
            handler: Some(Arc::new(handler)),
            router: Router::new(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Answer one parsed request. Never fails.
    pub async fn dispatch(&self, request: Request) -> Response {
        let method = request.method;
        let path = request.path().to_string();
        info!("{} {} from {}", method, path, request.address);

        let outcome = match &self.handler {
            Some(handler) => AssertUnwindSafe(handler.handle(request)).catch_unwind().await,
            None => match self.router.match_route(&path, method) {
                Some(found) => {
                    debug!("{} {} matched {}", method, path, found.pattern);
                    AssertUnwindSafe(found.handler.call(request, found.params))
                        .catch_unwind()
                        .await
                }
                None => return unknown_path(method, &path),
            },
        };

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!("Handler for {} {} failed: {:#}", method, path, e);
                Response::new(StatusCode::ServerError)
            }
            Err(_) => {
                error!("Handler for {} {} panicked", method, path);
                Response::new(StatusCode::ServerError)
            }
        }
    }
}

fn unknown_path(method: Method, path: &str) -> Response {
    debug!("No route for {} {}", method, path);
    let mut response = Response::new(StatusCode::UnknownPath);
    for (key, value) in [("request-method", method.as_str()), ("request-path", path)] {
        if let Err(e) = response.headers.insert(key, value) {
            debug!("Not echoing {}: {}", key, e);
        }
    }
    response
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn handle(&self, payload: Vec<u8>, peer: SocketAddr) -> anyhow::Result<Vec<u8>> {
        let response = match Request::from_frame(&payload, Address::from(peer)) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                debug!("Rejecting frame from {}: {}", peer, e);
                e.into_response()
            }
        };
        Ok(response.to_frame())
    }
}

/// Builder for [`QstpServer`]
pub struct QstpServerBuilder {
    config: ServerConfig,
    kem: KemAlgorithm,
    router: Router,
    handler: Option<Arc<dyn Handler>>,
}

impl QstpServerBuilder {
    pub fn kem(mut self, kem: KemAlgorithm) -> Self {
        self.kem = kem;
        self
    }

    /// Replace the route registry.
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn route<F, Fut>(mut self, pattern: &str, methods: &[Method], handler: F) -> Self
    where
        F: Fn(Request, PathParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        self.router.route(pattern, methods, handler);
        self
    }

    /// Set the catch-all handler; routes are then ignored.
    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub async fn bind(self) -> Result<QstpServer, QstpError> {
        let inner = SecureServer::bind(self.config, self.kem).await?;
        let dispatcher = Dispatcher {
            handler: self.handler,
            router: self.router,
        };
        Ok(QstpServer {
            inner,
            dispatcher: Arc::new(dispatcher),
        })
    }
}

/// Connection server speaking QSTP requests and responses
pub struct QstpServer {
    inner: SecureServer,
    dispatcher: Arc<Dispatcher>,
}

impl QstpServer {
    pub fn builder(config: ServerConfig) -> QstpServerBuilder {
        QstpServerBuilder {
            config,
            kem: KemAlgorithm::default(),
            router: Router::new(),
            handler: None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, QstpError> {
        self.inner.local_addr()
    }

    pub fn closer(&self) -> ServerCloser {
        self.inner.closer()
    }

    pub async fn serve(self) -> Result<(), QstpError> {
        self.inner.serve(self.dispatcher).await
    }

    pub async fn serve_until<F>(self, signal: F) -> Result<(), QstpError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.serve_until(self.dispatcher, signal).await
    }
}
