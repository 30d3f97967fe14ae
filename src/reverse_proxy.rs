//! `Host`-routed reverse proxy
//!
//! The proxy is a catch-all [`Handler`] for a [`QstpServer`](crate::QstpServer).
//! For every request it:
//!
//! 1. answers `301 INCOMPLETE` when there is no `Host` header,
//! 2. records the downstream peer in `Proxied-For`,
//! 3. picks the upstream for `Host`, else the `FALLBACK` entry, else answers
//!    `302 UNKNOWN HOST`,
//! 4. forwards the request and, if the upstream refused the connection,
//!    retries once against `FALLBACK`.

use crate::address::Address;
use crate::client::{Forwarder, QstpClient};
use crate::dispatch::Handler;
use crate::protocol::{Request, Response, StatusCode};
use crate::QstpError;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Route table key of the default upstream
pub const FALLBACK_KEY: &str = "FALLBACK";

/// Header naming the downstream peer of a proxied request
pub const PROXIED_FOR_HEADER: &str = "Proxied-For";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub location: Address,
}

/// Host name to upstream mapping with an optional `FALLBACK` entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: HashMap<String, RouteTarget>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, host: impl Into<String>, location: Address) -> Self {
        self.routes.insert(host.into(), RouteTarget { location });
        self
    }

    pub fn with_fallback(self, location: Address) -> Self {
        self.with_route(FALLBACK_KEY, location)
    }

    pub fn get(&self, host: &str) -> Option<&Address> {
        self.routes.get(host).map(|target| &target.location)
    }

    pub fn fallback(&self) -> Option<&Address> {
        self.get(FALLBACK_KEY)
    }

    /// Upstream for `host`, falling back to `FALLBACK`. The flag is `true`
    /// when the fallback was chosen.
    pub fn resolve(&self, host: &str) -> Option<(&Address, bool)> {
        match self.get(host) {
            Some(location) => Some((location, false)),
            None => self.fallback().map(|location| (location, true)),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Reverse proxy over any [`Forwarder`]; [`QstpClient`] by default.
pub struct ReverseProxy<F = QstpClient> {
    routes: RouteTable,
    forwarder: F,
}

impl ReverseProxy<QstpClient> {
    pub fn new(routes: RouteTable, client: QstpClient) -> Self {
        Self::with_forwarder(routes, client)
    }
}

impl<F: Forwarder> ReverseProxy<F> {
    pub fn with_forwarder(routes: RouteTable, forwarder: F) -> Self {
        Self { routes, forwarder }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    /// Route one downstream request. Transport failures other than a
    /// refused connect are returned as errors.
    pub async fn proxy(&self, mut request: Request) -> Result<Response, QstpError> {
        let Some(host) = request.headers.get("Host").map(str::to_string) else {
            debug!("No Host header from {}", request.address);
            return Ok(Response::new(StatusCode::Incomplete));
        };

        let peer = request.address.to_string();
        request.headers.insert(PROXIED_FOR_HEADER, peer)?;

        let Some((upstream, via_fallback)) = self.routes.resolve(&host) else {
            debug!("Host {:?} not routed and no {} defined", host, FALLBACK_KEY);
            return Ok(Response::new(StatusCode::UnknownHost));
        };

        if via_fallback {
            debug!("Host {:?} not routed, using {} {}", host, FALLBACK_KEY, upstream);
        } else {
            debug!("Host {:?} routed to {}", host, upstream);
        }

        request.address = upstream.clone();
        let response = self.forwarder.forward(&request).await?;

        if response.status != StatusCode::ConnectionRefused {
            return Ok(response);
        }

        match self.routes.fallback() {
            Some(fallback) if fallback != upstream => {
                info!("{} refused connection, retrying via {} {}", upstream, FALLBACK_KEY, fallback);
                request.address = fallback.clone();
                self.forwarder.forward(&request).await
            }
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl<F: Forwarder + 'static> Handler for ReverseProxy<F> {
    async fn handle(&self, request: Request) -> anyhow::Result<Response> {
        let response = self.proxy(request).await?;
        debug!("Upstream answered {}", response.status);
        Ok(response)
    }
}
