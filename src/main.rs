//! qstp - QSTP client, echo server and proxies

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use qstp::{
    Address, Headers, KemAlgorithm, Method, QstpClient, QstpConfig, QstpServer, Request, Response,
    ReverseProxy, RouteTable, SecureServer, StatusCode, TransparentProxy,
};

#[derive(Parser)]
#[command(name = "qstp")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_DATE"), ")"))]
#[command(about = "Request/response protocol over a post-quantum secured transport", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "QSTP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// KEM algorithm (ML-KEM-512, ML-KEM-768, ML-KEM-1024)
    #[arg(short, long)]
    kem: Option<KemAlgorithm>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request and print the response
    Request {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        address: Address,

        /// Request method (GET, POST, DELETE, PATCH)
        #[arg(short, long, default_value = "GET")]
        method: Method,

        /// Request path
        #[arg(default_value = "/")]
        path: String,

        /// Header as `key: value`, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Run a minimal echo server
    Echo {
        /// Listen address (overrides `server.listen`)
        #[arg(short, long)]
        listen: Option<Address>,
    },

    /// Run a transparent proxy to a fixed upstream
    Proxy {
        /// Listen address (overrides `server.listen`)
        #[arg(short, long)]
        listen: Option<Address>,

        /// Upstream address (overrides `proxy.upstream`)
        #[arg(short, long)]
        upstream: Option<Address>,
    },

    /// Run a Host-routed reverse proxy
    ReverseProxy {
        /// Listen address (overrides `server.listen`)
        #[arg(short, long)]
        listen: Option<Address>,

        /// Route as `host=upstream`, repeatable
        #[arg(short, long = "route")]
        routes: Vec<String>,

        /// Upstream for unknown hosts
        #[arg(short, long)]
        fallback: Option<Address>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => QstpConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => QstpConfig::default(),
    };
    if let Some(kem) = cli.kem {
        config.kem = kem;
    }

    // Initialize logger
    if cli.verbose || config.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Request {
            address,
            method,
            path,
            headers,
            data,
        } => {
            send_request(&config, address, method, path, &headers, data).await?;
        }
        Commands::Echo { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            run_echo(config).await?;
        }
        Commands::Proxy { listen, upstream } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(upstream) = upstream {
                config.proxy = Some(qstp::ProxyConfig { upstream });
            }
            run_proxy(config).await?;
        }
        Commands::ReverseProxy {
            listen,
            routes,
            fallback,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            let mut table = config
                .reverse_proxy
                .take()
                .map(|reverse| reverse.routes)
                .unwrap_or_default();
            for route in &routes {
                let (host, location) = route
                    .split_once('=')
                    .with_context(|| format!("Route {:?} is not host=upstream", route))?;
                table = table.with_route(host.trim(), location.trim().parse::<Address>()?);
            }
            if let Some(fallback) = fallback {
                table = table.with_fallback(fallback);
            }
            config.reverse_proxy = Some(qstp::ReverseProxyConfig { routes: table });
            run_reverse_proxy(config).await?;
        }
    }

    Ok(())
}

async fn send_request(
    config: &QstpConfig,
    address: Address,
    method: Method,
    path: String,
    raw_headers: &[String],
    data: Option<String>,
) -> Result<()> {
    let mut headers = Headers::new();
    for raw in raw_headers {
        let (key, value) = raw
            .split_once(':')
            .with_context(|| format!("Header {:?} is not key: value", raw))?;
        headers.insert(key.trim(), value.trim())?;
    }

    let mut request = Request::new(address, method, path)?;
    request.headers = headers;
    if let Some(data) = data {
        request = request.with_data(data);
    }

    info!("Sending {} to {}", request, request.address);
    let response = QstpClient::new(config.kem)
        .request(&request)
        .await
        .context("Request failed")?;

    println!("{}", response.status);
    for (key, value) in response.headers.iter() {
        println!("{}: {}", key, value);
    }
    if !response.data.is_empty() {
        println!();
        println!("{}", String::from_utf8_lossy(&response.data));
    }
    Ok(())
}

async fn run_echo(config: QstpConfig) -> Result<()> {
    config.validate()?;

    let server = QstpServer::builder(config.server)
        .kem(config.kem)
        .route("/", &[Method::Get], |_req, _params| async move {
            Ok(Response::new(StatusCode::Ok).with_data("QSTP echo server"))
        })
        .route("/echo", &Method::ALL, |req, _params| async move {
            Ok(Response::new(StatusCode::Ok).with_data(req.data))
        })
        .route("/echo/<value>", &[Method::Get], |_req, params| async move {
            let value = params.get("value").cloned().unwrap_or_default();
            Ok(Response::new(StatusCode::Ok).with_data(value))
        })
        .bind()
        .await
        .context("Failed to bind echo server")?;

    info!("Echo server ready on {}", server.local_addr()?);
    server.serve_until(shutdown_signal()).await?;
    Ok(())
}

async fn run_proxy(config: QstpConfig) -> Result<()> {
    config.validate()?;
    let Some(proxy_config) = config.proxy else {
        bail!("Proxy mode needs an upstream (--upstream or [proxy] upstream)");
    };

    let proxy = TransparentProxy::new(proxy_config.upstream, QstpClient::new(config.kem))
        .on_client_data(qstp::proxy::request_hook(|req| {
            log::debug!("client -> upstream: {}", req);
            req
        }))
        .on_server_data(qstp::proxy::response_hook(|resp| {
            log::debug!("upstream -> client: {}", resp);
            resp
        }));
    info!("Relaying to {}", proxy.upstream());

    let server = SecureServer::bind(config.server, config.kem)
        .await
        .context("Failed to bind proxy")?;
    server
        .serve_until(Arc::new(proxy), shutdown_signal())
        .await?;
    Ok(())
}

async fn run_reverse_proxy(config: QstpConfig) -> Result<()> {
    config.validate()?;
    let routes: RouteTable = config
        .reverse_proxy
        .map(|reverse| reverse.routes)
        .unwrap_or_default();
    info!("Reverse proxy with {} routes", routes.len());

    let proxy = ReverseProxy::new(routes, QstpClient::new(config.kem));
    let server = QstpServer::builder(config.server)
        .kem(config.kem)
        .handler(proxy)
        .bind()
        .await
        .context("Failed to bind reverse proxy")?;

    server.serve_until(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
