//! Proxy server: three listeners, one task per connection.
//!
//! | Listener | Default port | Traffic |
//! |----------|--------------|---------|
//! | forward  | 3128 | clients using `HTTP_PROXY`/`HTTPS_PROXY` |
//! | http     | 3129 | port 80 redirected by the execution environment |
//! | tls      | 3130 | port 443 redirected by the execution environment |
//!
//! The server runs as `egress-warden internal-proxy` inside the proxy
//! container, with the run's workspace mounted. It reads the admission
//! rules from `proxy-rules.json`, the session CA from `ca/` when path
//! visibility is on, and appends access records to `logs/access.jsonl`.
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::{ProxyListeners, ProxyServer};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::from_workspace(&workspace, shutdown_rx)?;
//! let listeners = ProxyListeners::bind(server.bind_addr(), server.listen_ports()).await?;
//! server.run(listeners).await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::admission::Admission;
use super::connect::{error_response, handle_forward};
use super::error::ProxyError;
use super::intercept::{handle_http, handle_tls};
use super::tls::{CertificateCache, create_tls_connector};
use crate::enforce::proxy_rules::ListenPorts;
use crate::enforce::{PROXY_RULES_FILE, load_proxy_rules};
use crate::sandbox::SessionCa;
use crate::sandbox::workspace::{CA_DIR, LOGS_DIR};
use crate::telemetry::{ACCESS_LOG_FILE, AccessLog};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// State shared by every connection task.
pub struct ProxyContext {
    pub(crate) admission: Admission,
    pub(crate) certs: Option<Arc<CertificateCache>>,
    connector: Option<TlsConnector>,
}

impl ProxyContext {
    /// Build the context.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoCa`] if the rules ask for path visibility but no CA
    /// was given.
    pub fn new(admission: Admission, ca: Option<Arc<SessionCa>>) -> Result<Self, ProxyError> {
        if admission.rules().path_visibility && ca.is_none() {
            return Err(ProxyError::NoCa("URL-pattern hosts".to_string()));
        }

        let connector = match ca {
            Some(_) => match create_tls_connector() {
                Ok(connector) => Some(connector),
                Err(e) => {
                    warn!("{}; terminated connections cannot reach upstreams", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            certs: ca.map(|ca| Arc::new(CertificateCache::new(ca))),
            admission,
            connector,
        })
    }

    /// Whether connections to `host:port` are terminated for per-request
    /// decisions.
    pub(crate) fn terminates(&self, host: &str, port: u16) -> bool {
        self.certs.is_some() && self.admission.intercepts(host, port)
    }

    pub(crate) fn connector(&self) -> Result<TlsConnector, ProxyError> {
        self.connector
            .clone()
            .ok_or_else(|| ProxyError::Tls("No upstream trust roots loaded".into()))
    }
}

/// The three bound listeners.
pub struct ProxyListeners {
    forward: TcpListener,
    http: TcpListener,
    tls: TcpListener,
}

impl ProxyListeners {
    /// Bind all three listeners on `ip`.
    pub async fn bind(ip: IpAddr, ports: ListenPorts) -> Result<Self, ProxyError> {
        Ok(Self {
            forward: TcpListener::bind((ip, ports.forward)).await?,
            http: TcpListener::bind((ip, ports.http)).await?,
            tls: TcpListener::bind((ip, ports.tls)).await?,
        })
    }

    /// Actual addresses, useful when binding port 0.
    pub fn local_addrs(&self) -> Result<[SocketAddr; 3], ProxyError> {
        Ok([
            self.forward.local_addr()?,
            self.http.local_addr()?,
            self.tls.local_addr()?,
        ])
    }
}

/// The main proxy server.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Create a new proxy server.
    pub fn new(context: ProxyContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            context: Arc::new(context),
            shutdown_rx,
        }
    }

    /// Load rules, CA and access log from a run's workspace.
    pub fn from_workspace(
        workspace: &Path,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ProxyError> {
        let rules = load_proxy_rules(&workspace.join(PROXY_RULES_FILE))?;
        let log = AccessLog::open(&workspace.join(LOGS_DIR).join(ACCESS_LOG_FILE))?;

        let ca = if rules.path_visibility {
            Some(Arc::new(SessionCa::load(&workspace.join(CA_DIR))?))
        } else {
            None
        };

        info!(
            "Loaded admission rules: {} block, {} allow, {} URL patterns",
            rules.block.len(),
            rules.allow.len(),
            rules.url_patterns.len()
        );

        let admission = Admission::new(rules, log)?;
        Ok(Self::new(ProxyContext::new(admission, ca)?, shutdown_rx))
    }

    /// Ports from the admission rules.
    pub fn listen_ports(&self) -> ListenPorts {
        self.context.admission.rules().listen
    }

    /// The proxy listens on every interface of its container.
    pub fn bind_addr(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(self, listeners: ProxyListeners) -> Result<(), ProxyError> {
        let [forward, http, tls] = listeners.local_addrs()?;
        info!(
            "Proxy listening: forward {}, http {}, tls {}",
            forward, http, tls
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accepted = listeners.forward.accept() => {
                    self.spawn(accepted, serve_forward);
                }
                accepted = listeners.http.accept() => {
                    self.spawn(accepted, serve_http);
                }
                accepted = listeners.tls.accept() => {
                    self.spawn(accepted, handle_tls);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn<F, Fut>(&self, accepted: std::io::Result<(TcpStream, SocketAddr)>, handler: F)
    where
        F: FnOnce(TcpStream, Arc<ProxyContext>, SocketAddr) -> Fut,
        Fut: Future<Output = Result<(), ProxyError>> + Send + 'static,
    {
        let (stream, source) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                return;
            }
        };
        debug!("Accepted connection from {}", source);

        let task = handler(stream, self.context.clone(), source);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_disconnect() {
                    debug!("Connection from {} ended: {}", source, e);
                } else {
                    warn!("Connection from {} failed: {}", source, e);
                }
            }
        });
    }
}

/// Serve HTTP/1.1 on the forward listener, with upgrades for CONNECT.
async fn serve_forward(
    stream: TcpStream,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<(), ProxyError> {
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move {
            let response = match handle_forward(req, ctx, source).await {
                Ok(response) => response,
                Err(e) => error_response(&e),
            };
            Ok::<_, Infallible>(response)
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;
    Ok(())
}

/// Serve HTTP/1.1 on the intercepted-HTTP listener.
async fn serve_http(
    stream: TcpStream,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<(), ProxyError> {
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move {
            let response = match handle_http(req, ctx, source).await {
                Ok(response) => response,
                Err(e) => error_response(&e),
            };
            Ok::<_, Infallible>(response)
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .await?;
    Ok(())
}
