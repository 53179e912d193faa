//! L7 filtering proxy.
//!
//! The only way out of the isolated network. It runs in its own container
//! at the proxy address and enforces the admission rules synthesized from
//! the policy:
//!
//! - explicit forward proxy with `CONNECT` and absolute-form HTTP
//! - intercepted plain HTTP, decided on the `Host` header and path
//! - intercepted TLS, decided on the SNI peeked from the ClientHello, and
//!   terminated with session CA certificates only for hosts whose URL
//!   patterns need path visibility
//! - one access record per decision
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── isolated network ─────────────────────────┐
//! │                                                                       │
//! │  ┌──────────────────┐  HTTP_PROXY        ┌───────────────────────┐    │
//! │  │  execution env   │───────────────────▶│ :3128 forward         │    │
//! │  │  (.20)           │  DNAT tcp/80       │ :3129 http            │────┼──▶ upstream
//! │  │                  │───────────────────▶│ :3130 tls (SNI)       │    │
//! │  │                  │  DNAT tcp/443      │        proxy (.10)    │    │
//! │  └──────────────────┘───────────────────▶└───────────────────────┘    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use egress_warden::proxy::{ProxyListeners, ProxyServer};
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::from_workspace(workspace, shutdown_rx)?;
//! let listeners = ProxyListeners::bind(server.bind_addr(), server.listen_ports()).await?;
//! server.run(listeners).await?;
//! ```

pub mod admission;
pub mod connect;
pub mod error;
pub mod intercept;
pub mod server;
pub mod sni;
pub mod tls;

pub use admission::Admission;
pub use error::{ProxyError, ProxyResult};
pub use server::{ProxyContext, ProxyListeners, ProxyServer};
pub use sni::{ClientHelloSni, parse_client_hello};
pub use tls::{CertificateCache, create_tls_acceptor, create_tls_connector};
