//! Redirected (transparent) traffic.
//!
//! The execution environment's NAT rules send every TCP connection on port
//! 80 to the HTTP listener and every connection on port 443 to the TLS
//! listener, whether or not the client knows about the proxy.
//!
//! - Plain HTTP is decided on the `Host` header and the request path.
//! - TLS is decided on the ClientHello SNI, peeked without consuming it.
//!   Admitted connections are spliced to `host:443` untouched, unless the
//!   host needs path visibility: then the proxy terminates TLS with a
//!   session CA leaf certificate and decides every request on its URL.
//!
//! Denied HTTP requests get `403`; denied TLS connections are closed.

use super::connect::{
    ProxyBody, connect_upstream, error_response, forbidden_response, send_upstream,
    to_origin_form,
};
use super::error::ProxyError;
use super::server::ProxyContext;
use super::sni::{ClientHelloSni, peek_sni};
use super::tls::{create_tls_acceptor, domain_to_server_name};
use crate::telemetry::Listener;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// How long a client may take to send its ClientHello.
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Handle one request on the intercepted-HTTP listener.
pub async fn handle_http(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    let host = request_host(&req)?;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{}{}", host, path);

    let verdict = ctx
        .admission
        .admit_request(source, Listener::Http, &host, HTTP_PORT, &url);
    if !verdict.is_allowed() {
        return Ok(forbidden_response(&format!(
            "Request to {} blocked: {}",
            url, verdict.reason
        )));
    }

    let upstream = connect_upstream(&host, HTTP_PORT).await?;
    let req = to_origin_form(req, &host, HTTP_PORT, HTTP_PORT)?;
    let response = send_upstream(upstream, req).await?;
    Ok(response.map(|body| body.boxed()))
}

/// Host named by the `Host` header, without a port.
fn request_host(req: &Request<Incoming>) -> Result<String, ProxyError> {
    let value = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .ok_or_else(|| ProxyError::InvalidRequest("Missing Host header".into()))?;
    let host = match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => value,
    };
    if host.is_empty() {
        return Err(ProxyError::InvalidRequest("Empty Host header".into()));
    }
    Ok(host.to_ascii_lowercase())
}

/// Handle one connection on the intercepted-TLS listener.
pub async fn handle_tls(
    stream: TcpStream,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<(), ProxyError> {
    let host = match peek_sni(&stream, CLIENT_HELLO_TIMEOUT).await? {
        ClientHelloSni::Found(host) => host,
        other => {
            debug!("No server name from {} ({:?})", source, other);
            ctx.admission.deny_unnamed(source);
            return Ok(());
        }
    };

    if ctx.terminates(&host, HTTPS_PORT) {
        return terminate(stream, &host, HTTPS_PORT, source, Listener::Tls, ctx).await;
    }

    let verdict = ctx
        .admission
        .admit_connection(source, Listener::Tls, &host, HTTPS_PORT);
    if !verdict.is_allowed() {
        // Dropping the stream closes the connection mid-handshake.
        return Ok(());
    }

    let mut client = stream;
    let mut upstream = connect_upstream(&host, HTTPS_PORT).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("Splice to {} closed ({} up, {} down)", host, up, down);
    Ok(())
}

/// Terminate TLS for `host` and decide each request on its URL.
///
/// Allowed requests are forwarded over a verified TLS connection to
/// `host:port`. The `Host` header is not trusted for routing: the upstream
/// is always the name the connection was opened for.
pub(super) async fn terminate<IO>(
    io: IO,
    host: &str,
    port: u16,
    source: SocketAddr,
    listener: Listener,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let certs = ctx
        .certs
        .clone()
        .ok_or_else(|| ProxyError::NoCa(host.to_string()))?;
    let acceptor = create_tls_acceptor(certs, Some(host.to_string()))?;
    let client_tls = acceptor
        .accept(io)
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    debug!("Terminated TLS for {}:{} from {}", host, port, source);

    let host = host.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let host = host.clone();
        async move {
            let response = match forward_terminated(req, &host, port, source, listener, ctx).await
            {
                Ok(response) => response,
                Err(e) => {
                    debug!("Request to {} failed: {}", host, e);
                    error_response(&e)
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(client_tls), service)
        .await?;
    Ok(())
}

async fn forward_terminated(
    req: Request<Incoming>,
    host: &str,
    port: u16,
    source: SocketAddr,
    listener: Listener,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = if port == HTTPS_PORT {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, port, path)
    };

    let verdict = ctx
        .admission
        .admit_request(source, listener, host, port, &url);
    if !verdict.is_allowed() {
        return Ok(forbidden_response(&format!(
            "Request to {} blocked: {}",
            url, verdict.reason
        )));
    }

    let connector = ctx.connector()?;
    let upstream = connect_upstream(host, port).await?;
    let upstream_tls = connector
        .connect(domain_to_server_name(host)?, upstream)
        .await
        .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;

    let req = to_origin_form(req, host, port, HTTPS_PORT)?;
    let response = send_upstream(upstream_tls, req).await?;
    Ok(response.map(|body| body.boxed()))
}
