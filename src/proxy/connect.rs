//! Explicit forward proxy (`HTTP_PROXY`/`HTTPS_PROXY`).
//!
//! Clients that honour the proxy variables arrive here in one of two forms:
//!
//! 1. `CONNECT api.github.com:443 HTTP/1.1`: the host is checked with
//!    connection-level admission and the admitted-ports list. If allowed,
//!    the proxy answers `200` and splices bytes to the upstream. Hosts that
//!    need path visibility are terminated instead (see [`super::intercept`]).
//! 2. `GET http://pypi.org/simple/ HTTP/1.1`: the full URL is decided and
//!    the request is forwarded upstream in origin form.
//!
//! Denials are answered with `403 Forbidden`.

use super::error::ProxyError;
use super::intercept::terminate;
use super::server::ProxyContext;
use crate::telemetry::Listener;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Response body type shared by every listener.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only concern the hop between client and proxy.
const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "te",
    "trailer",
];

/// Dispatch a request received on the forward listener.
pub async fn handle_forward(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, ctx, source).await
    } else {
        handle_absolute(req, ctx, source).await
    }
}

/// Handle `CONNECT host:port`.
async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("Missing authority in CONNECT request".into()))?
        .to_string();
    let (host, port) = parse_host_port(&target)?;

    debug!("CONNECT {}:{} from {}", host, port, source);

    if ctx.terminates(&host, port) {
        // Decisions are made per request once the tunnel is up.
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let io = TokioIo::new(upgraded);
                    if let Err(e) = terminate(io, &host, port, source, Listener::Forward, ctx).await
                    {
                        debug!("Terminated tunnel to {}:{} ended: {}", host, port, e);
                    }
                }
                Err(e) => warn!("HTTP upgrade failed for {}:{}: {}", host, port, e),
            }
        });
        return Ok(empty_response(StatusCode::OK));
    }

    let verdict = ctx
        .admission
        .admit_connection(source, Listener::Forward, &host, port);
    if !verdict.is_allowed() {
        return Ok(forbidden_response(&format!(
            "Connection to {}:{} blocked: {}",
            host, port, verdict.reason
        )));
    }

    // Fail fast: connect before telling the client the tunnel is up.
    let upstream = connect_upstream(&host, port).await?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                let mut upstream = upstream;
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((up, down)) => {
                        debug!("Tunnel {}:{} closed ({} up, {} down)", host, port, up, down)
                    }
                    Err(e) => debug!("Tunnel {}:{} ended: {}", host, port, e),
                }
            }
            Err(e) => warn!("HTTP upgrade failed for {}:{}: {}", host, port, e),
        }
    });

    Ok(empty_response(StatusCode::OK))
}

/// Handle an absolute-form request such as `GET http://host/path`.
async fn handle_absolute(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
    source: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    let uri = req.uri();
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("Not an absolute URI: {}", uri)))?
        .to_string();
    if uri.scheme_str() != Some("http") {
        return Err(ProxyError::InvalidRequest(format!(
            "Unsupported scheme in {}; use CONNECT for https",
            uri
        )));
    }
    let port = uri.port_u16().unwrap_or(80);
    let url = uri.to_string();

    let verdict = ctx
        .admission
        .admit_request(source, Listener::Forward, &host, port, &url);
    if !verdict.is_allowed() {
        return Ok(forbidden_response(&format!(
            "Request to {} blocked: {}",
            url, verdict.reason
        )));
    }

    let upstream = connect_upstream(&host, port).await?;
    let req = to_origin_form(req, &host, port, 80)?;
    let response = send_upstream(upstream, req).await?;
    Ok(response.map(|body| body.boxed()))
}

/// Open a TCP connection to the upstream by name.
///
/// Names are resolved by the proxy itself, so the address a client asked
/// for at the IP level never matters.
pub(super) async fn connect_upstream(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })
}

/// Send one request over a fresh HTTP/1.1 connection on `io`.
pub(super) async fn send_upstream<S>(
    io: S,
    req: Request<Incoming>,
) -> Result<Response<Incoming>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });
    Ok(sender.send_request(req).await?)
}

/// Rewrite a request for the upstream: origin-form URI, proxy headers
/// stripped, `Host` present.
pub(super) fn to_origin_form(
    req: Request<Incoming>,
    host: &str,
    port: u16,
    default_port: u16,
) -> Result<Request<Incoming>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("Bad request path {}: {}", path, e)))?;

    for name in HOP_BY_HOP {
        parts.headers.remove(*name);
    }
    if !parts.headers.contains_key(header::HOST) {
        let authority = if port == default_port {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };
        let value = HeaderValue::from_str(&authority)
            .map_err(|_| ProxyError::InvalidRequest(format!("Bad host {}", authority)))?;
        parts.headers.insert(header::HOST, value);
    }

    Ok(Request::from_parts(parts, body))
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
pub(super) fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    let invalid_port =
        |port: &str| ProxyError::InvalidRequest(format!("Invalid port: {}", port));

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if let Some(ipv6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            let port = port_str.parse::<u16>().map_err(|_| invalid_port(port_str))?;
            return Ok((ipv6.to_string(), port));
        }
        let port = port_str.parse::<u16>().map_err(|_| invalid_port(port_str))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

/// Turn a handler error into a response so the client sees why.
pub(super) fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let status = match err {
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    text_response(status, &err.to_string())
}

/// Create an empty response body.
fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// Create a 403 Forbidden response.
pub(super) fn forbidden_response(message: &str) -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("api.example.com:443").unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(
            parse_host_port("api.example.com:8443").unwrap(),
            ("api.example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_host_port("api.example.com").unwrap(),
            ("api.example.com".to_string(), 443)
        );
        assert_eq!(parse_host_port("[::1]:443").unwrap(), ("::1".to_string(), 443));
        assert!(parse_host_port("api.example.com:invalid").is_err());
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response("blocked");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[test]
    fn test_error_response_status() {
        let bad = error_response(&ProxyError::InvalidRequest("no host".into()));
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let gateway = error_response(&ProxyError::UpstreamConnect {
            addr: "pypi.org:80".into(),
            message: "refused".into(),
        });
        assert_eq!(gateway.status(), StatusCode::BAD_GATEWAY);
    }
}
