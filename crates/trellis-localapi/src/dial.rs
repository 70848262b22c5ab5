//! Connection hijack for tunneled TCP dial-through
//!
//! `/dial` escapes the request/response model: after validating the
//! upgrade, the handler dials the target through the backend, answers
//! `101 Switching Protocols`, and from then on the HTTP connection is a
//! raw byte pipe bridged to the dialed TCP connection. Failures before
//! the 101 are ordinary HTTP errors; afterwards there is no response
//! channel left, so they are only logged.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{CONNECTION, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use trellis_backend::LocalBackend;

use crate::handler::DIAL_UPGRADE_PROTO;
use crate::response::{empty_body, ApiBody, ApiError};

pub(crate) async fn serve_dial<B>(
    backend: Arc<dyn LocalBackend>,
    req: Request<B>,
) -> Result<Response<ApiBody>, ApiError>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() != Method::POST {
        return Err(ApiError::MethodNotAllowed("POST required".to_string()));
    }
    let wants_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let proto_ok = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == DIAL_UPGRADE_PROTO)
        .unwrap_or(false);
    if !wants_upgrade || !proto_ok {
        return Err(ApiError::bad_request(format!(
            "bad {DIAL_UPGRADE_PROTO} upgrade"
        )));
    }

    let host = header_str(&req, "Dial-Host");
    let port = header_str(&req, "Dial-Port");
    let (host, port) = match (host, port) {
        (Some(h), Some(p)) if !h.is_empty() && !p.is_empty() => (h, p),
        _ => {
            return Err(ApiError::bad_request(
                "missing Dial-Host or Dial-Port header",
            ))
        }
    };
    let port: u16 = port
        .parse()
        .map_err(|_| ApiError::bad_request("invalid Dial-Port header"))?;
    let addr = if host.contains(':') {
        // Bare IPv6 literal.
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };

    // Dial first: a failure here still has a response channel.
    let dialed = backend
        .dialer()
        .user_dial(&addr)
        .await
        .map_err(|e| ApiError::BadGateway(format!("dial failure: {e}")))?;

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("dial upgrade failed: {e}");
                return;
            }
        };
        // The upgraded stream starts with whatever the client pipelined
        // behind its request; hyper preserves those buffered bytes.
        let io = TokioIo::new(upgraded);
        let (mut client_r, mut client_w) = tokio::io::split(io);
        let (mut remote_r, mut remote_w) = tokio::io::split(dialed);
        // First side to finish tears down both: the select drops the
        // other copy and both connections with it.
        tokio::select! {
            r = tokio::io::copy(&mut client_r, &mut remote_w) => {
                match r {
                    Ok(n) => debug!("dial: client closed after {n} bytes"),
                    Err(e) => debug!("dial: client to remote copy ended: {e}"),
                }
            }
            r = tokio::io::copy(&mut remote_r, &mut client_w) => {
                match r {
                    Ok(n) => debug!("dial: remote closed after {n} bytes"),
                    Err(e) => debug!("dial: remote to client copy ended: {e}"),
                }
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, DIAL_UPGRADE_PROTO)
        .header(CONNECTION, "upgrade")
        .body(empty_body())
        .unwrap())
}

fn header_str<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}
