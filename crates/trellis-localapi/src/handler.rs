//! Request routing and handlers
//!
//! One [`Handler`] per connection. Dispatch is a closed match on the
//! request path: three prefix families (`files/`, `file-put/`, `cert/`)
//! and exact matches for everything else, all rooted at `/localapi/v0/`.
//! Every handler checks its minimum capability before touching the
//! backend.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt as _;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use trellis_backend::{LocalBackend, MaskedPrefs, Prefs, TokenRequest, CAP_VERSION};
use trellis_metrics::{Kind, Registry};

use crate::dial;
use crate::permit::Permit;
use crate::response::{backend_error_json, full_body, json, no_content, text, ApiBody, ApiError};

/// Root of every local API path.
pub const LOCALAPI_PREFIX: &str = "/localapi/v0/";

/// Header stamped on every reply.
pub const VERSION_HEADER: &str = "Trellis-Version";

/// Upgrade token for `/dial`.
pub const DIAL_UPGRADE_PROTO: &str = "trellis-dial";

/// Serves the local API for one connection.
pub struct Handler {
    backend: Arc<dyn LocalBackend>,
    metrics: Arc<Registry>,
    permit: Permit,
    /// If set, every request must carry this basic-auth password.
    required_password: Option<String>,
    /// If set (credless transports), a matching basic-auth password is
    /// what grants read+write; the connection has no other identity.
    auth_token: Option<String>,
    log_id: String,
}

impl Handler {
    pub fn new(
        backend: Arc<dyn LocalBackend>,
        metrics: Arc<Registry>,
        permit: Permit,
        log_id: String,
    ) -> Self {
        Self {
            backend,
            metrics,
            permit,
            required_password: None,
            auth_token: None,
            log_id,
        }
    }

    pub fn with_required_password(mut self, password: Option<String>) -> Self {
        self.required_password = password;
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Handle one request. Never fails; every error becomes a response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ApiBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(required) = &self.required_password {
            match basic_auth_password(&req) {
                None => {
                    return with_version(text(StatusCode::UNAUTHORIZED, "auth required"));
                }
                Some(pass) if &pass != required => {
                    return with_version(text(StatusCode::FORBIDDEN, "bad password"));
                }
                Some(_) => {}
            }
        }
        let permit = self.effective_permit(&req);
        let resp = match self.route(req, permit).await {
            Ok(resp) => resp,
            Err(e) => e.into_response(),
        };
        with_version(resp)
    }

    fn effective_permit<B>(&self, req: &Request<B>) -> Permit {
        match &self.auth_token {
            None => self.permit,
            Some(token) => match basic_auth_password(req) {
                Some(pass) if &pass == token => Permit::read_write(),
                _ => Permit::NONE,
            },
        }
    }

    async fn route<B>(&self, req: Request<B>, permit: Permit) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();

        if let Some(rest) = path.strip_prefix("/localapi/v0/files/") {
            return self.serve_files(req, permit, rest.to_string()).await;
        }
        if let Some(rest) = path.strip_prefix("/localapi/v0/file-put/") {
            return self.serve_file_put(req, permit, rest.to_string()).await;
        }
        if let Some(rest) = path.strip_prefix("/localapi/v0/cert/") {
            return self.serve_cert(req, permit, rest.to_string()).await;
        }

        match path.as_str() {
            "/localapi/v0/status" => self.serve_status(req, permit).await,
            "/localapi/v0/prefs" => self.serve_prefs(req, permit).await,
            "/localapi/v0/check-prefs" => self.serve_check_prefs(req, permit).await,
            "/localapi/v0/login-interactive" => self.serve_login_interactive(req, permit).await,
            "/localapi/v0/logout" => self.serve_logout(req, permit).await,
            "/localapi/v0/whois" => self.serve_whois(req, permit).await,
            "/localapi/v0/goroutines" => self.serve_goroutines(req, permit).await,
            "/localapi/v0/profile" => self.serve_profile(req, permit).await,
            "/localapi/v0/metrics" => self.serve_metrics(req, permit).await,
            "/localapi/v0/debug" => self.serve_debug(req, permit).await,
            "/localapi/v0/check-ip-forwarding" => self.serve_check_ip_forwarding(req, permit).await,
            "/localapi/v0/bugreport" => self.serve_bug_report(req, permit).await,
            "/localapi/v0/file-targets" => self.serve_file_targets(req, permit).await,
            "/localapi/v0/set-dns" => self.serve_set_dns(req, permit).await,
            "/localapi/v0/derpmap" => self.serve_derp_map(req, permit).await,
            "/localapi/v0/set-expiry-sooner" => self.serve_set_expiry_sooner(req, permit).await,
            "/localapi/v0/ping" => self.serve_ping(req, permit).await,
            "/localapi/v0/id-token" => self.serve_id_token(req, permit).await,
            "/localapi/v0/upload-client-metrics" => self.serve_upload_client_metrics(req).await,
            "/localapi/v0/dial" => {
                dial::serve_dial(self.backend.clone(), req).await
            }
            "/" => Ok(text(StatusCode::OK, "trellisd")),
            _ => Err(ApiError::NotFound("404 not found".to_string())),
        }
    }

    async fn serve_status<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !permit.read {
            return Err(ApiError::forbidden("status access denied"));
        }
        let peers = def_bool(query_param(&req, "peers").as_deref(), true);
        let st = self.backend.status(peers).await;
        Ok(json(StatusCode::OK, &st))
    }

    async fn serve_prefs<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !permit.read {
            return Err(ApiError::forbidden("prefs access denied"));
        }
        let method = req.method().clone();
        let prefs = if method == Method::PATCH {
            if !permit.write {
                return Err(ApiError::forbidden("prefs write access denied"));
            }
            let mp: MaskedPrefs = read_json(req).await?;
            self.backend.edit_prefs(mp).await?
        } else if method == Method::GET || method == Method::HEAD {
            self.backend.prefs().await
        } else {
            return Err(ApiError::MethodNotAllowed("unsupported method".to_string()));
        };
        Ok(json(StatusCode::OK, &prefs))
    }

    async fn serve_check_prefs<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !permit.write {
            return Err(ApiError::forbidden("checkprefs access denied"));
        }
        if req.method() != Method::POST {
            return Err(ApiError::MethodNotAllowed("unsupported method".to_string()));
        }
        let prefs: Prefs = read_json(req).await?;
        let mut res = CheckResult::default();
        if let Err(e) = self.backend.check_prefs(prefs).await {
            res.error = Some(e.to_string());
        }
        Ok(json(StatusCode::OK, &res))
    }

    async fn serve_login_interactive<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("login access denied"));
        }
        if req.method() != Method::POST {
            return Err(ApiError::bad_request("want POST"));
        }
        self.backend.start_login_interactive().await;
        Ok(no_content())
    }

    async fn serve_logout<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("logout access denied"));
        }
        if req.method() != Method::POST {
            return Err(ApiError::bad_request("want POST"));
        }
        self.backend.logout().await?;
        Ok(no_content())
    }

    async fn serve_whois<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.read {
            return Err(ApiError::forbidden("whois access denied"));
        }
        let addr = match query_param(&req, "addr") {
            Some(v) => v
                .parse()
                .map_err(|_| ApiError::bad_request("invalid 'addr' parameter"))?,
            None => return Err(ApiError::bad_request("missing 'addr' parameter")),
        };
        match self.backend.who_is(addr).await {
            Some(res) => Ok(json(StatusCode::OK, &res)),
            None => Err(ApiError::NotFound("no match for IP:port".to_string())),
        }
    }

    async fn serve_goroutines<B>(
        &self,
        _req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        // Write access required out of caution: the dump may expose
        // addresses and peer names.
        if !permit.write {
            return Err(ApiError::forbidden("task dump access denied"));
        }
        let metrics = tokio::runtime::Handle::current().metrics();
        let dump = format!(
            "runtime worker threads: {}\nalive tasks: {}\n",
            metrics.num_workers(),
            metrics.num_alive_tasks(),
        );
        Ok(text(StatusCode::OK, dump))
    }

    async fn serve_profile<B>(
        &self,
        _req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        // Same caution as the task dump.
        if !permit.write {
            return Err(ApiError::forbidden("profile access denied"));
        }
        Err(ApiError::Unavailable(
            "not implemented on this platform".to_string(),
        ))
    }

    async fn serve_metrics<B>(
        &self,
        _req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        // Write access required out of caution: metric names and values
        // may be sensitive.
        if !permit.write {
            return Err(ApiError::forbidden("metric access denied"));
        }
        let mut out = String::new();
        self.metrics.write_prometheus(&mut out);
        Ok(text(StatusCode::OK, out))
    }

    async fn serve_debug<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("debug access denied"));
        }
        if req.method() != Method::POST {
            return Err(ApiError::MethodNotAllowed("POST required".to_string()));
        }
        match query_param(&req, "action").as_deref() {
            Some("rebind") => self.backend.debug_rebind().await,
            Some("restun") => self.backend.debug_restun().await,
            Some(other) => {
                return Err(ApiError::bad_request(format!("unknown action {other:?}")))
            }
            None => return Err(ApiError::bad_request("missing parameter 'action'")),
        }
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
        Ok(text(StatusCode::OK, "done"))
    }

    async fn serve_check_ip_forwarding<B>(
        &self,
        _req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.read {
            return Err(ApiError::forbidden("IP forwarding check access denied"));
        }
        let warning = match self.backend.check_ip_forwarding().await {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        Ok(json(StatusCode::OK, &ForwardingWarning { warning }))
    }

    async fn serve_bug_report<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.read {
            return Err(ApiError::forbidden("bugreport access denied"));
        }
        let marker = format!(
            "BUG-{}-{}-{}",
            self.log_id,
            chrono::Utc::now().format("%Y%m%d%H%M%SZ"),
            rand_hex(4),
        );
        info!("user bugreport: {marker}");
        if let Some(note) = query_param(&req, "note") {
            if !note.is_empty() {
                info!("user bugreport note: {note}");
            }
        }
        Ok(text(StatusCode::OK, marker))
    }

    async fn serve_file_targets<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.read {
            return Err(ApiError::forbidden("access denied"));
        }
        if req.method() != Method::GET {
            return Err(ApiError::bad_request("want GET to list targets"));
        }
        let targets = self
            .backend
            .file_targets()
            .await
            .map_err(backend_error_json)?;
        Ok(json(StatusCode::OK, &targets))
    }

    async fn serve_set_dns<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("access denied"));
        }
        if req.method() != Method::POST {
            return Err(ApiError::bad_request("want POST"));
        }
        let name = query_param(&req, "name")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request("missing 'name' parameter"))?;
        let value = query_param(&req, "value")
            .ok_or_else(|| ApiError::bad_request("missing 'value' parameter"))?;
        self.backend
            .set_dns_txt(&name, &value)
            .await
            .map_err(backend_error_json)?;
        Ok(json(StatusCode::OK, &Empty {}))
    }

    async fn serve_derp_map<B>(
        &self,
        req: Request<B>,
        _permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if req.method() != Method::GET {
            return Err(ApiError::bad_request("want GET"));
        }
        let dm = self.backend.derp_map().await;
        Ok(json(StatusCode::OK, &dm))
    }

    async fn serve_set_expiry_sooner<B>(
        &self,
        req: Request<B>,
        _permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if req.method() != Method::POST {
            return Err(ApiError::MethodNotAllowed("POST required".to_string()));
        }
        let expiry: i64 = match query_param(&req, "expiry") {
            Some(v) => v.parse().map_err(|_| {
                ApiError::bad_request("can't parse expiry time, expects a unix timestamp")
            })?,
            None => {
                return Err(ApiError::bad_request(
                    "missing 'expiry' parameter, a unix timestamp",
                ))
            }
        };
        self.backend.set_expiry_sooner(expiry).await?;
        Ok(text(StatusCode::OK, "done"))
    }

    async fn serve_ping<B>(
        &self,
        req: Request<B>,
        _permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if req.method() != Method::POST {
            return Err(ApiError::bad_request("want POST"));
        }
        let ip = match query_param(&req, "ip") {
            Some(v) if !v.is_empty() => v
                .parse()
                .map_err(|_| ApiError::bad_request("invalid IP"))?,
            _ => return Err(ApiError::bad_request("missing 'ip' parameter")),
        };
        let ping_type = match query_param(&req, "type") {
            Some(v) if !v.is_empty() => v
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid ping type {v:?}")))?,
            _ => return Err(ApiError::bad_request("missing 'type' parameter")),
        };
        let res = self
            .backend
            .ping(ip, ping_type)
            .await
            .map_err(backend_error_json)?;
        Ok(json(StatusCode::OK, &res))
    }

    async fn serve_id_token<B>(
        &self,
        req: Request<B>,
        permit: Permit,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("id-token access denied"));
        }
        let nm = self
            .backend
            .net_map()
            .await
            .ok_or_else(|| ApiError::Unavailable("no netmap".to_string()))?;
        let aud = query_param(&req, "aud")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request("no audience requested"))?;
        let body = serde_json::to_vec(&TokenRequest {
            cap_version: CAP_VERSION,
            audience: aud,
            node_key: nm.node_key,
        })
        .map_err(|e| ApiError::Internal(e.to_string()))?;
        let (status, body) = self
            .backend
            .do_upstream_request("POST", "/machine/id-token", body)
            .await?;
        // Relay the upstream reply verbatim, status included.
        Ok(Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(body))
            .unwrap())
    }

    async fn serve_files<B>(
        &self,
        req: Request<B>,
        permit: Permit,
        rest: String,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.write {
            return Err(ApiError::forbidden("file access denied"));
        }
        if rest.is_empty() {
            if req.method() != Method::GET {
                return Err(ApiError::bad_request("want GET to list files"));
            }
            let files = self.backend.waiting_files().await?;
            return Ok(json(StatusCode::OK, &files));
        }
        let name = percent_encoding::percent_decode_str(&rest)
            .decode_utf8()
            .map_err(|_| ApiError::bad_request("bad filename"))?
            .into_owned();
        if req.method() == Method::DELETE {
            self.backend.delete_file(&name).await?;
            Ok(no_content())
        } else if req.method() == Method::GET {
            let (reader, size) = self.backend.open_file(&name).await?;
            let stream = ReaderStream::new(reader).map(|r| r.map(Frame::data));
            let body = StreamBody::new(stream).boxed_unsync();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_LENGTH, size)
                .body(body)
                .unwrap())
        } else {
            Err(ApiError::bad_request("want GET or DELETE"))
        }
    }

    async fn serve_file_put<B>(
        &self,
        req: Request<B>,
        permit: Permit,
        rest: String,
    ) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !permit.write {
            return Err(ApiError::forbidden("file access denied"));
        }
        if req.method() != Method::PUT {
            return Err(ApiError::bad_request("want PUT to put file"));
        }
        let (stable_id, filename_escaped) = rest
            .split_once('/')
            .ok_or_else(|| ApiError::bad_request("bogus URL"))?;
        if stable_id.is_empty() || filename_escaped.is_empty() || filename_escaped.contains('/') {
            return Err(ApiError::bad_request("bogus URL"));
        }

        let targets = self.backend.file_targets().await?;
        let target = targets
            .into_iter()
            .find(|t| t.node.stable_id.0 == stable_id)
            .ok_or_else(|| ApiError::NotFound("node not found".to_string()))?;

        let peer_url = url::Url::parse(&target.peer_api_url)
            .map_err(|_| ApiError::Internal("bogus peer URL".to_string()))?;
        let host = peer_url
            .host_str()
            .ok_or_else(|| ApiError::Internal("bogus peer URL".to_string()))?
            .to_string();

        let conn = self
            .backend
            .dialer()
            .peer_api_dial(&target.peer_api_url)
            .await?;
        let io = hyper_util::rt::TokioIo::new(conn);
        let (mut sender, conn_task) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ApiError::BadGateway(format!("peer connection: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn_task.await {
                debug!("peer API connection ended: {e}");
            }
        });

        // Stream the client's body straight through to the peer.
        let out_req = Request::builder()
            .method(Method::PUT)
            .uri(format!("/v0/put/{filename_escaped}"))
            .header(HOST, host)
            .body(req.into_body())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let resp = sender
            .send_request(out_req)
            .await
            .map_err(|e| ApiError::BadGateway(format!("peer request: {e}")))?;

        let (parts, body) = resp.into_parts();
        let mut builder = Response::builder().status(parts.status);
        if let Some(ct) = parts.headers.get(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        Ok(builder
            .body(body.map_err(std::io::Error::other).boxed_unsync())
            .unwrap())
    }

    async fn serve_cert<B>(
        &self,
        req: Request<B>,
        permit: Permit,
        rest: String,
    ) -> Result<Response<ApiBody>, ApiError> {
        if !permit.cert {
            return Err(ApiError::forbidden("cert access denied"));
        }
        if req.method() != Method::GET {
            return Err(ApiError::bad_request("want GET"));
        }
        if rest.is_empty() {
            return Err(ApiError::bad_request("missing domain"));
        }
        let (cert, key) = self.backend.cert_pair(&rest).await?;
        let body = match query_param(&req, "type").as_deref() {
            Some("cert") | Some("crt") => cert,
            Some("key") => key,
            Some("pem") | None => {
                let mut both = cert;
                both.extend_from_slice(&key);
                both
            }
            Some(other) => {
                return Err(ApiError::bad_request(format!("unknown cert type {other:?}")))
            }
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full_body(body))
            .unwrap())
    }

    async fn serve_upload_client_metrics<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<ApiBody>, ApiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() != Method::POST {
            return Err(ApiError::MethodNotAllowed("unsupported method".to_string()));
        }
        let uploads: Vec<MetricUpload> = read_json(req).await?;

        // Two phases so a rejected entry never leaves earlier entries
        // half-applied: register every name first, add values after.
        let mut handles = Vec::with_capacity(uploads.len());
        for m in &uploads {
            let kind = match m.kind.as_str() {
                "counter" => Kind::Counter,
                "gauge" => Kind::Gauge,
                other => {
                    return Err(ApiError::bad_request(format!("unknown metric type {other:?}")))
                }
            };
            let metric = self
                .metrics
                .register_uploaded(&m.name, kind)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            handles.push(metric);
        }
        for (m, metric) in uploads.iter().zip(&handles) {
            metric.add(m.value);
        }
        Ok(json(StatusCode::OK, &Empty {}))
    }
}

#[derive(Serialize, Default)]
struct CheckResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ForwardingWarning {
    warning: String,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Deserialize)]
struct MetricUpload {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    value: i64,
}

fn with_version(mut resp: Response<ApiBody>) -> Response<ApiBody> {
    resp.headers_mut().insert(
        VERSION_HEADER,
        hyper::header::HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    resp
}

/// Password from a `Basic` Authorization header, if any.
fn basic_auth_password<B>(req: &Request<B>) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let (_user, pass) = creds.split_once(':')?;
    Some(pass.to_string())
}

fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn def_bool(v: Option<&str>, default: bool) -> bool {
    match v {
        Some("1") | Some("t") | Some("true") => true,
        Some("0") | Some("f") | Some("false") => false,
        _ => default,
    }
}

pub(crate) fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ApiError::bad_request(format!("reading body: {}", e.into())))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http_body_util::Full;
    use hyper::header::HeaderValue;

    use trellis_backend::{
        FileTarget, MemBackend, NetMap, Node, StableNodeId, UserProfile,
    };

    use super::*;

    fn new_handler(permit: Permit) -> (Arc<MemBackend>, Handler) {
        let backend = Arc::new(MemBackend::new());
        let handler = Handler::new(
            backend.clone(),
            Arc::new(Registry::new()),
            permit,
            "testlog".to_string(),
        );
        (backend, handler)
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn call(handler: &Handler, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let resp = handler.handle(request(method, uri, body)).await;
        let status = resp.status();
        assert!(
            resp.headers().contains_key(VERSION_HEADER),
            "{method} {uri}: missing version header"
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn netmap() -> NetMap {
        NetMap {
            node_key: "nodekey:abcd".to_string(),
            name: "self.mesh.example.".to_string(),
            domain: "mesh.example".to_string(),
        }
    }

    fn peer_node() -> Node {
        Node {
            id: 7,
            stable_id: StableNodeId("stable-7".to_string()),
            name: "peer7.mesh.example.".to_string(),
            addresses: vec!["100.64.0.7".parse().unwrap()],
            online: true,
        }
    }

    #[tokio::test]
    async fn test_root_banner() {
        let (_b, h) = new_handler(Permit::full());
        let (status, body) = call(&h, "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "trellisd\n");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (_b, h) = new_handler(Permit::full());
        let (status, _) = call(&h, "GET", "/localapi/v0/does-not-exist", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_elides_peers_on_request() {
        let (b, h) = new_handler(Permit::full());
        b.set_netmap(Some(netmap())).await;
        b.add_peer(peer_node(), UserProfile::default(), Vec::new()).await;

        let (status, body) = call(&h, "GET", "/localapi/v0/status", "").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["peers"].as_array().unwrap().len(), 1);

        let (_, body) = call(&h, "GET", "/localapi/v0/status?peers=false", "").await;
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(v.get("peers").is_none());
    }

    #[tokio::test]
    async fn test_gate_denies_without_read() {
        let (_b, h) = new_handler(Permit::NONE);
        for uri in [
            "/localapi/v0/status",
            "/localapi/v0/prefs",
            "/localapi/v0/whois?addr=100.64.0.7:1",
            "/localapi/v0/bugreport",
            "/localapi/v0/check-ip-forwarding",
        ] {
            let (status, _) = call(&h, "GET", uri, "").await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_gate_denies_write_handlers_for_readers() {
        let (_b, h) = new_handler(Permit::read_only());
        let cases = [
            ("PATCH", "/localapi/v0/prefs"),
            ("POST", "/localapi/v0/check-prefs"),
            ("POST", "/localapi/v0/logout"),
            ("GET", "/localapi/v0/metrics"),
            ("GET", "/localapi/v0/goroutines"),
            ("POST", "/localapi/v0/debug?action=rebind"),
            ("GET", "/localapi/v0/files/"),
            ("GET", "/localapi/v0/id-token?aud=x"),
        ];
        for (method, uri) in cases {
            let (status, _) = call(&h, method, uri, "{}").await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn test_cert_needs_cert_permit() {
        let (_b, h) = new_handler(Permit::read_write());
        let (status, _) = call(&h, "GET", "/localapi/v0/cert/node.mesh.example", "").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_prefs_patch_roundtrip() {
        let (_b, h) = new_handler(Permit::full());
        let (status, body) = call(
            &h,
            "PATCH",
            "/localapi/v0/prefs",
            r#"{"want_running":true,"hostname":"workbox"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let prefs: Prefs = serde_json::from_str(&body).unwrap();
        assert!(prefs.want_running);
        assert_eq!(prefs.hostname, "workbox");
    }

    #[tokio::test]
    async fn test_prefs_patch_failure_leaves_prefs_untouched() {
        let (b, h) = new_handler(Permit::full());
        let before = b.prefs().await;

        let (status, body) = call(
            &h,
            "PATCH",
            "/localapi/v0/prefs",
            r#"{"want_running":true,"advertise_routes":["bogus"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(v["error"].as_str().unwrap().contains("bogus"));
        assert_eq!(b.prefs().await, before);
    }

    #[tokio::test]
    async fn test_prefs_patch_bad_json() {
        let (_b, h) = new_handler(Permit::full());
        let (status, _) = call(&h, "PATCH", "/localapi/v0/prefs", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_prefs_reports_error_in_body() {
        let (_b, h) = new_handler(Permit::full());
        let prefs = Prefs {
            hostname: "bad name".to_string(),
            ..Default::default()
        };
        let body = serde_json::to_string(&prefs).unwrap();
        let (status, body) = call(&h, "POST", "/localapi/v0/check-prefs", &body).await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(v["error"].as_str().unwrap().contains("hostname"));

        let ok = serde_json::to_string(&Prefs::default()).unwrap();
        let (_, body) = call(&h, "POST", "/localapi/v0/check-prefs", &ok).await;
        assert_eq!(body, "{}");
    }

    #[tokio::test]
    async fn test_whois() {
        let (b, h) = new_handler(Permit::full());
        b.add_peer(
            peer_node(),
            UserProfile {
                id: 1,
                login_name: "dave@example.com".to_string(),
                display_name: "Dave".to_string(),
            },
            vec![],
        )
        .await;

        let (status, _) = call(&h, "GET", "/localapi/v0/whois", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "GET", "/localapi/v0/whois?addr=nonsense", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "GET", "/localapi/v0/whois?addr=100.64.0.99:1", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&h, "GET", "/localapi/v0/whois?addr=100.64.0.7:345", "").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["user_profile"]["login_name"], "dave@example.com");
    }

    #[tokio::test]
    async fn test_bugreport_marker_shape() {
        let (_b, h) = new_handler(Permit::read_only());
        let (status, body) = call(&h, "POST", "/localapi/v0/bugreport?note=hi", "").await;
        assert_eq!(status, StatusCode::OK);
        let marker = body.trim_end();
        // BUG-<logid>-<14-digit stamp>Z-<hex8>
        let parts: Vec<&str> = marker.split('-').collect();
        assert_eq!(parts[0], "BUG");
        assert_eq!(parts[1], "testlog");
        assert_eq!(parts[2].len(), 15);
        assert!(parts[2].ends_with('Z'));
        assert_eq!(parts[3].len(), 8);
    }

    #[tokio::test]
    async fn test_debug_actions() {
        let (_b, h) = new_handler(Permit::full());
        let (status, body) = call(&h, "POST", "/localapi/v0/debug?action=rebind", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "done\n");

        let (status, _) = call(&h, "POST", "/localapi/v0/debug?action=selfdestruct", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "POST", "/localapi/v0/debug", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "GET", "/localapi/v0/debug?action=rebind", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_upload_client_metrics() {
        let (_b, h) = new_handler(Permit::NONE);
        let (status, _) = call(
            &h,
            "POST",
            "/localapi/v0/upload-client-metrics",
            r#"[{"name":"test_gui_clicks","type":"counter","value":3}]"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Additive on re-upload.
        let (status, _) = call(
            &h,
            "POST",
            "/localapi/v0/upload-client-metrics",
            r#"[{"name":"test_gui_clicks","type":"counter","value":2}]"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Kind change is rejected.
        let (status, _) = call(
            &h,
            "POST",
            "/localapi/v0/upload-client-metrics",
            r#"[{"name":"test_gui_clicks","type":"gauge","value":1}]"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_rejects_published_names() {
        let (_b, h) = new_handler(Permit::NONE);
        h.metrics.new_counter("test_daemon_owned");
        let (status, body) = call(
            &h,
            "POST",
            "/localapi/v0/upload-client-metrics",
            r#"[{"name":"test_daemon_owned","type":"counter","value":1}]"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("test_daemon_owned"));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (_b, h) = new_handler(Permit::full());
        h.metrics.new_counter("test_requests").add(2);
        let (status, body) = call(&h, "GET", "/localapi/v0/metrics", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE test_requests counter"));
        assert!(body.contains("test_requests 2"));
    }

    #[tokio::test]
    async fn test_files_listing_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemBackend::new().with_file_dir(dir.path().to_path_buf()));
        let h = Handler::new(
            backend.clone(),
            Arc::new(Registry::new()),
            Permit::full(),
            "testlog".to_string(),
        );
        tokio::fs::write(dir.path().join("notes.txt"), b"hello")
            .await
            .unwrap();

        let (status, body) = call(&h, "GET", "/localapi/v0/files/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("notes.txt"));

        let resp = h.handle(request("GET", "/localapi/v0/files/notes.txt", "")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_LENGTH),
            Some(&HeaderValue::from_static("5"))
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        let (status, _) = call(&h, "DELETE", "/localapi/v0/files/notes.txt", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&h, "GET", "/localapi/v0/files/notes.txt", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_file_put_path_validation() {
        let (b, h) = new_handler(Permit::full());
        b.set_netmap(Some(netmap())).await;

        let (status, _) = call(&h, "PUT", "/localapi/v0/file-put/missing-slash", "x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "PUT", "/localapi/v0/file-put/stable-9/f.txt", "x").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        b.set_file_targets(vec![FileTarget {
            node: peer_node(),
            peer_api_url: "http://127.0.0.1:1/".to_string(),
        }])
        .await;
        // Target known but unreachable: the dial fails, not the lookup.
        let (status, _) = call(&h, "PUT", "/localapi/v0/file-put/stable-7/f.txt", "x").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_id_token_relays_upstream() {
        let (b, h) = new_handler(Permit::full());

        let (status, _) = call(&h, "GET", "/localapi/v0/id-token?aud=aws", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "no netmap yet");

        b.set_netmap(Some(netmap())).await;
        let (status, _) = call(&h, "GET", "/localapi/v0/id-token", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "audience required");

        b.set_upstream_response(201, br#"{"token":"xyz"}"#.to_vec()).await;
        let (status, body) = call(&h, "GET", "/localapi/v0/id-token?aud=aws", "").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, r#"{"token":"xyz"}"#);
    }

    #[tokio::test]
    async fn test_set_dns_txt() {
        let (b, h) = new_handler(Permit::full());
        b.set_netmap(Some(netmap())).await;

        let (status, _) = call(&h, "POST", "/localapi/v0/set-dns?value=v", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &h,
            "POST",
            "/localapi/v0/set-dns?name=_acme-challenge.n.mesh.example&value=tok",
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{}");
        assert_eq!(
            b.txt_record("_acme-challenge.n.mesh.example").await.as_deref(),
            Some("tok")
        );
    }

    #[tokio::test]
    async fn test_ping_validates_both_parameters() {
        let (b, h) = new_handler(Permit::NONE);
        b.add_peer(peer_node(), UserProfile::default(), vec![]).await;

        let (status, _) = call(&h, "POST", "/localapi/v0/ping?type=disco", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "POST", "/localapi/v0/ping?ip=100.64.0.7", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "POST", "/localapi/v0/ping?ip=100.64.0.7&type=warp", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&h, "POST", "/localapi/v0/ping?ip=100.64.0.7&type=disco", "").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["ip"], "100.64.0.7");
    }

    #[tokio::test]
    async fn test_set_expiry_sooner() {
        let (b, h) = new_handler(Permit::NONE);
        b.set_netmap(Some(netmap())).await;

        let (status, _) = call(&h, "POST", "/localapi/v0/set-expiry-sooner", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, "POST", "/localapi/v0/set-expiry-sooner?expiry=soon", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) =
            call(&h, "POST", "/localapi/v0/set-expiry-sooner?expiry=1700000000", "").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(b.key_expiry().await, Some(1700000000));
    }

    #[tokio::test]
    async fn test_dial_rejects_before_upgrade() {
        let (_b, h) = new_handler(Permit::NONE);

        let (status, _) = call(&h, "GET", "/localapi/v0/dial", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        // POST without upgrade headers.
        let (status, _) = call(&h, "POST", "/localapi/v0/dial", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Upgrade headers but no dial target.
        let req = Request::builder()
            .method("POST")
            .uri("/localapi/v0/dial")
            .header("Connection", "upgrade")
            .header("Upgrade", DIAL_UPGRADE_PROTO)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = h.handle(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_required_password() {
        let (_b, h) = new_handler(Permit::full());
        let h = h.with_required_password(Some("sekrit".to_string()));

        let (status, _) = call(&h, "GET", "/localapi/v0/status", "").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bad = BASE64.encode("user:wrong");
        let req = Request::builder()
            .method("GET")
            .uri("/localapi/v0/status")
            .header(AUTHORIZATION, format!("Basic {bad}"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(h.handle(req).await.status(), StatusCode::FORBIDDEN);

        let good = BASE64.encode("user:sekrit");
        let req = Request::builder()
            .method("GET")
            .uri("/localapi/v0/status")
            .header(AUTHORIZATION, format!("Basic {good}"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(h.handle(req).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_token_grants_read_write() {
        let (_b, h) = new_handler(Permit::NONE);
        let h = h.with_auth_token(Some("tok123".to_string()));

        let (status, _) = call(&h, "GET", "/localapi/v0/status", "").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let auth = BASE64.encode(":tok123");
        let req = Request::builder()
            .method("GET")
            .uri("/localapi/v0/status")
            .header(AUTHORIZATION, format!("Basic {auth}"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(h.handle(req).await.status(), StatusCode::OK);

        // The token still does not grant cert access.
        let req = Request::builder()
            .method("GET")
            .uri("/localapi/v0/cert/x.mesh.example")
            .header(AUTHORIZATION, format!("Basic {auth}"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(h.handle(req).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_check_ip_forwarding_shape() {
        let (_b, h) = new_handler(Permit::read_only());
        let (status, body) = call(&h, "GET", "/localapi/v0/check-ip-forwarding", "").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(v.get("warning").is_some());
    }

    #[tokio::test]
    async fn test_derpmap() {
        let (b, h) = new_handler(Permit::NONE);
        let (status, body) = call(&h, "GET", "/localapi/v0/derpmap", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "null");

        b.set_derp_map(Some(trellis_backend::DerpMap {
            regions: vec![trellis_backend::DerpRegion {
                region_id: 1,
                region_code: "nyc".to_string(),
                hostname: "derp1.mesh.example".to_string(),
            }],
        }))
        .await;
        let (_, body) = call(&h, "GET", "/localapi/v0/derpmap", "").await;
        assert!(body.contains("nyc"));

        let (status, _) = call(&h, "POST", "/localapi/v0/derpmap", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
