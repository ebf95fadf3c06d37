//! The per-connection HTTP state machine.
//!
//! One task owns a client connection for its whole life: optional TLS
//! handshake, then the keep-alive loop of parse -> route -> forward ->
//! relay. Framing violations are answered before anything reaches a
//! backend; error replies always close the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use metrics::counter;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::responses;
use super::tunnel;
use super::{Listener, Proxy};
use crate::balancer::{Backend, BackendKind, RegularBackend, Service, SessionKind};
use crate::error::{GantryError, GantryResult};
use crate::http::body::{copy_chunked, copy_fixed, copy_until_eof};
use crate::http::io::{Conn, ReadLine};
use crate::http::request::{basic_auth_user, RequestLineError};
use crate::http::{HeaderCode, HttpRequest, HttpResponse, Method};
use crate::logfmt::{suppressed, LogContext};
use crate::rewrite::{apply_request_rules, apply_response_rules, rewrite_location};
use crate::tls::TlsClientInfo;

/// RPC streaming is only engaged for advertised lengths in this window
const RPC_MIN_LEN: u64 = 0x20000;
const RPC_MAX_LEN: u64 = 0x8000_0000;

/// Largest POST body buffered for form-parameter session keys
const FORM_BODY_LIMIT: u64 = 16 * 1024;

/// Largest body accepted by the control backend
const CONTROL_BODY_LIMIT: u64 = 64 * 1024;

// WebSocket upgrade progress bits
const WS_REQ_GET: u8 = 0x01;
const WS_REQ_CONN_UPGRADE: u8 = 0x02;
const WS_REQ_UPGRADE_WEBSOCKET: u8 = 0x04;
const WS_RESP_101: u8 = 0x08;
const WS_RESP_CONN_UPGRADE: u8 = 0x10;
const WS_RESP_UPGRADE_WEBSOCKET: u8 = 0x20;
const WS_COMPLETE: u8 = WS_REQ_GET
    | WS_REQ_CONN_UPGRADE
    | WS_REQ_UPGRADE_WEBSOCKET
    | WS_RESP_101
    | WS_RESP_CONN_UPGRADE
    | WS_RESP_UPGRADE_WEBSOCKET;

/// Keep-alive decision after one exchange
enum Flow {
    Continue,
    Close,
}

/// A kept backend connection between keep-alive requests
struct PooledBackend {
    backend: Arc<Backend>,
    conn: Conn,
}

/// Entry point for a freshly accepted client socket
pub async fn handle_connection(
    proxy: Arc<Proxy>,
    listener: Arc<Listener>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);

    let (client, tls) = match &listener.tls {
        Some(tls_settings) => {
            let accepted = tokio::time::timeout(
                listener.client_to,
                tls_settings.acceptor.accept(stream),
            )
            .await;
            match accepted {
                Ok(Ok(tls_stream)) => {
                    let info = TlsClientInfo::from_connection(tls_stream.get_ref().1);
                    (Conn::new(tls_stream, listener.client_to), Some(info))
                }
                _ => {
                    // handshake failures are closed without ceremony
                    debug!(%peer, "TLS handshake failed");
                    return;
                }
            }
        }
        None => (Conn::new(stream, listener.client_to), None),
    };

    let mut driver = Driver {
        proxy,
        listener,
        peer,
        tls,
        client,
        backend: None,
    };
    driver.run().await;
}

struct Driver {
    proxy: Arc<Proxy>,
    listener: Arc<Listener>,
    peer: SocketAddr,
    tls: Option<TlsClientInfo>,
    client: Conn,
    backend: Option<PooledBackend>,
}

/// Facts gathered in the single request-header scan
#[derive(Debug, Default)]
struct RequestMeta {
    chunked: bool,
    content_len: Option<u64>,
    conn_close: bool,
    ws_state: u8,
    /// Some(true): RPC_IN_DATA, Some(false): RPC_OUT_DATA
    rpc: Option<bool>,
}

/// Facts gathered from a response-header scan
#[derive(Debug, Default)]
struct ResponseMeta {
    chunked: bool,
    content_len: Option<u64>,
    conn_close: bool,
    ws_state: u8,
    no_cont: bool,
    skip: bool,
}

impl Driver {
    async fn run(&mut self) {
        loop {
            match self.serve_one().await {
                Flow::Continue => continue,
                Flow::Close => break,
            }
        }
        if let Some(mut pooled) = self.backend.take() {
            pooled.conn.shutdown().await;
        }
        self.client.shutdown().await;
    }

    /// Reply with an error and end the connection
    async fn fail(&mut self, status: u16) -> Flow {
        let _ = responses::send_error(&mut self.client, &self.listener, status).await;
        counter!("gantry_errors_total", "status" => status.to_string()).increment(1);
        Flow::Close
    }

    async fn serve_one(&mut self) -> Flow {
        // request line, tolerating leading blank lines
        let line = loop {
            match self.client.read_line().await {
                Ok(ReadLine::Line(l)) if l.is_empty() => continue,
                Ok(ReadLine::Line(l)) => break l,
                Ok(ReadLine::Eof) => return Flow::Close,
                Err(_) => return Flow::Close,
            }
        };

        let started = Instant::now();
        let started_wall = Local::now();

        let mut req = match HttpRequest::parse(line.clone(), self.listener.xhttp) {
            Ok(req) => req,
            Err(RequestLineError::BadUrl) => {
                warn!(peer = %self.peer, line = %line, "request URL decodes to NUL");
                return self.fail(400).await;
            }
            Err(_) => {
                warn!(peer = %self.peer, line = %line, "unparseable or disallowed request");
                return self.fail(501).await;
            }
        };
        let cl_11 = req.version == 1;

        // headers up to the blank line
        loop {
            match self.client.read_line().await {
                Ok(ReadLine::Line(l)) if l.is_empty() => break,
                Ok(ReadLine::Line(l)) => {
                    if req.headers.append(l) == HeaderCode::Illegal {
                        debug!(peer = %self.peer, "dropping illegal header");
                    }
                }
                Ok(ReadLine::Eof) | Err(_) => return Flow::Close,
            }
        }

        if let Some(allow) = &self.listener.allow_url {
            if !allow.is_match(req.decoded_url()) {
                warn!(peer = %self.peer, url = %req.decoded_url(), "URL outside allow pattern");
                return self.fail(501).await;
            }
        }

        let mut meta = match scan_request_headers(&mut req) {
            Ok(meta) => meta,
            Err(status) => return self.fail(status).await,
        };

        // request smuggling defense: both framings present
        if meta.chunked && meta.content_len.is_some() {
            warn!(peer = %self.peer, "Content-Length and chunked Transfer-Encoding together");
            return self.fail(400).await;
        }

        if self.listener.max_req > 0
            && meta.rpc != Some(true)
            && meta.content_len.unwrap_or(0) > self.listener.max_req
        {
            return self.fail(413).await;
        }

        counter!("gantry_requests_total", "listener" => self.listener.name.clone())
            .increment(1);

        apply_request_rules(&self.listener.rewrite_request, &mut req, self.peer.ip());

        // first matching service wins, in listed order
        let service = match self
            .listener
            .services
            .iter()
            .find(|s| s.matches(&mut req, self.peer.ip()))
            .cloned()
        {
            Some(service) => service,
            None => {
                info!(peer = %self.peer, line = %req.line, "no service matched");
                return self.fail(503).await;
            }
        };

        apply_request_rules(&service.rewrite_request, &mut req, self.peer.ip());

        // form-parameter sessions need the body before selection
        let form_body = match self.pre_read_form_body(&service, &req, &meta).await {
            Ok(body) => body,
            Err(_) => return Flow::Close,
        };
        if form_body.is_some() {
            meta.content_len = Some(form_body.as_deref().unwrap().len() as u64);
        }

        let mut backend = match service
            .select_backend(&req, self.peer.ip(), form_body.as_deref())
            .await
        {
            Some(backend) => backend,
            None => {
                info!(service = %service.name, "no backend available");
                return self.fail(503).await;
            }
        };

        // drop a pooled connection that does not fit this backend
        let reusable = match self.backend.as_mut() {
            Some(pooled) => {
                Arc::ptr_eq(&pooled.backend, &backend) && !pooled.conn.is_stale().await
            }
            None => false,
        };
        if !reusable {
            self.backend = None;
        }

        // dial, treating connect failure as backend death and retrying
        // siblings while nothing has been written to the client
        while backend.regular().is_some() && self.backend.is_none() {
            let regular = backend.regular().unwrap();
            match dial(regular).await {
                Ok(conn) => {
                    self.backend = Some(PooledBackend {
                        backend: backend.clone(),
                        conn,
                    });
                }
                Err(e) => {
                    warn!(backend = %regular.label, "connect failed: {}", e);
                    counter!("gantry_backend_failures_total").increment(1);
                    service.kill_backend(&backend).await;
                    backend = match service
                        .select_backend(&req, self.peer.ip(), form_body.as_deref())
                        .await
                    {
                        Some(next) => next,
                        None => {
                            info!(service = %service.name, "backends exhausted");
                            return self.fail(503).await;
                        }
                    };
                }
            }
        }

        let force_10 = match self.listener.no_https_11 {
            1 => self.tls.is_some(),
            2 => {
                self.tls.is_some()
                    && req
                        .headers
                        .value_of(HeaderCode::UserAgent)
                        .is_some_and(|ua| ua.contains("MSIE"))
            }
            _ => false,
        };

        if backend.regular().is_none() {
            // terminal backend: drain the body, answer locally
            self.backend = None;
            return self
                .serve_terminal(
                    &service,
                    &mut req,
                    &meta,
                    &backend,
                    form_body,
                    started,
                    started_wall,
                )
                .await
                .and_keepalive(cl_11, meta.conn_close, force_10);
        }

        let exchange = self
            .exchange(
                &service,
                &mut req,
                &mut meta,
                &backend,
                form_body,
                started,
                started_wall,
            )
            .await;
        match exchange {
            Ok(flow) => {
                if matches!(flow, Flow::Close) {
                    return Flow::Close;
                }
                Flow::Continue.and_keepalive(cl_11, meta.conn_close, force_10)
            }
            Err(ExchangeError::Reply(status)) => self.fail(status).await,
            Err(ExchangeError::Abort) => Flow::Close,
        }
    }

    /// Buffer a small urlencoded POST body when the service keys
    /// sessions on a form parameter.
    async fn pre_read_form_body(
        &mut self,
        service: &Service,
        req: &HttpRequest,
        meta: &RequestMeta,
    ) -> GantryResult<Option<String>> {
        if service.session.kind != SessionKind::Param
            || req.method != Method::Post
            || meta.chunked
        {
            return Ok(None);
        }
        let len = match meta.content_len {
            Some(len) if len > 0 && len <= FORM_BODY_LIMIT => len,
            _ => return Ok(None),
        };
        let is_form = req
            .headers
            .value_of_name("Content-Type")
            .is_some_and(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            });
        if !is_form {
            return Ok(None);
        }
        let body = self.read_exact_body(len).await?;
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }

    async fn read_exact_body(&mut self, len: u64) -> GantryResult<Vec<u8>> {
        let mut body = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < body.len() {
            let n = self.client.read_some(&mut body[filled..]).await?;
            if n == 0 {
                return Err(GantryError::client("unexpected EOF in body"));
            }
            filled += n;
        }
        Ok(body)
    }

    /// Answer a request routed to a non-forwarding backend
    #[allow(clippy::too_many_arguments)]
    async fn serve_terminal(
        &mut self,
        service: &Arc<Service>,
        req: &mut HttpRequest,
        meta: &RequestMeta,
        backend: &Arc<Backend>,
        form_body: Option<String>,
        started: Instant,
        started_wall: chrono::DateTime<Local>,
    ) -> Flow {
        // the control backend is the one terminal that wants the body;
        // a pre-read form body was already consumed from the socket
        let control_body = if matches!(backend.kind, BackendKind::Control)
            && req.method == Method::Post
        {
            match (form_body, meta.content_len) {
                (Some(body), _) => Some(body),
                (None, Some(len)) if len <= CONTROL_BODY_LIMIT => {
                    match self.read_exact_body(len).await {
                        Ok(body) => Some(String::from_utf8_lossy(&body).into_owned()),
                        Err(_) => return Flow::Close,
                    }
                }
                _ => None,
            }
        } else if form_body.is_none() {
            match self.drain_request_body(req, meta).await {
                Ok(()) => None,
                Err(_) => return Flow::Close,
            }
        } else {
            None
        };

        let (status, reply) = match &backend.kind {
            BackendKind::Redirect {
                status,
                target,
                has_uri,
            } => responses::redirect_reply(req, *status, target, *has_uri),
            BackendKind::Acme { root } => responses::acme_reply(req, root).await,
            BackendKind::StaticError { .. } => responses::static_error_reply(backend),
            BackendKind::Control => {
                let (status, content_type, body) = crate::control::handle(
                    &self.proxy,
                    req.method,
                    req.path(),
                    control_body.as_deref(),
                )
                .await;
                (
                    status,
                    responses::build_reply(status, content_type, &[], &body),
                )
            }
            BackendKind::Metrics => {
                let (status, content_type, body) = crate::control::metrics_reply();
                (
                    status,
                    responses::build_reply(status, content_type, &[], &body),
                )
            }
            BackendKind::Regular(_) => unreachable!("terminal path"),
        };

        let bytes = reply.len() as u64;
        if self.client.write_all(&reply).await.is_err() {
            return Flow::Close;
        }
        let _ = self.client.flush().await;

        self.log_access(
            req,
            None,
            status,
            bytes,
            started,
            started_wall,
            Some(service),
            Some(&backend.label()),
        );
        Flow::Continue
    }

    /// Read and discard the request body (terminal backends still
    /// receive one sometimes).
    async fn drain_request_body(
        &mut self,
        req: &HttpRequest,
        meta: &RequestMeta,
    ) -> GantryResult<()> {
        if req.version == 1 && meta.chunked {
            copy_chunked(&mut self.client, None, self.listener.max_req).await?;
        } else if let Some(len) = meta.content_len {
            copy_fixed(&mut self.client, None, len).await?;
        }
        Ok(())
    }

    /// Forward the request to a regular backend and relay the response
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &mut self,
        service: &Arc<Service>,
        req: &mut HttpRequest,
        meta: &mut RequestMeta,
        backend: &Arc<Backend>,
        form_body: Option<String>,
        started: Instant,
        started_wall: chrono::DateTime<Local>,
    ) -> Result<Flow, ExchangeError> {
        let regular = backend.regular().expect("regular backend");
        let vhost = req.host().map(String::from);

        if self.listener.rewr_dest {
            rewrite_destination(req, regular);
        }

        // send request line, headers and body
        if let Err(e) = self.write_request(service, req, regular, form_body).await {
            warn!(backend = %regular.label, "request write failed: {}", e);
            self.backend = None;
            return Err(ExchangeError::Reply(500));
        }

        if meta.rpc == Some(true) {
            // no response expected; the client closes when done
            self.log_access(
                req,
                None,
                0,
                0,
                started,
                started_wall,
                Some(service),
                Some(&regular.label),
            );
            self.backend = None;
            return Ok(Flow::Close);
        }

        // responses, skipping informational ones
        let mut res_bytes: u64 = 0;
        loop {
            let mut resp = match self.read_response_head().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(backend = %regular.label, "response read failed: {}", e);
                    self.backend = None;
                    return Err(ExchangeError::Reply(500));
                }
            };

            let be_11 = resp.version == 1;
            let mut rmeta = scan_response_headers(&mut resp, req.method, &mut meta.rpc);
            if rmeta.conn_close {
                meta.conn_close = true;
            }
            meta.ws_state |= rmeta.ws_state;

            apply_response_rules(
                &service.rewrite_response,
                req,
                &mut resp,
                self.peer.ip(),
            );
            apply_response_rules(
                &self.listener.rewrite_response,
                req,
                &mut resp,
                self.peer.ip(),
            );

            if self.listener.rewr_loc {
                rewrite_location_headers(
                    &mut resp,
                    vhost.as_deref(),
                    &regular.label,
                    self.tls.is_some(),
                );
            }

            service
                .record_response_session(&resp.headers, backend)
                .await;

            if !rmeta.skip {
                if self.write_response_head(&resp).await.is_err() {
                    self.backend = None;
                    return Err(ExchangeError::Abort);
                }
            }

            let mut backend_consumed = false;
            if !rmeta.no_cont {
                let result = self
                    .relay_response_body(&mut rmeta, be_11, &mut res_bytes)
                    .await;
                match result {
                    Ok(consumed) => backend_consumed = consumed,
                    Err(_) => {
                        self.backend = None;
                        return Err(ExchangeError::Abort);
                    }
                }
            } else if meta.ws_state == WS_COMPLETE {
                let pooled = self.backend.as_mut().expect("dialed backend");
                self.client.set_timeout(regular.ws_to * 2);
                pooled.conn.set_timeout(regular.ws_to * 2);
                match tunnel::run(&mut self.client, &mut pooled.conn, regular.ws_to).await {
                    Ok(stats) => res_bytes += stats.down,
                    Err(e) => debug!("tunnel ended with error: {}", e),
                }
                self.client.set_timeout(self.listener.client_to);
                backend_consumed = true;
                meta.conn_close = true;
            }

            if rmeta.skip {
                continue;
            }

            self.log_access(
                req,
                Some(&resp),
                resp.status,
                res_bytes,
                started,
                started_wall,
                Some(service),
                Some(&regular.label),
            );
            counter!(
                "gantry_responses_total",
                "status_class" => format!("{}xx", resp.status / 100)
            )
            .increment(1);

            // retain the backend connection only when it stayed in a
            // reusable state
            if !be_11 || backend_consumed {
                if let Some(mut pooled) = self.backend.take() {
                    pooled.conn.shutdown().await;
                }
            }
            if backend_consumed {
                // read-until-EOF and tunnels take HTTP/1.1 reuse with them
                meta.conn_close = true;
            }
            return Ok(Flow::Continue);
        }
    }

    /// Relay one response body per its framing. Returns whether the
    /// backend connection was consumed (read to EOF).
    async fn relay_response_body(
        &mut self,
        rmeta: &mut ResponseMeta,
        be_11: bool,
        res_bytes: &mut u64,
    ) -> GantryResult<bool> {
        let pooled = self.backend.as_mut().expect("dialed backend");
        let dst = if rmeta.skip {
            None
        } else {
            Some(&mut self.client)
        };

        if be_11 && rmeta.chunked {
            *res_bytes += copy_chunked(&mut pooled.conn, dst, 0).await?;
            Ok(false)
        } else if let Some(len) = rmeta.content_len {
            *res_bytes += copy_fixed(&mut pooled.conn, dst, len).await?;
            Ok(false)
        } else if !rmeta.skip {
            // legacy framing: body runs to connection close
            *res_bytes +=
                copy_until_eof(&mut pooled.conn, dst.expect("not skipping"), 0).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Write request line, headers, injected headers and body
    async fn write_request(
        &mut self,
        service: &Service,
        req: &HttpRequest,
        regular: &RegularBackend,
        form_body: Option<String>,
    ) -> GantryResult<()> {
        let pooled = self.backend.as_mut().expect("dialed backend");
        let conn = &mut pooled.conn;

        let mut head = String::with_capacity(512);
        head.push_str(&req.request_line());
        head.push_str("\r\n");

        // the client's own forwarded-for header survives only for
        // trusted peers; everyone else gets it replaced
        let ff_name = service.forwarded_for.as_str();
        let trusted = !service.trusted.is_empty() && service.trusted.matches(self.peer.ip());
        let mut ff_values: Vec<String> = Vec::new();
        for hdr in req.headers.iter() {
            if hdr.name().eq_ignore_ascii_case(ff_name) {
                if trusted {
                    ff_values.push(hdr.value().to_string());
                }
                continue;
            }
            head.push_str(hdr.text());
            head.push_str("\r\n");
        }

        for line in &self.listener.add_headers {
            head.push_str(line);
            head.push_str("\r\n");
        }

        if let Some(tls) = &self.tls {
            let verify = self
                .listener
                .tls
                .as_ref()
                .map(|t| t.client_verify)
                .unwrap_or(0);
            for line in tls.header_lines(verify) {
                head.push_str(&line);
                head.push_str("\r\n");
            }
        }

        ff_values.push(self.peer.ip().to_string());
        head.push_str(&format!("{}: {}\r\n", ff_name, ff_values.join(", ")));
        head.push_str("\r\n");

        conn.write_all(head.as_bytes()).await?;

        if let Some(body) = form_body {
            conn.write_all(body.as_bytes()).await?;
            conn.flush().await?;
            return Ok(());
        }

        // request body per its framing
        let meta_chunked = req.version == 1
            && req
                .headers
                .value_of(HeaderCode::TransferEncoding)
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let cont = req
            .headers
            .value_of(HeaderCode::ContentLength)
            .and_then(|v| v.trim().parse::<u64>().ok());

        if meta_chunked {
            copy_chunked(&mut self.client, Some(&mut *conn), self.listener.max_req).await?;
        } else if req.method.is_rpc() {
            if let Some(len) = cont.filter(|l| (RPC_MIN_LEN..RPC_MAX_LEN).contains(l)) {
                if req.method == Method::RpcInData {
                    copy_until_eof(&mut self.client, &mut *conn, len).await?;
                }
            } else if let Some(len) = cont {
                copy_fixed(&mut self.client, Some(&mut *conn), len).await?;
            }
        } else if let Some(len) = cont {
            copy_fixed(&mut self.client, Some(&mut *conn), len).await?;
        }
        conn.flush().await?;
        Ok(())
    }

    /// Read a response status line and headers from the backend
    async fn read_response_head(&mut self) -> GantryResult<HttpResponse> {
        let pooled = self.backend.as_mut().expect("dialed backend");
        let conn = &mut pooled.conn;

        let line = loop {
            match conn.read_line().await? {
                ReadLine::Line(l) if l.is_empty() => continue,
                ReadLine::Line(l) => break l,
                ReadLine::Eof => {
                    return Err(GantryError::backend("EOF before response"));
                }
            }
        };
        let mut resp = HttpResponse::parse(line)
            .ok_or_else(|| GantryError::backend("unparseable status line"))?;

        loop {
            match conn.read_line().await? {
                ReadLine::Line(l) if l.is_empty() => break,
                ReadLine::Line(l) => {
                    resp.headers.append(l);
                }
                ReadLine::Eof => {
                    return Err(GantryError::backend("EOF inside response headers"));
                }
            }
        }
        Ok(resp)
    }

    async fn write_response_head(&mut self, resp: &HttpResponse) -> GantryResult<()> {
        let mut head = String::with_capacity(512);
        head.push_str(&resp.line);
        head.push_str("\r\n");
        for hdr in resp.headers.iter() {
            head.push_str(hdr.text());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.client.write_all(head.as_bytes()).await?;
        self.client.flush().await
    }

    #[allow(clippy::too_many_arguments)]
    fn log_access(
        &self,
        req: &HttpRequest,
        resp: Option<&HttpResponse>,
        status: u16,
        bytes: u64,
        started: Instant,
        started_wall: chrono::DateTime<Local>,
        service: Option<&Arc<Service>>,
        backend: Option<&str>,
    ) {
        if let Some(service) = service {
            if suppressed(service.log_suppress, status) {
                return;
            }
        }
        let line = self.listener.log_format.render(&LogContext {
            peer: self.peer.ip(),
            anonymize: self.proxy.server.anonymize_ip,
            request: Some(req),
            response: resp,
            status,
            bytes,
            start: started_wall,
            duration: started.elapsed(),
            listener: &self.listener.name,
            service: service.map(|s| s.name.as_str()),
            backend,
        });
        info!(target: "access", "{}", line);
    }
}

/// Exchange failures, split by whether the client can still be told
enum ExchangeError {
    /// Nothing was sent yet; reply with this status
    Reply(u16),
    /// Mid-stream failure; just drop the connection
    Abort,
}

impl Flow {
    /// Fold the HTTP/1.0, Connection: close and forced-close signals
    /// into the keep-alive decision
    fn and_keepalive(self, cl_11: bool, conn_close: bool, force_10: bool) -> Flow {
        match self {
            Flow::Close => Flow::Close,
            Flow::Continue if cl_11 && !conn_close && !force_10 => Flow::Continue,
            _ => Flow::Close,
        }
    }
}

/// Connect to a backend, with its connect timeout and optional TLS
async fn dial(regular: &RegularBackend) -> GantryResult<Conn> {
    let stream = tokio::time::timeout(regular.conn_to, TcpStream::connect(regular.addr))
        .await
        .map_err(|_| GantryError::timeout(regular.conn_to, "backend connect"))?
        .map_err(GantryError::from)?;
    let _ = stream.set_nodelay(true);

    match &regular.tls {
        Some(config) => {
            let name = regular
                .sni
                .clone()
                .unwrap_or_else(|| regular.addr.ip().to_string());
            let server_name = rustls::pki_types::ServerName::try_from(name)
                .map_err(|e| GantryError::tls(format!("bad backend SNI name: {}", e)))?;
            let connector = tokio_rustls::TlsConnector::from(config.clone());
            let tls_stream =
                tokio::time::timeout(regular.conn_to, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| GantryError::timeout(regular.conn_to, "backend TLS"))?
                    .map_err(|e| GantryError::tls(e.to_string()))?;
            Ok(Conn::new(tls_stream, regular.be_to))
        }
        None => Ok(Conn::new(stream, regular.be_to)),
    }
}

/// One pass over the request headers: classify, extract, and enforce
/// the framing rules. Returns the HTTP status to fail with on error.
fn scan_request_headers(req: &mut HttpRequest) -> Result<RequestMeta, u16> {
    let mut meta = RequestMeta {
        rpc: match req.method {
            Method::RpcInData => Some(true),
            Method::RpcOutData => Some(false),
            _ => None,
        },
        ws_state: if req.method == Method::Get {
            WS_REQ_GET
        } else {
            0
        },
        ..Default::default()
    };

    let mut remove = Vec::new();
    for (index, hdr) in req.headers.iter().enumerate() {
        match hdr.code {
            HeaderCode::Connection => {
                let value = hdr.value();
                if value.eq_ignore_ascii_case("close") {
                    meta.conn_close = true;
                } else if value.to_ascii_lowercase().contains("upgrade") {
                    meta.ws_state |= WS_REQ_CONN_UPGRADE;
                }
            }
            HeaderCode::Upgrade => {
                if hdr.value().eq_ignore_ascii_case("websocket") {
                    meta.ws_state |= WS_REQ_UPGRADE_WEBSOCKET;
                }
            }
            HeaderCode::TransferEncoding => {
                if hdr.value().eq_ignore_ascii_case("chunked") {
                    meta.chunked = true;
                } else {
                    warn!("unsupported Transfer-Encoding {:?}", hdr.value());
                    return Err(400);
                }
            }
            HeaderCode::ContentLength => {
                if meta.content_len.is_some() || hdr.value().contains(',') {
                    warn!("multiple Content-Length values");
                    return Err(400);
                }
                let parsed: i64 = match hdr.value().trim().parse() {
                    Ok(v) => v,
                    Err(_) => {
                        warn!("bad Content-Length {:?}", hdr.value());
                        return Err(400);
                    }
                };
                if parsed < 0 {
                    remove.push(index);
                } else {
                    meta.content_len = Some(parsed as u64);
                }
            }
            HeaderCode::Expect => {
                // 100-continue would stall on a non-responding backend;
                // drop it and let other Expect values pass through
                if hdr.value().eq_ignore_ascii_case("100-continue") {
                    remove.push(index);
                }
            }
            HeaderCode::Authorization => {
                if let Some((user, password)) = basic_auth_user(hdr.value()) {
                    req.user = Some(user);
                    req.password = Some(password);
                }
            }
            _ => {}
        }
    }

    if meta.rpc == Some(true) {
        let in_window = meta
            .content_len
            .is_some_and(|len| (RPC_MIN_LEN..RPC_MAX_LEN).contains(&len));
        if !in_window {
            meta.rpc = None;
        }
    }

    if !remove.is_empty() {
        let mut index = 0;
        req.headers.retain(|_| {
            let keep = !remove.contains(&index);
            index += 1;
            keep
        });
    }
    Ok(meta)
}

/// One pass over the response headers
fn scan_response_headers(
    resp: &mut HttpResponse,
    method: Method,
    rpc: &mut Option<bool>,
) -> ResponseMeta {
    let mut meta = ResponseMeta {
        skip: (100..200).contains(&resp.status) && resp.status != 101,
        no_cont: method == Method::Head
            || matches!(resp.status, 204 | 304)
            || (100..200).contains(&resp.status),
        ..Default::default()
    };
    if resp.status == 101 {
        meta.ws_state |= WS_RESP_101;
    }

    for hdr in resp.headers.iter() {
        match hdr.code {
            HeaderCode::Connection => {
                let value = hdr.value();
                if value.eq_ignore_ascii_case("close") {
                    meta.conn_close = true;
                } else if value.to_ascii_lowercase().contains("upgrade") {
                    meta.ws_state |= WS_RESP_CONN_UPGRADE;
                }
            }
            HeaderCode::Upgrade => {
                if hdr.value().eq_ignore_ascii_case("websocket") {
                    meta.ws_state |= WS_RESP_UPGRADE_WEBSOCKET;
                }
            }
            HeaderCode::TransferEncoding => {
                if hdr.value().eq_ignore_ascii_case("chunked") {
                    meta.chunked = true;
                    meta.no_cont = false;
                }
            }
            HeaderCode::ContentLength => {
                let parsed = hdr.value().trim().parse::<u64>().ok();
                match (*rpc, parsed) {
                    (Some(false), Some(len))
                        if (RPC_MIN_LEN..RPC_MAX_LEN).contains(&len) =>
                    {
                        // RPC_OUT_DATA: the advertised length is the
                        // channel size, not a body length; stream
                        // until EOF instead
                        meta.content_len = None;
                    }
                    (Some(false), _) => {
                        *rpc = None;
                        meta.content_len = parsed;
                    }
                    _ => meta.content_len = parsed,
                }
            }
            _ => {}
        }
    }
    meta
}

/// Rewrite a WebDAV Destination header to point at the backend
fn rewrite_destination(req: &mut HttpRequest, regular: &RegularBackend) {
    let value = match req.headers.value_of(HeaderCode::Destination) {
        Some(v) => v.to_string(),
        None => return,
    };
    let rest = if let Some(r) = value.strip_prefix("http://") {
        r
    } else if let Some(r) = value.strip_prefix("https://") {
        r
    } else {
        debug!("cannot parse Destination {:?}", value);
        return;
    };
    let path = match rest.find('/') {
        Some(pos) => &rest[pos..],
        None => "/",
    };
    let scheme = if regular.tls.is_some() { "https" } else { "http" };
    let line = format!("Destination: {}://{}{}", scheme, regular.label, path);
    if let Some(hdr) = req.headers.locate_mut(HeaderCode::Destination) {
        hdr.set_text(line);
    }
}

/// Rewrite Location and Content-Location headers that point at the
/// chosen backend or the virtual host
fn rewrite_location_headers(
    resp: &mut HttpResponse,
    vhost: Option<&str>,
    backend_label: &str,
    inbound_tls: bool,
) {
    let vhost = match vhost {
        Some(v) if !v.is_empty() => v,
        _ => return,
    };
    for hdr in resp.headers.iter_mut() {
        if !matches!(hdr.code, HeaderCode::Location | HeaderCode::ContentLocation) {
            continue;
        }
        let value = hdr.value().to_string();
        if let Some(rewritten) =
            rewrite_location(&value, vhost, Some(backend_label), inbound_tls)
        {
            let name = hdr.name().to_string();
            hdr.set_text(format!("{}: {}", name, rewritten));
        }
    }
}
