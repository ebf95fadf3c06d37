//! Locally generated replies.
//!
//! Error replies, redirect backends, ACME challenge files and static
//! error backends all answer without contacting an upstream. Generated
//! replies are HTTP/1.0: the client decides for itself whether to keep
//! the connection, and we always close after an error anyway.

use std::path::{Component, Path};

use crate::balancer::Backend;
use crate::error::GantryResult;
use crate::http::io::Conn;
use crate::http::url::encode_url_safe;
use crate::http::HttpRequest;
use crate::proxy::Listener;
use crate::rewrite::Template;

/// Reason phrase for the statuses we generate
pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn default_body(status: u16) -> String {
    format!(
        "<html><head><title>{s} {r}</title></head><body><h1>{s} {r}</h1></body></html>",
        s = status,
        r = reason(status)
    )
}

/// Serialize a full HTTP/1.0 reply
pub fn build_reply(status: u16, content_type: &str, extra_headers: &[String], body: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.0 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
        status,
        reason(status),
        content_type,
        body.len()
    );
    for header in extra_headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str("Expires: now\r\nPragma: no-cache\r\nCache-control: no-cache,no-store\r\n\r\n");
    out.push_str(body);
    out.into_bytes()
}

/// Write an error reply, using the listener's body override if any
pub async fn send_error(conn: &mut Conn, listener: &Listener, status: u16) -> GantryResult<()> {
    let body = listener
        .error_pages
        .get(&status)
        .cloned()
        .unwrap_or_else(|| default_body(status));
    conn.write_all(&build_reply(status, "text/html", &[], &body))
        .await?;
    conn.flush().await
}

/// Build a redirect reply from a redirect backend.
///
/// The target template expands `$N` from the most recent URL match;
/// when the template never referenced a capture the original request
/// target is appended for compatibility with prefix-style redirects.
/// The final URL is safe-encoded wholesale so crafted captures cannot
/// inject into the reply.
pub fn redirect_reply(
    req: &HttpRequest,
    status: u16,
    target: &Template,
    has_uri: bool,
) -> (u16, Vec<u8>) {
    let mut url = target.expand(req, None);
    if !has_uri {
        url.push_str(req.url());
    }
    let url = encode_url_safe(&url);

    let body = format!(
        "<html><head><title>Redirect</title></head><body><h1>Redirect</h1>\
         <p>You should go to <a href=\"{url}\">{url}</a></p></body></html>",
        url = url
    );
    let location = format!("Location: {}", url);
    (status, build_reply(status, "text/html", &[location], &body))
}

/// Serve an ACME http-01 challenge: the last path segment is a file
/// name under the challenge directory.
pub async fn acme_reply(req: &HttpRequest, root: &Path) -> (u16, Vec<u8>) {
    let path = req.path();
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() || !safe_segment(name) {
        return (404, build_reply(404, "text/html", &[], &default_body(404)));
    }

    match tokio::fs::read(root.join(name)).await {
        Ok(content) => {
            let body = String::from_utf8_lossy(&content).into_owned();
            (200, build_reply(200, "text/plain", &[], &body))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (404, build_reply(404, "text/html", &[], &default_body(404)))
        }
        Err(_) => (
            500,
            build_reply(500, "text/html", &[], &default_body(500)),
        ),
    }
}

/// A single path segment with no traversal potential
fn safe_segment(name: &str) -> bool {
    let path = Path::new(name);
    path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)))
}

/// Reply for a static error backend
pub fn static_error_reply(backend: &Backend) -> (u16, Vec<u8>) {
    match &backend.kind {
        crate::balancer::BackendKind::StaticError { status, body } => {
            (*status, build_reply(*status, "text/html", &[], body))
        }
        _ => (500, build_reply(500, "text/html", &[], &default_body(500))),
    }
}
