//! Request/response rewrite pipeline.
//!
//! Rewrite rules evaluate like matcher rules: when the condition holds
//! the op list runs in order, otherwise the else branch does. Rules
//! exist at listener and service level, for both directions.

pub mod template;

pub use template::Template;

use std::net::IpAddr;

use crate::http::{HttpRequest, HttpResponse};
use crate::matcher::{Condition, Pattern};

/// One rewrite operation
#[derive(Debug, Clone)]
pub enum RewriteOp {
    /// Expand and set a full `Name: value` header, replacing any header
    /// with the same name
    SetHeader(Template),
    /// Delete every header whose full line matches
    DeleteHeader(Pattern),
    /// Replace the whole request target
    SetUrl(Template),
    /// Replace the path component
    SetPath(Template),
    /// Replace the query component
    SetQuery(Template),
    /// Set one query parameter
    SetQueryParam { name: String, template: Template },
    /// Nested rule
    SubRule(Box<RewriteRule>),
}

/// A rewrite rule: condition, ops, optional else branch
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pub cond: Option<Condition>,
    pub ops: Vec<RewriteOp>,
    pub else_ops: Vec<RewriteOp>,
}

impl RewriteRule {
    /// Apply to a request (before forwarding)
    pub fn apply_request(&self, req: &mut HttpRequest, peer: IpAddr) {
        self.apply(req, None, peer);
    }

    /// Apply to a response (header ops target the response; URL ops are
    /// meaningless here and are skipped)
    pub fn apply_response(
        &self,
        req: &mut HttpRequest,
        resp: &mut HttpResponse,
        peer: IpAddr,
    ) {
        self.apply(req, Some(resp), peer);
    }

    fn apply(&self, req: &mut HttpRequest, mut resp: Option<&mut HttpResponse>, peer: IpAddr) {
        let branch = match &self.cond {
            Some(cond) => {
                if cond.matches(req, peer) {
                    &self.ops
                } else {
                    &self.else_ops
                }
            }
            None => &self.ops,
        };

        for op in branch {
            match op {
                RewriteOp::SetHeader(tmpl) => {
                    let line = tmpl.expand(req, resp.as_deref());
                    match resp.as_deref_mut() {
                        Some(r) => r.headers.set(line),
                        None => req.headers.set(line),
                    }
                }
                RewriteOp::DeleteHeader(pat) => {
                    let headers = match resp.as_deref_mut() {
                        Some(r) => &mut r.headers,
                        None => &mut req.headers,
                    };
                    headers.retain(|h| !pat.is_match(h.text()));
                }
                RewriteOp::SetUrl(tmpl) => {
                    if resp.is_none() {
                        let target = tmpl.expand_url(req, None);
                        req.set_url(target);
                    }
                }
                RewriteOp::SetPath(tmpl) => {
                    if resp.is_none() {
                        let path = tmpl.expand_url(req, None);
                        req.set_path(&path);
                    }
                }
                RewriteOp::SetQuery(tmpl) => {
                    if resp.is_none() {
                        let query = tmpl.expand_url(req, None);
                        req.set_query(&query);
                    }
                }
                RewriteOp::SetQueryParam { name, template } => {
                    if resp.is_none() {
                        let value = template.expand_url(req, None);
                        req.set_query_param(name, &value);
                    }
                }
                RewriteOp::SubRule(rule) => rule.apply(req, resp.as_deref_mut(), peer),
            }
        }
    }
}

/// Apply a list of rules in order
pub fn apply_request_rules(rules: &[RewriteRule], req: &mut HttpRequest, peer: IpAddr) {
    for rule in rules {
        rule.apply_request(req, peer);
    }
}

pub fn apply_response_rules(
    rules: &[RewriteRule],
    req: &mut HttpRequest,
    resp: &mut HttpResponse,
    peer: IpAddr,
) {
    for rule in rules {
        rule.apply_response(req, resp, peer);
    }
}

/// Decide whether a `Location`/`Content-Location` value should be
/// rewritten to point back through the proxy, and produce the new
/// value.
///
/// The value must be an absolute http(s) URL whose authority matches
/// either the chosen backend or the request's virtual host; the result
/// carries the original Host with the scheme of the inbound connection.
pub fn rewrite_location(
    value: &str,
    vhost: &str,
    backend_addr: Option<&str>,
    inbound_tls: bool,
) -> Option<String> {
    let (scheme, rest) = if let Some(r) = value.strip_prefix("http://") {
        ("http", r)
    } else if let Some(r) = value.strip_prefix("https://") {
        ("https", r)
    } else {
        return None;
    };

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };

    let matches_backend = backend_addr
        .map(|b| authority_eq(authority, b, scheme))
        .unwrap_or(false);
    let matches_vhost = authority_eq(authority, vhost, scheme);
    if !(matches_backend || matches_vhost) {
        return None;
    }

    let new_scheme = if inbound_tls { "https" } else { "http" };
    Some(format!("{}://{}{}", new_scheme, vhost, path))
}

/// Compare authorities, treating an absent port as the scheme default
fn authority_eq(a: &str, b: &str, scheme: &str) -> bool {
    let default_port = if scheme == "https" { "443" } else { "80" };
    let split = |s: &str| -> (String, String) {
        match s.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (h.to_ascii_lowercase(), p.to_string())
            }
            _ => (s.to_ascii_lowercase(), default_port.to_string()),
        }
    };
    split(a) == split(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{BoolOp, PatternKind};

    fn peer() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    fn request(line: &str) -> HttpRequest {
        HttpRequest::parse(line.to_string(), 4).unwrap()
    }

    fn url_cond(pattern: &str) -> Condition {
        Condition::Url(Pattern::compile(pattern, PatternKind::Regex, false).unwrap())
    }

    #[test]
    fn test_set_header_replaces_or_appends() {
        let rule = RewriteRule {
            cond: None,
            ops: vec![RewriteOp::SetHeader(Template::compile("X-Via: gantry"))],
            else_ops: vec![],
        };
        let mut req = request("GET / HTTP/1.1");
        req.headers.append("X-Via: old".to_string());
        rule.apply_request(&mut req, peer());
        assert_eq!(req.headers.value_of_name("X-Via"), Some("gantry"));
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_delete_header() {
        let rule = RewriteRule {
            cond: None,
            ops: vec![RewriteOp::DeleteHeader(
                Pattern::compile("(?i)^x-internal", PatternKind::Regex, false).unwrap(),
            )],
            else_ops: vec![],
        };
        let mut req = request("GET / HTTP/1.1");
        req.headers.append("X-Internal-Token: s".to_string());
        req.headers.append("Host: a".to_string());
        rule.apply_request(&mut req, peer());
        assert_eq!(req.headers.len(), 1);
    }

    #[test]
    fn test_conditional_with_else() {
        let rule = RewriteRule {
            cond: Some(url_cond("^/api/")),
            ops: vec![RewriteOp::SetHeader(Template::compile("X-Zone: api"))],
            else_ops: vec![RewriteOp::SetHeader(Template::compile("X-Zone: web"))],
        };

        let mut req = request("GET /api/v1 HTTP/1.1");
        rule.apply_request(&mut req, peer());
        assert_eq!(req.headers.value_of_name("X-Zone"), Some("api"));

        let mut req = request("GET /index HTTP/1.1");
        rule.apply_request(&mut req, peer());
        assert_eq!(req.headers.value_of_name("X-Zone"), Some("web"));
    }

    #[test]
    fn test_set_path_with_captures() {
        let rule = RewriteRule {
            cond: Some(url_cond("^/old/(.*)")),
            ops: vec![RewriteOp::SetPath(Template::compile("/new/$1"))],
            else_ops: vec![],
        };
        let mut req = request("GET /old/thing?q=1 HTTP/1.1");
        rule.apply_request(&mut req, peer());
        assert_eq!(req.url(), "/new/thing?q=1");
        assert_eq!(req.request_line(), "GET /new/thing?q=1 HTTP/1.1");
    }

    #[test]
    fn test_set_query_param() {
        let rule = RewriteRule {
            cond: None,
            ops: vec![RewriteOp::SetQueryParam {
                name: "src".to_string(),
                template: Template::compile("proxy"),
            }],
            else_ops: vec![],
        };
        let mut req = request("GET /p?a=1 HTTP/1.1");
        rule.apply_request(&mut req, peer());
        assert_eq!(req.url(), "/p?a=1&src=proxy");
    }

    #[test]
    fn test_sub_rule_recursion() {
        let inner = RewriteRule {
            cond: Some(url_cond("^/x")),
            ops: vec![RewriteOp::SetHeader(Template::compile("X-Inner: 1"))],
            else_ops: vec![],
        };
        let rule = RewriteRule {
            cond: Some(Condition::Bool {
                op: BoolOp::Not,
                children: vec![url_cond("^/skip")],
            }),
            ops: vec![RewriteOp::SubRule(Box::new(inner))],
            else_ops: vec![],
        };
        let mut req = request("GET /x HTTP/1.1");
        rule.apply_request(&mut req, peer());
        assert_eq!(req.headers.value_of_name("X-Inner"), Some("1"));
    }

    #[test]
    fn test_response_header_ops() {
        let rule = RewriteRule {
            cond: None,
            ops: vec![
                RewriteOp::SetHeader(Template::compile("Server: gantry")),
                RewriteOp::DeleteHeader(
                    Pattern::compile("(?i)^x-powered-by", PatternKind::Regex, false).unwrap(),
                ),
            ],
            else_ops: vec![],
        };
        let mut req = request("GET / HTTP/1.1");
        let mut resp = HttpResponse::parse("HTTP/1.1 200 OK".to_string()).unwrap();
        resp.headers.append("X-Powered-By: x".to_string());
        rule.apply_response(&mut req, &mut resp, peer());
        assert_eq!(resp.headers.value_of_name("Server"), Some("gantry"));
        assert!(resp.headers.value_of_name("X-Powered-By").is_none());
        // request untouched
        assert!(req.headers.value_of_name("Server").is_none());
    }

    #[test]
    fn test_rewrite_location_backend_match() {
        let out = rewrite_location(
            "http://10.0.0.5:8080/admin",
            "www.example.org",
            Some("10.0.0.5:8080"),
            true,
        )
        .unwrap();
        assert_eq!(out, "https://www.example.org/admin");
    }

    #[test]
    fn test_rewrite_location_vhost_match_scheme_follows_tls() {
        let out = rewrite_location(
            "https://www.example.org/login",
            "www.example.org",
            None,
            false,
        )
        .unwrap();
        assert_eq!(out, "http://www.example.org/login");
    }

    #[test]
    fn test_rewrite_location_default_ports() {
        let out = rewrite_location(
            "http://www.example.org:80/x",
            "www.example.org",
            None,
            false,
        )
        .unwrap();
        assert_eq!(out, "http://www.example.org/x");
    }

    #[test]
    fn test_rewrite_location_foreign_host_untouched() {
        assert!(rewrite_location(
            "http://elsewhere.net/x",
            "www.example.org",
            Some("10.0.0.5:8080"),
            false
        )
        .is_none());
        assert!(rewrite_location("/relative", "www.example.org", None, false).is_none());
    }
}
