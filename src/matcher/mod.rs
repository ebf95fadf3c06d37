//! Request matching engine.
//!
//! A service is chosen by the first condition tree that evaluates to
//! true for the request. The tree root is an implicit AND; boolean
//! nodes short-circuit. Every successful regex leaf records its capture
//! groups on the request for later `$N` template expansion.

pub mod acl;
pub mod htpasswd;
pub mod pattern;

pub use acl::{Acl, Cidr};
pub use htpasswd::PasswdFile;
pub use pattern::{Pattern, PatternKind};

use std::net::IpAddr;

use crate::http::url::{parse_query, query_param};
use crate::http::HttpRequest;
use crate::rewrite::template::Template;

/// Boolean combinators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// One node of a condition tree
#[derive(Debug, Clone)]
pub enum Condition {
    /// Combinator over child conditions. `Not` uses only the first child.
    Bool { op: BoolOp, children: Vec<Condition> },
    /// Peer address is in the ACL
    Acl(Acl),
    /// Pattern over the full decoded request target
    Url(Pattern),
    /// Pattern over the decoded path component
    Path(Pattern),
    /// Pattern over the decoded query component
    Query(Pattern),
    /// Pattern over the value of a named query parameter
    QueryParam { name: String, pattern: Pattern },
    /// Pattern over any full `Name: value` header line
    Header(Pattern),
    /// Pattern over the Host header value
    Host(Pattern),
    /// Basic-auth credentials verified against a password file
    BasicAuth(PasswdFile),
    /// Pattern over an expanded template string
    StringMatch { template: Template, pattern: Pattern },
}

impl Condition {
    /// Evaluate against a request. Successful regex matches update the
    /// request's submatch store.
    pub fn matches(&self, req: &mut HttpRequest, peer: IpAddr) -> bool {
        match self {
            Condition::Bool { op, children } => match op {
                BoolOp::And => children.iter().all(|c| c.matches(req, peer)),
                BoolOp::Or => children.iter().any(|c| c.matches(req, peer)),
                BoolOp::Not => children
                    .first()
                    .map(|c| !c.matches(req, peer))
                    .unwrap_or(true),
            },
            Condition::Acl(acl) => acl.matches(peer),
            Condition::Url(pat) => {
                let text = req.decoded_url().to_string();
                capture(req, pat, &text)
            }
            Condition::Path(pat) => {
                let text = req.path().to_string();
                capture(req, pat, &text)
            }
            Condition::Query(pat) => {
                let text = req.query().to_string();
                capture(req, pat, &text)
            }
            Condition::QueryParam { name, pattern } => {
                let pairs = parse_query(req.query());
                match query_param(&pairs, name) {
                    Some(value) => {
                        let value = value.to_string();
                        capture(req, pattern, &value)
                    }
                    None => false,
                }
            }
            Condition::Header(pat) => {
                let line = req
                    .headers
                    .iter()
                    .find(|h| pat.is_match(h.text()))
                    .map(|h| h.text().to_string());
                match line {
                    Some(line) => capture(req, pat, &line),
                    None => false,
                }
            }
            Condition::Host(pat) => {
                let host = req.host().map(str::to_string);
                match host {
                    Some(host) => capture(req, pat, &host),
                    None => false,
                }
            }
            Condition::BasicAuth(file) => match (&req.user, &req.password) {
                (Some(user), Some(pass)) => file.verify(user, pass),
                _ => false,
            },
            Condition::StringMatch { template, pattern } => {
                let text = template.expand(req, None);
                capture(req, pattern, &text)
            }
        }
    }
}

/// Run the pattern, recording capture groups on success
fn capture(req: &mut HttpRequest, pat: &Pattern, text: &str) -> bool {
    match pat.captures(text) {
        Some(caps) => {
            req.submatches.record(&caps);
            true
        }
        None => false,
    }
}

/// Expand a pattern file into an OR group: one leaf per non-blank,
/// non-comment line, each compiled with the given kind.
pub fn conditions_from_file<F>(
    content: &str,
    mut make: F,
) -> crate::error::GantryResult<Condition>
where
    F: FnMut(&str) -> crate::error::GantryResult<Condition>,
{
    let mut children = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        children.push(make(line)?);
    }
    Ok(Condition::Bool {
        op: BoolOp::Or,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> IpAddr {
        "192.0.2.7".parse().unwrap()
    }

    fn request(line: &str) -> HttpRequest {
        HttpRequest::parse(line.to_string(), 4).unwrap()
    }

    fn url_cond(pattern: &str) -> Condition {
        Condition::Url(Pattern::compile(pattern, PatternKind::Regex, false).unwrap())
    }

    #[test]
    fn test_url_match_records_groups() {
        let mut req = request("GET /foo/bar HTTP/1.1");
        assert!(url_cond("^/foo/(.*)").matches(&mut req, peer()));
        assert_eq!(req.submatches.get(1), Some("bar"));
    }

    #[test]
    fn test_path_and_query() {
        let mut req = request("GET /app/login?next=%2Fhome HTTP/1.1");
        let path = Condition::Path(
            Pattern::compile("^/app/", PatternKind::Regex, false).unwrap(),
        );
        assert!(path.matches(&mut req, peer()));

        let query = Condition::Query(
            Pattern::compile("next=", PatternKind::Contain, false).unwrap(),
        );
        assert!(query.matches(&mut req, peer()));

        let qp = Condition::QueryParam {
            name: "next".to_string(),
            pattern: Pattern::compile("^/home$", PatternKind::Regex, false).unwrap(),
        };
        assert!(qp.matches(&mut req, peer()));

        let qp_missing = Condition::QueryParam {
            name: "user".to_string(),
            pattern: Pattern::compile(".*", PatternKind::Regex, false).unwrap(),
        };
        assert!(!qp_missing.matches(&mut req, peer()));
    }

    #[test]
    fn test_header_match_full_line() {
        let mut req = request("GET / HTTP/1.1");
        req.headers.append("X-Debug: on".to_string());
        let cond = Condition::Header(
            Pattern::compile("(?i)^x-debug: *on$", PatternKind::Regex, false).unwrap(),
        );
        assert!(cond.matches(&mut req, peer()));
    }

    #[test]
    fn test_host_condition() {
        let mut req = request("GET / HTTP/1.1");
        req.headers.append("Host: www.example.org".to_string());
        let exact = Condition::Host(
            Pattern::compile_host("example.org", PatternKind::Exact, true).unwrap(),
        );
        assert!(!exact.matches(&mut req, peer()));
        let prefix = Condition::Host(
            Pattern::compile_host("www.", PatternKind::Prefix, true).unwrap(),
        );
        assert!(prefix.matches(&mut req, peer()));
    }

    #[test]
    fn test_bool_short_circuit() {
        let mut req = request("GET /a HTTP/1.1");
        let cond = Condition::Bool {
            op: BoolOp::Or,
            children: vec![url_cond("^/a"), url_cond("^/never")],
        };
        assert!(cond.matches(&mut req, peer()));

        let cond = Condition::Bool {
            op: BoolOp::Not,
            children: vec![url_cond("^/b")],
        };
        assert!(cond.matches(&mut req, peer()));

        let cond = Condition::Bool {
            op: BoolOp::And,
            children: vec![url_cond("^/a"), url_cond("^/b")],
        };
        assert!(!cond.matches(&mut req, peer()));
    }

    #[test]
    fn test_acl_condition() {
        let mut req = request("GET / HTTP/1.1");
        let acl = Acl::new(&["192.0.2.0/24".to_string()]).unwrap();
        assert!(Condition::Acl(acl).matches(&mut req, peer()));
        let acl = Acl::new(&["10.0.0.0/8".to_string()]).unwrap();
        assert!(!Condition::Acl(acl).matches(&mut req, peer()));
    }

    #[test]
    fn test_basic_auth_condition() {
        let mut req = request("GET / HTTP/1.1");
        let file = PasswdFile::parse("alice:pw\n").unwrap();
        let cond = Condition::BasicAuth(file);
        assert!(!cond.matches(&mut req, peer()));

        req.user = Some("alice".to_string());
        req.password = Some("pw".to_string());
        assert!(cond.matches(&mut req, peer()));

        req.password = Some("bad".to_string());
        assert!(!cond.matches(&mut req, peer()));
    }

    #[test]
    fn test_string_match_condition() {
        let mut req = request("GET / HTTP/1.1");
        req.headers.append("X-Mode: fast".to_string());
        let cond = Condition::StringMatch {
            template: Template::compile("%{X-Mode}i"),
            pattern: Pattern::compile("^fast$", PatternKind::Regex, false).unwrap(),
        };
        assert!(cond.matches(&mut req, peer()));
    }

    #[test]
    fn test_conditions_from_file() {
        let content = "# hosts\n/one\n\n/two\n";
        let cond = conditions_from_file(content, |line| {
            Ok(Condition::Url(
                Pattern::compile(line, PatternKind::Prefix, false).unwrap(),
            ))
        })
        .unwrap();
        let mut req = request("GET /two/x HTTP/1.1");
        assert!(cond.matches(&mut req, peer()));
        let mut req = request("GET /three HTTP/1.1");
        assert!(!cond.matches(&mut req, peer()));
    }
}
