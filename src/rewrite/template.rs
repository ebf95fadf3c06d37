//! Template strings for rewrite ops, redirects and string matches.
//!
//! Recognized escapes:
//! - `$N`     capture group N of the most recent successful match
//! - `$$`     a literal dollar sign
//! - `%{name}i` value of a request header
//! - `%{name}o` value of a response header
//!
//! Everything else is literal. When a template produces a URL, each
//! substituted value is percent-encoded through the redirect-safe set
//! so request-controlled captures cannot inject header or markup bytes.

use crate::http::url::encode_url_safe;
use crate::http::{HttpRequest, HttpResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frag {
    Lit(String),
    Group(usize),
    ReqHeader(String),
    RespHeader(String),
}

/// A compiled template
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    frags: Vec<Frag>,
}

impl Template {
    /// Compile a template string
    pub fn compile(raw: &str) -> Template {
        let mut frags = Vec::new();
        let mut lit = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '$' => match chars.peek() {
                    Some('$') => {
                        chars.next();
                        lit.push('$');
                    }
                    Some(d) if d.is_ascii_digit() => {
                        let mut n = 0usize;
                        while let Some(d) = chars.peek().copied().filter(|d| d.is_ascii_digit())
                        {
                            chars.next();
                            n = n * 10 + (d as usize - '0' as usize);
                        }
                        if !lit.is_empty() {
                            frags.push(Frag::Lit(std::mem::take(&mut lit)));
                        }
                        frags.push(Frag::Group(n));
                    }
                    _ => lit.push('$'),
                },
                '%' => {
                    // %{name}i or %{name}o
                    if chars.peek() == Some(&'{') {
                        let rest: String = chars.clone().collect();
                        if let Some(end) = rest.find('}') {
                            let side = rest.as_bytes().get(end + 1).copied();
                            if side == Some(b'i') || side == Some(b'o') {
                                let name = rest[1..end].to_string();
                                for _ in 0..end + 2 {
                                    chars.next();
                                }
                                if !lit.is_empty() {
                                    frags.push(Frag::Lit(std::mem::take(&mut lit)));
                                }
                                if side == Some(b'i') {
                                    frags.push(Frag::ReqHeader(name));
                                } else {
                                    frags.push(Frag::RespHeader(name));
                                }
                                continue;
                            }
                        }
                    }
                    lit.push('%');
                }
                c => lit.push(c),
            }
        }
        if !lit.is_empty() {
            frags.push(Frag::Lit(lit));
        }

        Template {
            raw: raw.to_string(),
            frags,
        }
    }

    /// Whether the template references any capture group
    pub fn uses_groups(&self) -> bool {
        self.frags.iter().any(|f| matches!(f, Frag::Group(_)))
    }

    /// The template source text
    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn expand_with<F: Fn(&str) -> String>(
        &self,
        req: &HttpRequest,
        resp: Option<&HttpResponse>,
        encode: F,
    ) -> String {
        let mut out = String::new();
        for frag in &self.frags {
            match frag {
                Frag::Lit(s) => out.push_str(s),
                Frag::Group(n) => match req.submatches.get(*n) {
                    Some(v) => out.push_str(&encode(v)),
                    // out-of-range groups keep their literal spelling
                    None => {
                        out.push('$');
                        out.push_str(&n.to_string());
                    }
                },
                Frag::ReqHeader(name) => {
                    if let Some(v) = req.headers.value_of_name(name) {
                        out.push_str(&encode(v));
                    }
                }
                Frag::RespHeader(name) => {
                    if let Some(v) = resp.and_then(|r| r.headers.value_of_name(name)) {
                        out.push_str(&encode(v));
                    }
                }
            }
        }
        out
    }

    /// Expand for header values and string matches
    pub fn expand(&self, req: &HttpRequest, resp: Option<&HttpResponse>) -> String {
        self.expand_with(req, resp, |s| s.to_string())
    }

    /// Expand for URL positions: substituted values are safe-encoded
    pub fn expand_url(&self, req: &HttpRequest, resp: Option<&HttpResponse>) -> String {
        self.expand_with(req, resp, |s| encode_url_safe(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Pattern, PatternKind};

    fn request_with_match(target: &str, pattern: &str) -> HttpRequest {
        let mut req =
            HttpRequest::parse(format!("GET {} HTTP/1.1", target), 0).unwrap();
        let pat = Pattern::compile(pattern, PatternKind::Regex, false).unwrap();
        let decoded = req.decoded_url().to_string();
        let caps = pat.captures(&decoded).unwrap();
        req.submatches.record(&caps);
        req
    }

    #[test]
    fn test_literal_and_groups() {
        let req = request_with_match("/foo/bar", "^/foo/(.*)");
        let t = Template::compile("https://example.com/$1");
        assert_eq!(t.expand(&req, None), "https://example.com/bar");
        assert!(t.uses_groups());
    }

    #[test]
    fn test_dollar_escapes() {
        let req = request_with_match("/x", "^/x");
        let t = Template::compile("price: $$5");
        assert_eq!(t.expand(&req, None), "price: $5");
        assert!(!t.uses_groups());

        // trailing dollar stays literal
        let t = Template::compile("end$");
        assert_eq!(t.expand(&req, None), "end$");
    }

    #[test]
    fn test_out_of_range_group_kept() {
        let req = request_with_match("/x", "^/x");
        let t = Template::compile("a$7b");
        assert_eq!(t.expand(&req, None), "a$7b");
    }

    #[test]
    fn test_request_header_substitution() {
        let mut req = request_with_match("/x", "^/x");
        req.headers.append("X-Tenant: acme".to_string());
        let t = Template::compile("tenant=%{X-Tenant}i");
        assert_eq!(t.expand(&req, None), "tenant=acme");

        // missing header expands to nothing
        let t = Template::compile("v=%{Missing}i!");
        assert_eq!(t.expand(&req, None), "v=!");
    }

    #[test]
    fn test_response_header_substitution() {
        let req = request_with_match("/x", "^/x");
        let mut resp = HttpResponse::parse("HTTP/1.1 200 OK".to_string()).unwrap();
        resp.headers.append("X-Served-By: b1".to_string());
        let t = Template::compile("by %{X-Served-By}o");
        assert_eq!(t.expand(&req, Some(&resp)), "by b1");
    }

    #[test]
    fn test_url_expansion_encodes_substitutions() {
        let req = request_with_match("/foo/a b", "^/foo/(.*)");
        let t = Template::compile("https://example.com/$1");
        // the literal part is untouched, the capture is encoded
        assert_eq!(t.expand_url(&req, None), "https://example.com/a%20b");
    }

    #[test]
    fn test_percent_without_brace_is_literal() {
        let req = request_with_match("/x", "^/x");
        let t = Template::compile("100% sure %{x");
        assert_eq!(t.expand(&req, None), "100% sure %{x");
    }
}
