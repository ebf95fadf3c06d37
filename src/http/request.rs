//! In-flight request and response state.

use super::headers::HeaderList;
use super::method::Method;
use super::url::{self, UrlError};

/// Why a request line was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLineError {
    /// Not of the form `METHOD target HTTP/1.x`
    Malformed,
    /// Method exists but is above the listener's allowed group
    MethodNotAllowed,
    /// The percent-decoded target contains a NUL byte
    BadUrl,
}

/// A parsed client request, in flight through the proxy.
///
/// The original request line and header text are kept verbatim; what is
/// written to the backend is byte-identical to what came in unless a
/// rewrite op touched it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Request line exactly as received
    pub line: String,
    /// Method spelling as received (used when rebuilding the line)
    method_text: String,
    pub method: Method,
    /// HTTP minor version (0 or 1)
    pub version: u8,
    /// Effective request target in wire form
    url: String,
    /// Percent-decoded target, used for all matching
    decoded: String,
    /// Set once a rewrite op modified the target
    rewritten: bool,
    pub headers: HeaderList,
    /// User name extracted from a Basic Authorization header
    pub user: Option<String>,
    /// Password from the same header, kept only for basic-auth matching
    pub password: Option<String>,
    /// Capture groups of the most recent successful pattern match
    pub submatches: Submatches,
}

impl HttpRequest {
    /// Parse a request line. `max_group` is the listener's `xhttp`
    /// method-group ceiling.
    pub fn parse(line: String, max_group: u8) -> Result<Self, RequestLineError> {
        let mut it = line.split_ascii_whitespace();
        let method_text = it.next().ok_or(RequestLineError::Malformed)?;
        let target = it.next().ok_or(RequestLineError::Malformed)?;
        let version = it.next().ok_or(RequestLineError::Malformed)?;
        if it.next().is_some() {
            return Err(RequestLineError::Malformed);
        }

        let (method, group) =
            Method::lookup(method_text).ok_or(RequestLineError::Malformed)?;
        if group > max_group {
            return Err(RequestLineError::MethodNotAllowed);
        }

        let minor = match version {
            "HTTP/1.0" => 0,
            "HTTP/1.1" => 1,
            _ => return Err(RequestLineError::Malformed),
        };

        let decoded = match url::decode_url(target) {
            Ok(d) => d,
            Err(UrlError::EmbeddedNul) => return Err(RequestLineError::BadUrl),
        };

        Ok(HttpRequest {
            method_text: method_text.to_string(),
            method,
            version: minor,
            url: target.to_string(),
            decoded,
            rewritten: false,
            line,
            headers: HeaderList::new(),
            user: None,
            password: None,
            submatches: Submatches::default(),
        })
    }

    /// Current request target in wire form
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Percent-decoded request target
    pub fn decoded_url(&self) -> &str {
        &self.decoded
    }

    /// Decoded path component
    pub fn path(&self) -> &str {
        url::split_url(&self.decoded).0
    }

    /// Decoded query component (without the `?`)
    pub fn query(&self) -> &str {
        url::split_url(&self.decoded).1
    }

    /// Replace the whole request target
    pub fn set_url(&mut self, target: String) {
        self.decoded = url::decode_url(&target).unwrap_or_else(|_| target.clone());
        self.url = target;
        self.rewritten = true;
    }

    /// Replace the path, keeping the query
    pub fn set_path(&mut self, path: &str) {
        let query = url::split_url(&self.url).1.to_string();
        let target = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query)
        };
        self.set_url(target);
    }

    /// Replace the query, keeping the path
    pub fn set_query(&mut self, query: &str) {
        let path = url::split_url(&self.url).0.to_string();
        let target = if query.is_empty() {
            path
        } else {
            format!("{}?{}", path, query)
        };
        self.set_url(target);
    }

    /// Set one query parameter, adding it if absent
    pub fn set_query_param(&mut self, name: &str, value: &str) {
        let query = url::set_query_param(url::split_url(&self.url).1, name, value);
        self.set_query(&query);
    }

    /// The request line to put on the wire: the original bytes unless a
    /// rewrite changed the target.
    pub fn request_line(&self) -> String {
        if self.rewritten {
            format!("{} {} HTTP/1.{}", self.method_text, self.url, self.version)
        } else {
            self.line.clone()
        }
    }

    /// Host header value
    pub fn host(&self) -> Option<&str> {
        self.headers.host()
    }

    /// Value of the named cookie, searched across all Cookie headers
    pub fn cookie(&self, name: &str) -> Option<String> {
        for hdr in self.headers.iter() {
            if !hdr.name().eq_ignore_ascii_case("cookie") {
                continue;
            }
            for piece in hdr.value().split(';') {
                let piece = piece.trim();
                if let Some((n, v)) = piece.split_once('=') {
                    if n.trim() == name {
                        return Some(v.trim().to_string());
                    }
                }
            }
        }
        None
    }
}

/// Extract the user name from a `Basic` Authorization header value.
pub fn basic_auth_user(value: &str) -> Option<(String, String)> {
    use base64::Engine;

    let rest = value.strip_prefix("Basic").or_else(|| {
        if value.len() >= 5 && value[..5].eq_ignore_ascii_case("basic") {
            Some(&value[5..])
        } else {
            None
        }
    })?;
    let token = rest.trim().trim_matches('"');
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// A parsed backend response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status line exactly as received
    pub line: String,
    /// HTTP minor version (0 or 1)
    pub version: u8,
    pub status: u16,
    pub headers: HeaderList,
}

impl HttpResponse {
    /// Parse a status line like `HTTP/1.1 200 OK`
    pub fn parse(line: String) -> Option<Self> {
        let rest = line.strip_prefix("HTTP/1.")?;
        let minor = match rest.as_bytes().first()? {
            b'0' => 0,
            b'1' => 1,
            _ => return None,
        };
        let rest = rest[1..].trim_start();
        let digits = rest.split_ascii_whitespace().next()?;
        if digits.len() != 3 {
            return None;
        }
        let status: u16 = digits.parse().ok()?;

        Some(HttpResponse {
            line,
            version: minor,
            status,
            headers: HeaderList::new(),
        })
    }

    /// Build a synthetic response (used by terminal backends in tests)
    pub fn synthetic(status: u16, reason: &str) -> Self {
        HttpResponse {
            line: format!("HTTP/1.0 {} {}", status, reason),
            version: 0,
            status,
            headers: HeaderList::new(),
        }
    }
}

/// Capture groups of the most recent successful regex match against the
/// current request. Group 0 is the whole match. Later matches replace
/// earlier ones, so `$N` in templates always refers to the innermost
/// successful match in scope.
#[derive(Debug, Clone, Default)]
pub struct Submatches {
    groups: Vec<Option<String>>,
}

impl Submatches {
    /// Record the capture groups of a successful match
    pub fn record(&mut self, caps: &regex::Captures<'_>) {
        self.groups = (0..caps.len())
            .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
            .collect();
    }

    /// The Nth capture group, if it participated in the match
    pub fn get(&self, n: usize) -> Option<&str> {
        self.groups.get(n).and_then(|g| g.as_deref())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
