//! Ordered header list with classification.
//!
//! Headers are kept as their verbatim wire text so the forwarding path
//! reproduces them byte for byte. Each entry carries a classification
//! code from a fixed table; everything the proxy does not care about is
//! `Other`, and lines that do not even look like a header are `Illegal`
//! and get dropped at append time.

use regex::Regex;

/// Classification codes for headers the proxy inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCode {
    TransferEncoding,
    ContentLength,
    Connection,
    Location,
    ContentLocation,
    Host,
    Referer,
    UserAgent,
    Destination,
    Expect,
    Upgrade,
    Authorization,
    Other,
    Illegal,
}

static CLASSIFY: &[(&str, HeaderCode)] = &[
    ("Transfer-encoding", HeaderCode::TransferEncoding),
    ("Content-length", HeaderCode::ContentLength),
    ("Connection", HeaderCode::Connection),
    ("Location", HeaderCode::Location),
    ("Content-location", HeaderCode::ContentLocation),
    ("Host", HeaderCode::Host),
    ("Referer", HeaderCode::Referer),
    ("User-agent", HeaderCode::UserAgent),
    ("Destination", HeaderCode::Destination),
    ("Expect", HeaderCode::Expect),
    ("Upgrade", HeaderCode::Upgrade),
    ("Authorization", HeaderCode::Authorization),
];

fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9'
        | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+'
        | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

/// One header line in wire form
#[derive(Debug, Clone)]
pub struct Header {
    text: String,
    name_len: usize,
    pub code: HeaderCode,
}

impl Header {
    /// Classify a raw header line
    pub fn new(text: String) -> Self {
        let (code, name_len) = classify(&text);
        Header {
            text,
            name_len,
            code,
        }
    }

    /// The full `Name: value` line as received
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Header name
    pub fn name(&self) -> &str {
        &self.text[..self.name_len]
    }

    /// Header value with surrounding whitespace stripped
    pub fn value(&self) -> &str {
        self.text[self.name_len + 1..].trim()
    }

    /// Replace the wire text, reclassifying
    pub fn set_text(&mut self, text: String) {
        let (code, name_len) = classify(&text);
        self.text = text;
        self.code = code;
        self.name_len = name_len;
    }
}

fn classify(text: &str) -> (HeaderCode, usize) {
    let colon = match text.find(':') {
        Some(pos) if pos > 0 => pos,
        _ => return (HeaderCode::Illegal, 0),
    };
    let name = &text[..colon];
    if !name.bytes().all(is_token_char) {
        return (HeaderCode::Illegal, 0);
    }
    for (known, code) in CLASSIFY {
        if known.eq_ignore_ascii_case(name) {
            return (*code, colon);
        }
    }
    (HeaderCode::Other, colon)
}

/// Ordered list of headers; order is preserved through forwarding
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    headers: Vec<Header>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw line; illegal lines are dropped and reported
    pub fn append(&mut self, text: String) -> HeaderCode {
        let hdr = Header::new(text);
        let code = hdr.code;
        if code != HeaderCode::Illegal {
            self.headers.push(hdr);
        }
        code
    }

    /// Append or replace: if a header with the same name exists, its
    /// text is replaced in place, otherwise the line is appended.
    pub fn set(&mut self, text: String) {
        let probe = Header::new(text.clone());
        if probe.code == HeaderCode::Illegal {
            return;
        }
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|h| h.name().eq_ignore_ascii_case(probe.name()))
        {
            existing.set_text(text);
        } else {
            self.headers.push(probe);
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.headers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.headers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// First header with the given classification code
    pub fn locate(&self, code: HeaderCode) -> Option<&Header> {
        self.headers.iter().find(|h| h.code == code)
    }

    pub fn locate_mut(&mut self, code: HeaderCode) -> Option<&mut Header> {
        self.headers.iter_mut().find(|h| h.code == code)
    }

    /// Value of the first header with the given code
    pub fn value_of(&self, code: HeaderCode) -> Option<&str> {
        self.locate(code).map(|h| h.value())
    }

    /// Value of the first header with the given name (case-insensitive)
    pub fn value_of_name(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name().eq_ignore_ascii_case(name))
            .map(|h| h.value())
    }

    /// Remove every header matching the predicate
    pub fn retain<F: FnMut(&Header) -> bool>(&mut self, f: F) {
        self.headers.retain(f);
    }

    /// Remove every header whose full line matches the regex
    pub fn filter(&mut self, pattern: &Regex) {
        self.headers.retain(|h| !pattern.is_match(h.text()));
    }

    /// The Host header value, if present
    pub fn host(&self) -> Option<&str> {
        self.value_of(HeaderCode::Host)
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}
