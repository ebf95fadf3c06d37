//! HTTP method table.
//!
//! Every method carries a group level; a listener only accepts methods
//! whose group does not exceed its configured `xhttp` level:
//! 0 = basic HTTP, 1 = +PUT/PATCH/DELETE, 2 = +WebDAV,
//! 3 = +Microsoft WebDAV extensions, 4 = +RPC streaming verbs.

/// Recognized HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Patch,
    Delete,
    Lock,
    Unlock,
    Propfind,
    Proppatch,
    Search,
    Mkcol,
    Move,
    Copy,
    Options,
    Trace,
    Mkactivity,
    Checkout,
    Merge,
    Report,
    Subscribe,
    Unsubscribe,
    Bproppatch,
    Poll,
    Bmove,
    Bcopy,
    Bdelete,
    Bpropfind,
    Notify,
    Connect,
    RpcInData,
    RpcOutData,
}

static METHODS: &[(&str, Method, u8)] = &[
    ("GET", Method::Get, 0),
    ("POST", Method::Post, 0),
    ("HEAD", Method::Head, 0),
    ("PUT", Method::Put, 1),
    ("PATCH", Method::Patch, 1),
    ("DELETE", Method::Delete, 1),
    ("LOCK", Method::Lock, 2),
    ("UNLOCK", Method::Unlock, 2),
    ("PROPFIND", Method::Propfind, 2),
    ("PROPPATCH", Method::Proppatch, 2),
    ("SEARCH", Method::Search, 2),
    ("MKCOL", Method::Mkcol, 2),
    ("MOVE", Method::Move, 2),
    ("COPY", Method::Copy, 2),
    ("OPTIONS", Method::Options, 2),
    ("TRACE", Method::Trace, 2),
    ("MKACTIVITY", Method::Mkactivity, 2),
    ("CHECKOUT", Method::Checkout, 2),
    ("MERGE", Method::Merge, 2),
    ("REPORT", Method::Report, 2),
    ("SUBSCRIBE", Method::Subscribe, 3),
    ("UNSUBSCRIBE", Method::Unsubscribe, 3),
    ("BPROPPATCH", Method::Bproppatch, 3),
    ("POLL", Method::Poll, 3),
    ("BMOVE", Method::Bmove, 3),
    ("BCOPY", Method::Bcopy, 3),
    ("BDELETE", Method::Bdelete, 3),
    ("BPROPFIND", Method::Bpropfind, 3),
    ("NOTIFY", Method::Notify, 3),
    ("CONNECT", Method::Connect, 3),
    ("RPC_IN_DATA", Method::RpcInData, 4),
    ("RPC_OUT_DATA", Method::RpcOutData, 4),
];

impl Method {
    /// Look up a method by name (case-insensitive). Returns the method
    /// and its group level.
    pub fn lookup(name: &str) -> Option<(Method, u8)> {
        METHODS
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, m, g)| (m, g))
    }

    /// Canonical spelling of the method
    pub fn as_str(&self) -> &'static str {
        METHODS
            .iter()
            .find(|(_, m, _)| m == self)
            .map(|&(n, _, _)| n)
            .unwrap_or("GET")
    }

    /// Whether this is one of the RPC streaming verbs
    pub fn is_rpc(&self) -> bool {
        matches!(self, Method::RpcInData | Method::RpcOutData)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
