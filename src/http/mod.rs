//! HTTP/1.x wire handling: methods, headers, request state, framing I/O.
//!
//! The proxy deliberately works at the line/byte level instead of going
//! through a full HTTP library: the forwarding path must preserve the
//! request line and header order verbatim, and the framing modes
//! (content-length, chunked, RPC-until-EOF, WebSocket tunneling) need
//! direct control over the underlying streams.

pub mod body;
pub mod headers;
pub mod io;
pub mod method;
pub mod request;
pub mod url;

pub use headers::{Header, HeaderCode, HeaderList};
pub use method::Method;
pub use request::{HttpRequest, HttpResponse};
