//! Access-log formats.
//!
//! A format string is compiled once at startup into literal and field
//! fragments. Recognized fields:
//!
//! | escape | meaning |
//! |---|---|
//! | `%a` | client address (anonymized when configured) |
//! | `%r` | request line |
//! | `%s` | response status |
//! | `%b` | response body bytes, `-` when zero |
//! | `%t` | request timestamp `[day/mon/year:H:M:S zone]` |
//! | `%D` | duration in microseconds |
//! | `%T` | duration in seconds (three decimals) |
//! | `%h` | Host header value |
//! | `%v` | listener name |
//! | `%u` | basic-auth user, `-` when absent |
//! | `%p` | process id |
//! | `%{name}i` | request header |
//! | `%{name}o` | response header |
//! | `%{service}N` | chosen service name |
//! | `%{backend}N` | chosen backend label |
//! | `%%` | literal percent |

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::{GantryError, GantryResult};
use crate::http::{HttpRequest, HttpResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frag {
    Lit(String),
    ClientAddr,
    RequestLine,
    Status,
    Bytes,
    Timestamp,
    DurationMicros,
    DurationSecs,
    Host,
    ListenerName,
    User,
    Pid,
    ReqHeader(String),
    RespHeader(String),
    ServiceName,
    BackendName,
}

/// A compiled access-log format
#[derive(Debug, Clone)]
pub struct LogFormat {
    frags: Vec<Frag>,
}

/// Everything a log line can draw from
pub struct LogContext<'a> {
    pub peer: IpAddr,
    pub anonymize: bool,
    pub request: Option<&'a HttpRequest>,
    pub response: Option<&'a HttpResponse>,
    pub status: u16,
    pub bytes: u64,
    pub start: DateTime<Local>,
    pub duration: Duration,
    pub listener: &'a str,
    pub service: Option<&'a str>,
    pub backend: Option<&'a str>,
}

impl LogFormat {
    /// Compile a format string
    pub fn compile(format: &str) -> GantryResult<LogFormat> {
        let mut frags = Vec::new();
        let mut lit = String::new();
        let mut chars = format.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                lit.push(c);
                continue;
            }
            let spec = chars
                .next()
                .ok_or_else(|| GantryError::config("log format ends in %"))?;
            let frag = match spec {
                '%' => {
                    lit.push('%');
                    continue;
                }
                'a' => Frag::ClientAddr,
                'r' => Frag::RequestLine,
                's' => Frag::Status,
                'b' => Frag::Bytes,
                't' => Frag::Timestamp,
                'D' => Frag::DurationMicros,
                'T' => Frag::DurationSecs,
                'h' => Frag::Host,
                'v' => Frag::ListenerName,
                'u' => Frag::User,
                'p' => Frag::Pid,
                '{' => {
                    let mut name = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        name.push(c);
                    }
                    match chars.next() {
                        Some('i') => Frag::ReqHeader(name),
                        Some('o') => Frag::RespHeader(name),
                        Some('N') if name == "service" => Frag::ServiceName,
                        Some('N') if name == "backend" => Frag::BackendName,
                        other => {
                            return Err(GantryError::config(format!(
                                "bad log field %{{{}}}{:?}",
                                name, other
                            )))
                        }
                    }
                }
                other => {
                    return Err(GantryError::config(format!(
                        "unknown log escape %{}",
                        other
                    )))
                }
            };
            if !lit.is_empty() {
                frags.push(Frag::Lit(std::mem::take(&mut lit)));
            }
            frags.push(frag);
        }
        if !lit.is_empty() {
            frags.push(Frag::Lit(lit));
        }
        Ok(LogFormat { frags })
    }

    /// Look up a built-in format by name, or compile the string as a
    /// custom format.
    pub fn named(name: &str) -> GantryResult<LogFormat> {
        let format = match name {
            "common" => r#"%a - %u [%t] "%r" %s %b"#,
            "combined" => r#"%a - %u [%t] "%r" %s %b "%{Referer}i" "%{User-agent}i""#,
            "extended" => {
                r#"%h %a - %u [%t] "%r" %s %b "%{Referer}i" "%{User-agent}i""#
            }
            "detailed" => {
                r#"%h %a - %u [%t] "%r" %s %b "%{Referer}i" "%{User-agent}i" (%{service}N -> %{backend}N) %T sec"#
            }
            custom => custom,
        };
        Self::compile(format)
    }

    /// Render one line
    pub fn render(&self, ctx: &LogContext<'_>) -> String {
        let mut out = String::new();
        for frag in &self.frags {
            match frag {
                Frag::Lit(s) => out.push_str(s),
                Frag::ClientAddr => out.push_str(&format_addr(ctx.peer, ctx.anonymize)),
                Frag::RequestLine => {
                    if let Some(req) = ctx.request {
                        out.push_str(&req.line);
                    }
                }
                Frag::Status => out.push_str(&format!("{:03}", ctx.status)),
                Frag::Bytes => {
                    if ctx.bytes == 0 {
                        out.push('-');
                    } else {
                        out.push_str(&ctx.bytes.to_string());
                    }
                }
                Frag::Timestamp => {
                    out.push_str(&ctx.start.format("%d/%b/%Y:%H:%M:%S %z").to_string())
                }
                Frag::DurationMicros => {
                    out.push_str(&ctx.duration.as_micros().to_string())
                }
                Frag::DurationSecs => {
                    out.push_str(&format!("{:.3}", ctx.duration.as_secs_f64()))
                }
                Frag::Host => {
                    match ctx.request.and_then(|r| r.host()) {
                        Some(host) => out.push_str(host),
                        None => out.push('-'),
                    }
                }
                Frag::ListenerName => out.push_str(ctx.listener),
                Frag::User => match ctx.request.and_then(|r| r.user.as_deref()) {
                    Some(user) => out.push_str(user),
                    None => out.push('-'),
                },
                Frag::Pid => out.push_str(&std::process::id().to_string()),
                Frag::ReqHeader(name) => {
                    if let Some(v) = ctx.request.and_then(|r| r.headers.value_of_name(name)) {
                        out.push_str(v);
                    }
                }
                Frag::RespHeader(name) => {
                    if let Some(v) = ctx.response.and_then(|r| r.headers.value_of_name(name))
                    {
                        out.push_str(v);
                    }
                }
                Frag::ServiceName => out.push_str(ctx.service.unwrap_or("-")),
                Frag::BackendName => out.push_str(ctx.backend.unwrap_or("-")),
            }
        }
        out
    }
}

/// Client address for the log line, optionally anonymized by zeroing
/// the last octet (IPv4) or group (IPv6).
fn format_addr(ip: IpAddr, anonymize: bool) -> String {
    if !anonymize {
        return ip.to_string();
    }
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let mut segments = v6.segments();
            segments[7] = 0;
            std::net::Ipv6Addr::from(segments).to_string()
        }
    }
}

/// Whether a status is silenced by a service's suppression mask
/// (bit N covers class N, 1xx..5xx).
pub fn suppressed(mask: u8, status: u16) -> bool {
    let class = (status / 100) as u8;
    (1..=5).contains(&class) && mask & (1 << class) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context<'a>(req: &'a HttpRequest) -> LogContext<'a> {
        LogContext {
            peer: "192.0.2.17".parse().unwrap(),
            anonymize: false,
            request: Some(req),
            response: None,
            status: 200,
            bytes: 1234,
            start: Local.with_ymd_and_hms(2024, 3, 5, 10, 30, 0).unwrap(),
            duration: Duration::from_millis(42),
            listener: "main",
            service: Some("api"),
            backend: Some("10.0.0.1:8000"),
        }
    }

    fn request() -> HttpRequest {
        let mut req =
            HttpRequest::parse("GET /x HTTP/1.1".to_string(), 0).unwrap();
        req.headers.append("Host: example.org".to_string());
        req.headers.append("User-agent: curl/8".to_string());
        req
    }

    #[test]
    fn test_common_format() {
        let req = request();
        let line = LogFormat::named("common").unwrap().render(&context(&req));
        assert!(line.starts_with("192.0.2.17 - - ["));
        assert!(line.contains("\"GET /x HTTP/1.1\" 200 1234"));
    }

    #[test]
    fn test_detailed_format() {
        let req = request();
        let line = LogFormat::named("detailed").unwrap().render(&context(&req));
        assert!(line.starts_with("example.org 192.0.2.17"));
        assert!(line.contains("(api -> 10.0.0.1:8000)"));
        assert!(line.contains("0.042 sec"));
        assert!(line.contains("\"curl/8\""));
    }

    #[test]
    fn test_custom_format_with_headers() {
        let req = request();
        let fmt = LogFormat::compile("%{User-agent}i|%s|%D").unwrap();
        let line = fmt.render(&context(&req));
        assert_eq!(line, "curl/8|200|42000");
    }

    #[test]
    fn test_percent_escape_and_errors() {
        let req = request();
        let fmt = LogFormat::compile("100%% %s").unwrap();
        assert_eq!(fmt.render(&context(&req)), "100% 200");

        assert!(LogFormat::compile("%q").is_err());
        assert!(LogFormat::compile("trailing %").is_err());
        assert!(LogFormat::compile("%{name}x").is_err());
    }

    #[test]
    fn test_anonymized_addresses() {
        assert_eq!(
            format_addr("203.0.113.77".parse().unwrap(), true),
            "203.0.113.0"
        );
        assert_eq!(
            format_addr("2001:db8::dead:beef".parse().unwrap(), true),
            "2001:db8::dead:0"
        );
        assert_eq!(
            format_addr("203.0.113.77".parse().unwrap(), false),
            "203.0.113.77"
        );
    }

    #[test]
    fn test_zero_bytes_dash() {
        let req = request();
        let mut ctx = context(&req);
        ctx.bytes = 0;
        let line = LogFormat::compile("%b").unwrap().render(&ctx);
        assert_eq!(line, "-");
    }

    #[test]
    fn test_suppression_mask() {
        // suppress 2xx and 4xx
        let mask = (1 << 2) | (1 << 4);
        assert!(suppressed(mask, 200));
        assert!(suppressed(mask, 404));
        assert!(!suppressed(mask, 500));
        assert!(!suppressed(mask, 301));
        assert!(!suppressed(0, 200));
    }
}
