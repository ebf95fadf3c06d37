//! Cross-module integration tests: configuration to runtime behavior,
//! without sockets.

use std::io::Write;
use std::net::IpAddr;

use gantry::config::Config;
use gantry::http::HttpRequest;
use gantry::proxy::Proxy;
use gantry::BalancerAlgorithm;

fn peer() -> IpAddr {
    "198.51.100.23".parse().unwrap()
}

fn request(line: &str, headers: &[&str]) -> HttpRequest {
    let mut req = HttpRequest::parse(line.to_string(), 4).unwrap();
    for header in headers {
        req.headers.append(header.to_string());
    }
    req
}

#[tokio::test]
async fn test_condition_tree_from_config() {
    let config = Config::from_str(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "internal-api"

[[listeners.services.match]]
type = "bool"
op = "and"

[[listeners.services.match.children]]
type = "acl"
cidrs = ["198.51.100.0/24"]

[[listeners.services.match.children]]
type = "bool"
op = "or"

[[listeners.services.match.children.children]]
type = "path"
pattern = "^/api/"

[[listeners.services.match.children.children]]
type = "query_param"
name = "mode"
pattern = "^api$"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
"#,
    )
    .unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();

    let mut req = request("GET /api/v1/users HTTP/1.1", &["Host: x"]);
    assert!(service.matches(&mut req, peer()));

    let mut req = request("GET /web?mode=api HTTP/1.1", &["Host: x"]);
    assert!(service.matches(&mut req, peer()));

    let mut req = request("GET /web HTTP/1.1", &["Host: x"]);
    assert!(!service.matches(&mut req, peer()));

    // wrong source network fails the AND even for a matching path
    let outsider: IpAddr = "203.0.113.5".parse().unwrap();
    let mut req = request("GET /api/v1/users HTTP/1.1", &["Host: x"]);
    assert!(!service.matches(&mut req, outsider));
}

#[tokio::test]
async fn test_pattern_file_condition() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# blocked prefixes").unwrap();
    writeln!(file, "/private/").unwrap();
    writeln!(file, "/secret/").unwrap();
    file.flush().unwrap();

    let config = format!(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "blocked"

[[listeners.services.match]]
type = "path"
kind = "prefix"
file = "{}"

[[listeners.services.backends]]
type = "error"
status = 403
body = "no"
"#,
        file.path().display()
    );
    let config = Config::from_str(&config).unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();

    let mut req = request("GET /private/x HTTP/1.1", &[]);
    assert!(service.matches(&mut req, peer()));
    let mut req = request("GET /secret/y HTTP/1.1", &[]);
    assert!(service.matches(&mut req, peer()));
    let mut req = request("GET /public/z HTTP/1.1", &[]);
    assert!(!service.matches(&mut req, peer()));
}

#[tokio::test]
async fn test_basic_auth_condition_from_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "admin:letmein").unwrap();
    file.flush().unwrap();

    let config = format!(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "protected"

[[listeners.services.match]]
type = "basic_auth"
file = "{}"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
"#,
        file.path().display()
    );
    let config = Config::from_str(&config).unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();

    let mut req = request("GET / HTTP/1.1", &[]);
    assert!(!service.matches(&mut req, peer()));

    req.user = Some("admin".to_string());
    req.password = Some("letmein".to_string());
    assert!(service.matches(&mut req, peer()));

    req.password = Some("wrong".to_string());
    assert!(!service.matches(&mut req, peer()));
}

#[tokio::test]
async fn test_iwrr_distribution_through_service() {
    let config = Config::from_str(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "weighted"
algorithm = "iwrr"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
priority = 1

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.2:8000"
priority = 3
"#,
    )
    .unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();
    assert_eq!(service.algorithm, BalancerAlgorithm::Iwrr);

    let req = request("GET / HTTP/1.1", &[]);
    let mut light = 0u32;
    let mut heavy = 0u32;
    for _ in 0..400 {
        let backend = service.select_backend(&req, peer(), None).await.unwrap();
        match backend.label().as_str() {
            "10.0.0.1:8000" => light += 1,
            "10.0.0.2:8000" => heavy += 1,
            other => panic!("unexpected backend {}", other),
        }
    }
    // 400 selections over weights 1:3, full cycles, so exact counts
    assert_eq!(light, 100);
    assert_eq!(heavy, 300);
}

#[tokio::test]
async fn test_rewrite_rules_from_config() {
    let config = Config::from_str(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "app"

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"

[[listeners.services.rewrite_request]]
[listeners.services.rewrite_request.cond]
type = "header"
pattern = "^X-Legacy-Client:"

[[listeners.services.rewrite_request.ops]]
op = "set_query_param"
name = "compat"
value = "1"

[[listeners.services.rewrite_request.ops]]
op = "delete_header"
pattern = "^X-Legacy-Client:"

[[listeners.services.rewrite_request.else]]
op = "set_header"
value = "X-Modern: yes"
"#,
    )
    .unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();

    let mut req = request("GET /app HTTP/1.1", &["X-Legacy-Client: 9.2"]);
    for rule in &service.rewrite_request {
        rule.apply_request(&mut req, peer());
    }
    assert_eq!(req.url(), "/app?compat=1");
    assert!(req.headers.value_of_name("X-Legacy-Client").is_none());
    assert!(req.headers.value_of_name("X-Modern").is_none());

    let mut req = request("GET /app HTTP/1.1", &[]);
    for rule in &service.rewrite_request {
        rule.apply_request(&mut req, peer());
    }
    assert_eq!(req.url(), "/app");
    assert_eq!(req.headers.value_of_name("X-Modern"), Some("yes"));
}

#[test]
fn test_header_roundtrip_preserves_order_and_text() {
    // parse -> serialize keeps names, values and order verbatim
    let lines = [
        "Host:   spaced.example.org",
        "X-First: 1",
        "x-second: two",
        "X-First: duplicate kept",
        "Referer: http://a/b?c=d",
    ];
    let mut req = request("GET /path%20here?q=1 HTTP/1.1", &lines);

    let serialized: Vec<&str> = req.headers.iter().map(|h| h.text()).collect();
    assert_eq!(serialized, lines);
    assert_eq!(req.request_line(), "GET /path%20here?q=1 HTTP/1.1");

    // rewriting the target regenerates the line but not the headers
    req.set_query_param("q", "2");
    assert_eq!(req.request_line(), "GET /path%20here?q=2 HTTP/1.1");
    let serialized: Vec<&str> = req.headers.iter().map(|h| h.text()).collect();
    assert_eq!(serialized, lines);
}

#[tokio::test]
async fn test_log_suppress_mask_built() {
    let config = Config::from_str(
        r#"
[[listeners]]
bind = "127.0.0.1:0"

[[listeners.services]]
name = "quiet"
log_suppress = ["2xx", "3xx"]

[[listeners.services.backends]]
type = "regular"
address = "10.0.0.1:8000"
"#,
    )
    .unwrap();
    let (proxy, _) = Proxy::from_config(&config).unwrap();
    let service = proxy.service_at(0, 0).unwrap();
    assert!(gantry::logfmt::suppressed(service.log_suppress, 200));
    assert!(gantry::logfmt::suppressed(service.log_suppress, 301));
    assert!(!gantry::logfmt::suppressed(service.log_suppress, 404));
    assert!(!gantry::logfmt::suppressed(service.log_suppress, 500));
}
