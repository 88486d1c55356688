//! The request being bootstrapped and the response built for it.

use crate::config::{DEFAULT_HOST, DEFAULT_SCRIPT_NAME};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use url::Url;

/// Protocols allowed in links when the `filter_allowed_protocols` variable is unset.
pub const DEFAULT_ALLOWED_PROTOCOLS: &[&str] = &[
    "ftp", "http", "https", "irc", "mailto", "news", "nntp", "rtsp", "sftp", "ssh", "tel",
    "telnet", "webcal",
];

static LEADING_CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\p{C}").expect("valid regex"));

/// Incoming request data. Header names are stored lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// Path and query string as sent by the client.
    pub uri: String,
    pub protocol: String,
    pub script_name: String,
    pub https: bool,
    pub remote_addr: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub query: Map<String, Value>,
    pub post: Map<String, Value>,
    /// Command line invocation rather than a web request.
    pub cli: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self::get("/")
    }
}

impl Request {
    /// A GET request for `uri` on the default host.
    pub fn get(uri: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), DEFAULT_HOST.to_string());
        Self {
            method: "GET".to_string(),
            uri: uri.to_string(),
            protocol: "HTTP/1.1".to_string(),
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            https: false,
            remote_addr: "127.0.0.1".to_string(),
            headers,
            cookies: BTreeMap::new(),
            query: parse_query(uri),
            post: Map::new(),
            cli: false,
        }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_host(self, host: &str) -> Self {
        self.with_header("host", host)
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_post(mut self, name: &str, value: Value) -> Self {
        self.post.insert(name.to_string(), value);
        self
    }

    pub fn with_remote_addr(mut self, addr: &str) -> Self {
        self.remote_addr = addr.to_string();
        self
    }

    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    pub fn with_cli(mut self, cli: bool) -> Self {
        self.cli = cli;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Host header; empty when the client sent none.
    pub fn host(&self) -> &str {
        self.header("host").unwrap_or_default()
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn query_str(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(Value::as_str)
    }

    pub fn is_get_or_head(&self) -> bool {
        self.method == "GET" || self.method == "HEAD"
    }

    pub fn is_xml_http_request(&self) -> bool {
        self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    /// Internal path: the `q` parameter, or the URI path without its leading slash.
    pub fn path(&self) -> String {
        if let Some(q) = self.query_str("q") {
            return q.trim_matches('/').to_string();
        }
        let path = self.uri.split(['?', '#']).next().unwrap_or_default();
        let script = self.script_name.trim_start_matches('/');
        let path = path.trim_start_matches('/');
        let path = path.strip_prefix(script).unwrap_or(path);
        path.trim_matches('/').to_string()
    }
}

/// Decode the query string of a request URI.
pub fn parse_query(uri: &str) -> Map<String, Value> {
    let Ok(url) = Url::parse("http://request.invalid").and_then(|base| base.join(uri)) else {
        return Map::new();
    };
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}

/// Remove keys starting with `#` from a request parameter map, recursively.
/// Whitelisted keys are kept; removed keys are appended to `removed`.
pub fn strip_dangerous_keys(map: &mut Map<String, Value>, whitelist: &[String], removed: &mut Vec<String>) {
    map.retain(|key, _| {
        let dangerous = key.starts_with('#') && !whitelist.iter().any(|w| w == key);
        if dangerous {
            removed.push(key.clone());
        }
        !dangerous
    });
    for value in map.values_mut() {
        strip_dangerous_values(value, whitelist, removed);
    }
}

fn strip_dangerous_values(value: &mut Value, whitelist: &[String], removed: &mut Vec<String>) {
    match value {
        Value::Object(map) => strip_dangerous_keys(map, whitelist, removed),
        Value::Array(items) => {
            for item in items {
                strip_dangerous_values(item, whitelist, removed);
            }
        }
        _ => {}
    }
}

/// Remove NUL bytes from every string in a parameter map.
pub fn strip_nul_bytes(map: &mut Map<String, Value>) {
    fn clean(value: &mut Value) {
        match value {
            Value::String(s) if s.contains('\0') => s.retain(|c| c != '\0'),
            Value::Object(map) => map.values_mut().for_each(clean),
            Value::Array(items) => items.iter_mut().for_each(clean),
            _ => {}
        }
    }
    map.values_mut().for_each(clean);
}

/// Whether a path or URL leads off-site.
///
/// Backslashes count as slashes, protocol-relative URLs and leading control
/// characters are external, and a scheme counts only when it is one of
/// `allowed_protocols`.
pub fn url_is_external(path: &str, allowed_protocols: &[String]) -> bool {
    let path = path.replace('\\', "/");
    if path.starts_with("//") || LEADING_CONTROL.is_match(&path) {
        return true;
    }
    let Some(colon) = path.find(':') else {
        return false;
    };
    let scheme = &path[..colon];
    !scheme.contains(['/', '?', '#'])
        && allowed_protocols
            .iter()
            .any(|p| p.eq_ignore_ascii_case(scheme))
}

/// The response built while bootstrapping.
///
/// Header names keep the case they were first set with; lookups ignore case.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    /// Lowercase names of headers that only hold a default value.
    defaulted: Vec<String>,
    pub body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
            defaulted: Vec::new(),
            body: String::new(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: u16, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
    }

    /// `HTTP/1.1 200 OK` style status line.
    pub fn status_line(&self, protocol: &str) -> String {
        format!("{} {} {}", protocol, self.status, self.reason)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header, in the order they were added.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Set a header, replacing every existing value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        self.defaulted.retain(|n| !n.eq_ignore_ascii_case(name));
        match self
            .headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                let preferred = self.headers[idx].0.clone();
                self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
                self.headers.insert(idx.min(self.headers.len()), (preferred, value));
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Add a header value without replacing existing ones.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.defaulted.retain(|n| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Set a header only if it is not present yet.
    pub fn set_default_header(&mut self, name: &str, value: impl Into<String>) {
        if !self.has_header(name) {
            self.headers.push((name.to_string(), value.into()));
            self.defaulted.push(name.to_ascii_lowercase());
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.defaulted.retain(|n| !n.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Headers set explicitly rather than as defaults.
    pub fn explicit_headers(&self) -> impl Iterator<Item = &(String, String)> {
        self.headers
            .iter()
            .filter(|(n, _)| !self.defaulted.iter().any(|d| d.eq_ignore_ascii_case(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let query = parse_query("/node?q=user/login&destination=http%3A%2F%2Fexample.com");
        assert_eq!(query["q"], Value::String("user/login".to_string()));
        assert_eq!(
            query["destination"],
            Value::String("http://example.com".to_string())
        );
        assert!(parse_query("/").is_empty());
    }

    #[test]
    fn test_request_path() {
        assert_eq!(Request::get("/node/1?x=1").path(), "node/1");
        assert_eq!(Request::get("/index.php?q=admin/").path(), "admin");
        assert_eq!(Request::get("/").path(), "");
    }

    #[test]
    fn test_request_header_lookup_ignores_case() {
        let request = Request::get("/").with_header("X-Requested-With", "XMLHttpRequest");
        assert!(request.is_xml_http_request());
        assert_eq!(request.host(), DEFAULT_HOST);
    }

    #[test]
    fn test_response_set_header_replaces_case_insensitively() {
        let mut response = Response::new();
        response.set_header("Cache-Control", "no-cache");
        response.append_header("Vary", "Cookie");
        response.set_header("cache-control", "public");
        assert_eq!(response.header("CACHE-CONTROL"), Some("public"));
        assert_eq!(response.headers()[0].0, "Cache-Control");
        assert_eq!(response.headers().len(), 2);
    }

    #[test]
    fn test_response_defaults_do_not_override() {
        let mut response = Response::new();
        response.set_header("X-Frame-Options", "DENY");
        response.set_default_header("x-frame-options", "SAMEORIGIN");
        assert_eq!(response.header("X-Frame-Options"), Some("DENY"));

        response.append_header("Vary", "Cookie");
        response.append_header("Vary", "Accept-Encoding");
        assert_eq!(response.header_values("vary"), vec!["Cookie", "Accept-Encoding"]);
    }

    #[test]
    fn test_explicit_headers_skip_defaults() {
        let mut response = Response::new();
        response.set_default_header("Expires", "Sun, 19 Nov 1978 05:00:00 GMT");
        response.set_default_header("Cache-Control", "no-cache");
        response.set_header("Content-Type", "text/html");
        response.set_header("cache-control", "public");

        let names: Vec<&str> = response
            .explicit_headers()
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(names, vec!["Cache-Control", "Content-Type"]);
        assert_eq!(response.headers().len(), 3);
    }

    fn protocols() -> Vec<String> {
        DEFAULT_ALLOWED_PROTOCOLS.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_url_is_external() {
        let allowed = protocols();
        assert!(url_is_external("http://example.com", &allowed));
        assert!(url_is_external("//example.com/x", &allowed));
        assert!(url_is_external("\\\\example.com", &allowed));
        assert!(url_is_external("\u{1}http://x", &allowed));
        assert!(!url_is_external("node/1", &allowed));
        assert!(!url_is_external("node/1?x=a:b", &allowed));
        assert!(!url_is_external("javascript:alert(1)", &allowed));
    }

    #[test]
    fn test_strip_dangerous_keys() {
        let mut map = serde_json::json!({
            "#markup": "x",
            "safe": {"#attached": 1, "ok": 2},
            "list": [{"#type": "a"}],
            "#allowed": true,
        })
        .as_object()
        .cloned()
        .unwrap();
        let mut removed = Vec::new();
        strip_dangerous_keys(&mut map, &["#allowed".to_string()], &mut removed);
        removed.sort();
        assert_eq!(removed, vec!["#attached", "#markup", "#type"]);
        assert!(map.contains_key("#allowed"));
        assert_eq!(map["safe"], serde_json::json!({"ok": 2}));
    }

    #[test]
    fn test_strip_nul_bytes() {
        let mut map = Map::new();
        map.insert("q".to_string(), Value::String("no\0de".to_string()));
        strip_nul_bytes(&mut map);
        assert_eq!(map["q"], "node");
    }

    #[test]
    fn test_status_line() {
        let mut response = Response::new();
        response.set_status(500, "Service unavailable (with message)");
        assert_eq!(
            response.status_line("HTTP/1.1"),
            "HTTP/1.1 500 Service unavailable (with message)"
        );
    }
}
