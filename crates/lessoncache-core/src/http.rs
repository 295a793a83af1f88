//! Request and response types seen by the proxy.
//!
//! These are deliberately small: the proxy only needs the method, URL,
//! request mode and headers of an intercepted request, and the status,
//! headers and body of a response.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Header attached to synthetic responses so hosts can tell them apart.
pub const MARKER_HEADER: &str = "x-lessoncache";

/// Status of the synthetic "resource unavailable" response.
pub const UNAVAILABLE_STATUS: u16 = 408;

const UNAVAILABLE_BODY: &str = "Resource unavailable offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    #[default]
    Normal,
    /// Top-level document navigation
    Navigate,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Normal,
            headers: Vec::new(),
        }
    }

    /// A navigation request, accepting HTML the way a browser would.
    pub fn navigate(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Navigate,
            headers: vec![("accept".to_string(), "text/html,*/*;q=0.8".to_string())],
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Whether the caller would render an HTML document.
    pub fn accepts_html(&self) -> bool {
        self.mode == RequestMode::Navigate
            || self
                .header("accept")
                .is_some_and(|accept| accept.contains("text/html"))
    }
}

/// A response, either received from the network or stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The fixed response served when every option is exhausted.
    pub fn unavailable() -> Self {
        Self::new(UNAVAILABLE_STATUS, UNAVAILABLE_BODY)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_header(MARKER_HEADER, "unavailable")
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == UNAVAILABLE_STATUS && self.header(MARKER_HEADER) == Some("unavailable")
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Identity of a stored entry. Only GET requests are ever cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Key for a GET of `url`. Fragments never reach the network, so they
    /// are not part of the identity.
    pub fn get(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: Method::GET.to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Option<Self> {
        request.is_get().then(|| Self::get(&request.url))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_cache_key_ignores_fragment() {
        let a = CacheKey::get(&url("https://example.com/lessons/1#intro"));
        let b = CacheKey::get(&url("https://example.com/lessons/1"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/lessons/1");
    }

    #[test]
    fn test_cache_key_only_for_get() {
        let mut request = Request::get(url("https://example.com/api/progress"));
        assert!(CacheKey::for_request(&request).is_some());

        request.method = Method::POST;
        assert!(CacheKey::for_request(&request).is_none());
    }

    #[test]
    fn test_accepts_html() {
        assert!(Request::navigate(url("https://example.com/")).accepts_html());
        assert!(!Request::get(url("https://example.com/app.js")).accepts_html());
        assert!(Request::get(url("https://example.com/page"))
            .with_header("Accept", "text/html")
            .accepts_html());
    }

    #[test]
    fn test_unavailable_is_marked() {
        let response = Response::unavailable();
        assert!(response.is_unavailable());
        assert!(!response.is_success());
        assert!(!Response::new(408, "timeout from origin").is_unavailable());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = Response::new(200, "ok").with_header("Content-Type", "text/css");
        assert_eq!(response.header("content-type"), Some("text/css"));
    }
}
