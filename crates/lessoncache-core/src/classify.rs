//! URL classification into resource classes.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::{Request, RequestMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    StaticAsset,
    LargeBinaryAsset,
    ContentResource,
    ApiCall,
    Navigation,
    Default,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::StaticAsset => write!(f, "static"),
            ResourceClass::LargeBinaryAsset => write!(f, "large-binary"),
            ResourceClass::ContentResource => write!(f, "content"),
            ResourceClass::ApiCall => write!(f, "api"),
            ResourceClass::Navigation => write!(f, "navigation"),
            ResourceClass::Default => write!(f, "default"),
        }
    }
}

/// URL shapes for each resource class. Extensions include the leading dot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoutePatterns {
    pub static_extensions: Vec<String>,
    pub large_binary_extensions: Vec<String>,
    pub content_prefixes: Vec<String>,
    pub api_prefixes: Vec<String>,
}

impl Default for RoutePatterns {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            static_extensions: strings(&[
                ".js", ".mjs", ".css", ".png", ".jpg", ".jpeg", ".svg", ".ico", ".woff",
                ".woff2", ".webmanifest",
            ]),
            large_binary_extensions: strings(&[".wasm", ".mp4", ".webm", ".zip"]),
            content_prefixes: strings(&["/lessons/", "/content/"]),
            api_prefixes: strings(&["/api/"]),
        }
    }
}

/// Maps requests to resource classes. Pure and total.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    routes: RoutePatterns,
}

impl Classifier {
    pub fn new(routes: RoutePatterns) -> Self {
        Self { routes }
    }

    /// Classify by URL shape alone. First match wins, in the order
    /// static extension, large-binary extension, content prefix, API prefix.
    pub fn classify(&self, url: &Url) -> ResourceClass {
        let path = url.path().to_ascii_lowercase();

        if has_extension(&path, &self.routes.static_extensions) {
            ResourceClass::StaticAsset
        } else if has_extension(&path, &self.routes.large_binary_extensions) {
            ResourceClass::LargeBinaryAsset
        } else if has_prefix(&path, &self.routes.content_prefixes) {
            ResourceClass::ContentResource
        } else if has_prefix(&path, &self.routes.api_prefixes) {
            ResourceClass::ApiCall
        } else {
            ResourceClass::Default
        }
    }

    /// Classify an intercepted request. Navigation mode is only consulted
    /// once the URL-based checks found nothing.
    pub fn classify_request(&self, request: &Request) -> ResourceClass {
        match self.classify(&request.url) {
            ResourceClass::Default if request.mode == RequestMode::Navigate => {
                ResourceClass::Navigation
            }
            class => class,
        }
    }
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    extensions
        .iter()
        .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}

fn has_prefix(path: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|prefix| path.starts_with(&prefix.to_ascii_lowercase()))
}
