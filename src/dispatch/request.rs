use std::path::{Path, PathBuf};

use http::{HeaderMap, Method};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use tokio::sync::oneshot;

use crate::cache::{data_file_path, CacheKey, ItemType, ResponseFile};

pub static REGEX_LAYER: Lazy<Regex> =
    Lazy::new(|| Regex::new("^/.*/blobs/sha256:(.+)$").expect("layer path regex"));
pub static REGEX_MANIFEST: Lazy<Regex> =
    Lazy::new(|| Regex::new("^/.*/manifests/sha256:(.+)$").expect("manifest path regex"));

/// Digest and item type of a content-addressed request path, when it is one.
pub fn classify_path(path: &str) -> Option<(ItemType, &str)> {
    if let Some(caps) = REGEX_LAYER.captures(path) {
        return caps.get(1).map(|m| (ItemType::Layer, m.as_str()));
    }
    if let Some(caps) = REGEX_MANIFEST.captures(path) {
        return caps.get(1).map(|m| (ItemType::Manifest, m.as_str()));
    }
    None
}

/// The cacheable identity of a request: its digest, item type, and the data
/// file the body would live in.
#[derive(Debug, Clone)]
pub struct CacheTarget {
    pub key: CacheKey,
    pub item: ItemType,
    pub datafile: PathBuf,
}

/// One unit of work on the dispatcher queue. `target` is `Some` exactly for
/// content-addressed GETs; everything else is passed through. The upstream
/// URL is already rewritten by the router. The body and the reply channel are
/// each consumed at most once, which re-enqueueing preserves since the whole
/// request moves back onto the queue.
pub struct CacheRequest {
    pub target: Option<CacheTarget>,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<reqwest::Body>,
    pub reply: Option<oneshot::Sender<CacheResponse>>,
}

impl CacheRequest {
    pub fn new(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<reqwest::Body>,
        data_dir: &Path,
    ) -> (Self, oneshot::Receiver<CacheResponse>) {
        let (tx, rx) = oneshot::channel();
        let target = if method == Method::GET {
            classify_path(url.path()).map(|(item, digest)| CacheTarget {
                key: CacheKey::new(digest),
                item,
                datafile: data_file_path(data_dir, digest, item),
            })
        } else {
            None
        };
        (
            Self {
                target,
                method,
                url,
                headers,
                body,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn cache_enabled(&self) -> bool {
        self.target.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cache,
    Upstream,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Cache => "cache",
            Origin::Upstream => "upstream",
        }
    }
}

/// What a worker hands back to the router, exactly once per request.
pub struct CacheResponse {
    pub origin: Origin,
    pub payload: ResponsePayload,
}

pub enum ResponsePayload {
    /// Live upstream response, streamed through verbatim.
    Upstream(reqwest::Response),
    /// Replay of a cached object.
    CacheHit {
        meta: ResponseFile,
        body: tokio::fs::File,
    },
    /// Synthesized reply when the upstream itself is unreachable.
    BadGateway,
}

pub const BAD_GATEWAY_BODY: &str = "Upstream is broken mate!";

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, url: &str) -> CacheRequest {
        let url = Url::parse(url).unwrap();
        let (cr, _rx) = CacheRequest::new(
            method,
            url,
            HeaderMap::new(),
            None,
            Path::new("/data"),
        );
        cr
    }

    #[test]
    fn classifies_layer_and_manifest_gets() {
        let cr = request(Method::GET, "https://reg.local/v2/library/nginx/blobs/sha256:abc123");
        let target = cr.target.expect("layer GET should be cacheable");
        assert_eq!(target.item, ItemType::Layer);
        assert_eq!(target.key.as_str(), "abc123");
        assert_eq!(target.datafile, PathBuf::from("/data/abc123.layer"));

        let cr = request(
            Method::GET,
            "https://reg.local/v2/library/nginx/manifests/sha256:def456",
        );
        let target = cr.target.expect("manifest GET should be cacheable");
        assert_eq!(target.item, ItemType::Manifest);
        assert_eq!(target.datafile, PathBuf::from("/data/def456.manifest"));
    }

    #[test]
    fn non_get_methods_are_never_cacheable() {
        let cr = request(Method::HEAD, "https://reg.local/v2/x/blobs/sha256:abc123");
        assert!(!cr.cache_enabled());

        let cr = request(Method::POST, "https://reg.local/v2/x/blobs/sha256:abc123");
        assert!(!cr.cache_enabled());
    }

    #[test]
    fn unrelated_paths_pass_through() {
        assert!(classify_path("/v2/").is_none());
        assert!(classify_path("/v2/x/tags/list").is_none());
        assert!(classify_path("/v2/x/manifests/latest").is_none());
        assert!(classify_path("/v2/x/blobs/uploads/").is_none());

        let cr = request(Method::GET, "https://reg.local/v2/x/manifests/latest");
        assert!(!cr.cache_enabled());
    }

    #[test]
    fn tag_references_are_not_digests() {
        // only sha256-addressed references are content addressed
        assert!(classify_path("/v2/x/manifests/sha256:").is_none());
        assert_eq!(
            classify_path("/v2/x/manifests/sha256:ff00"),
            Some((ItemType::Manifest, "ff00"))
        );
    }
}
